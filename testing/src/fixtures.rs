use crate::mocks::test_clock;
use commandeer_core::command::{Command, CommandCategory, CorrelationChain};
use commandeer_core::environment::Clock;
use commandeer_core::registry::CommandRegistration;
use commandeer_core::{Event, EventData};
use serde_json::Value;

/// Bounded context used by fixtures that don't name one.
pub const DEFAULT_CONTEXT: &str = "orders";

/// An aggregate command in [`DEFAULT_CONTEXT`] with a root chain at test time.
#[must_use]
pub fn command(id: &str, command_type: &str, args: Value) -> Command {
    Command::new(
        id,
        command_type,
        DEFAULT_CONTEXT,
        CommandCategory::Aggregate,
        args,
        &test_clock(),
    )
}

/// A command shaped by its registration.
#[must_use]
pub fn command_for(registration: &CommandRegistration, id: &str, args: Value) -> Command {
    Command::new(
        id,
        registration.command_type.as_str(),
        registration.bounded_context.as_str(),
        registration.category,
        args,
        &test_clock(),
    )
}

/// Stamp `data` as if a root command `cmd-fixture` produced it.
#[must_use]
pub fn event(data: EventData) -> Event {
    let clock = test_clock();
    let chain = CorrelationChain::root("cmd-fixture", clock.now());
    data.stamp(&chain, clock.now())
}
