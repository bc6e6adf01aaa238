//! Ordered interceptor chain around command handler invocation.
//!
//! Middlewares are sorted ascending by [`Middleware::order`]. For one command:
//!
//! 1. Before-hooks run in ascending order. Each either continues with a
//!    (possibly modified) [`MiddlewareContext`] or short-circuits with a
//!    terminal [`HandlerResult`]. A before-hook error also short-circuits, as a
//!    `MIDDLEWARE_ERROR` rejection.
//! 2. On short-circuit the handler never runs, and after-hooks run in reverse
//!    order only for the middlewares whose before-hook already completed.
//! 3. Otherwise the handler runs. A handler error becomes a `HANDLER_ERROR`
//!    rejection.
//! 4. After-hooks run in reverse order and may replace the result. An
//!    after-hook error is swallowed (and reported, if a reporter is set); the
//!    result from before that hook is kept.

use crate::metrics::MiddlewareMetrics;
use commandeer_core::command::{Command, CommandCategory, CorrelationChain};
use commandeer_core::registry::CommandRegistration;
use commandeer_core::{BoxFuture, HandlerResult, codes};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;
use thiserror::Error;

mod builtin;

pub use builtin::{LoggingMiddleware, ValidationMiddleware, Validator};

/// Well-known orders for built-in and typical middlewares.
pub mod order {
    /// Logging wraps everything else.
    pub const LOGGING: i32 = 0;
    /// Input validation runs before authorization and domain middlewares.
    pub const VALIDATION: i32 = 10;
    /// Order used when a middleware does not override [`super::Middleware::order`].
    pub const DEFAULT: i32 = 100;
}

/// Well-known [`MiddlewareContext`] extension keys.
pub mod keys {
    /// Acting user id (string).
    pub const USER_ID: &str = "user_id";
    /// Tenant id (string).
    pub const TENANT_ID: &str = "tenant_id";
    /// Inbound request id (string).
    pub const REQUEST_ID: &str = "request_id";
}

/// Errors raised while managing a pipeline.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MiddlewareError {
    /// A middleware with this name is already registered.
    #[error("Middleware '{0}' is already registered")]
    Duplicate(String),
}

/// Per-command context threaded through every hook and into the handler.
#[derive(Clone, Debug, PartialEq)]
pub struct MiddlewareContext {
    /// Id of the command being executed.
    pub command_id: String,
    /// Type of the command being executed.
    pub command_type: String,
    /// Bounded context owning the command.
    pub bounded_context: String,
    /// Command category.
    pub category: CommandCategory,
    /// Correlation chain of the command.
    pub chain: CorrelationChain,
    /// Registration resolved for the command type, if any.
    pub registration: Option<CommandRegistration>,
    /// Free-form values set by callers and middlewares. See [`keys`].
    pub extensions: BTreeMap<String, Value>,
}

impl MiddlewareContext {
    /// Build the initial context for a command.
    #[must_use]
    pub fn for_command(command: &Command, registration: Option<CommandRegistration>) -> Self {
        let mut extensions = BTreeMap::new();
        if let Some(user_id) = &command.chain.user_id {
            extensions.insert(keys::USER_ID.to_string(), Value::String(user_id.clone()));
        }
        Self {
            command_id: command.id.clone(),
            command_type: command.command_type.clone(),
            bounded_context: command.bounded_context.clone(),
            category: command.category,
            chain: command.chain.clone(),
            registration,
            extensions,
        }
    }

    /// Set an extension value.
    #[must_use]
    pub fn with_extension(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extensions.insert(key.into(), value.into());
        self
    }

    /// Set an extension value in place.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.extensions.insert(key.into(), value.into());
    }

    /// Read an extension value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.extensions.get(key)
    }

    /// Read a string extension value.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.extensions.get(key).and_then(Value::as_str)
    }

    /// Remove an extension value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.extensions.remove(key)
    }

    /// Acting user: the `user_id` extension, else the chain's user.
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.get_str(keys::USER_ID)
            .or(self.chain.user_id.as_deref())
    }

    /// The `tenant_id` extension.
    #[must_use]
    pub fn tenant_id(&self) -> Option<&str> {
        self.get_str(keys::TENANT_ID)
    }

    /// The `request_id` extension.
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        self.get_str(keys::REQUEST_ID)
    }
}

/// What a before-hook decided.
#[derive(Clone, Debug, PartialEq)]
pub enum BeforeOutcome {
    /// Continue with this context.
    Continue(MiddlewareContext),
    /// Stop here with a terminal result; the handler will not run.
    ShortCircuit(HandlerResult),
}

/// A named interceptor around handler invocation.
///
/// Both hooks are optional; the defaults continue unchanged and pass the
/// result through.
pub trait Middleware: Send + Sync {
    /// Unique name within a pipeline.
    fn name(&self) -> &str;

    /// Sort key; lower runs its before-hook earlier and its after-hook later.
    fn order(&self) -> i32 {
        order::DEFAULT
    }

    /// Runs before the handler.
    ///
    /// # Errors
    ///
    /// An error short-circuits the command with `MIDDLEWARE_ERROR`.
    fn before<'a>(
        &'a self,
        _command: &'a Command,
        context: MiddlewareContext,
    ) -> BoxFuture<'a, anyhow::Result<BeforeOutcome>> {
        Box::pin(async move { Ok(BeforeOutcome::Continue(context)) })
    }

    /// Runs after the handler (or after a later short-circuit).
    ///
    /// # Errors
    ///
    /// An error is swallowed; the result passed in is kept.
    fn after<'a>(
        &'a self,
        _command: &'a Command,
        _context: &'a MiddlewareContext,
        result: HandlerResult,
    ) -> BoxFuture<'a, anyhow::Result<HandlerResult>> {
        Box::pin(async move { Ok(result) })
    }
}

/// Callback invoked with `(middleware name, command, error)` when an
/// after-hook fails.
pub type AfterErrorReporter = Arc<dyn Fn(&str, &Command, &anyhow::Error) + Send + Sync>;

/// What [`MiddlewarePipeline::execute`] produced.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineOutcome {
    /// Final result after every after-hook.
    pub result: HandlerResult,
    /// Context as last seen by the handler or the short-circuit point.
    pub context: MiddlewareContext,
    /// Whether the handler was invoked.
    pub handler_invoked: bool,
    /// Name of the middleware that short-circuited, if any.
    pub short_circuited_by: Option<String>,
}

/// Ordered middleware chain.
///
/// Registration is interior-mutable so a shared pipeline can be extended at
/// runtime; sorting happens lazily on the next execution.
pub struct MiddlewarePipeline {
    middlewares: RwLock<Vec<Arc<dyn Middleware>>>,
    sorted: AtomicBool,
    reporter: Option<AfterErrorReporter>,
}

impl Default for MiddlewarePipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MiddlewarePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewarePipeline")
            .field("middlewares", &self.names())
            .field("has_reporter", &self.reporter.is_some())
            .finish()
    }
}

impl MiddlewarePipeline {
    /// Create an empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self {
            middlewares: RwLock::new(Vec::new()),
            sorted: AtomicBool::new(true),
            reporter: None,
        }
    }

    /// Report after-hook errors to `reporter`.
    #[must_use]
    pub fn with_after_error_reporter(mut self, reporter: AfterErrorReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Register a middleware.
    ///
    /// # Errors
    ///
    /// Returns [`MiddlewareError::Duplicate`] if the name is taken.
    pub fn add(&self, middleware: Arc<dyn Middleware>) -> Result<(), MiddlewareError> {
        let mut middlewares = self
            .middlewares
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if middlewares.iter().any(|m| m.name() == middleware.name()) {
            return Err(MiddlewareError::Duplicate(middleware.name().to_string()));
        }
        tracing::debug!(
            middleware = middleware.name(),
            order = middleware.order(),
            "Registered middleware"
        );
        middlewares.push(middleware);
        self.sorted.store(false, Ordering::Release);
        Ok(())
    }

    /// Register a middleware, builder style.
    ///
    /// # Errors
    ///
    /// Returns [`MiddlewareError::Duplicate`] if the name is taken.
    pub fn with(self, middleware: Arc<dyn Middleware>) -> Result<Self, MiddlewareError> {
        self.add(middleware)?;
        Ok(self)
    }

    /// Unregister a middleware by name. Returns whether one was removed.
    pub fn remove(&self, name: &str) -> bool {
        let mut middlewares = self
            .middlewares
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = middlewares.len();
        middlewares.retain(|m| m.name() != name);
        before != middlewares.len()
    }

    /// Whether a middleware with this name is registered.
    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.middlewares
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|m| m.name() == name)
    }

    /// Names in execution order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.ordered()
            .iter()
            .map(|m| m.name().to_string())
            .collect()
    }

    /// Number of registered middlewares.
    #[must_use]
    pub fn len(&self) -> usize {
        self.middlewares
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no middleware is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unregister every middleware.
    pub fn clear(&self) {
        self.middlewares
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.sorted.store(true, Ordering::Release);
    }

    /// Snapshot of the chain in execution order, sorting first if needed.
    fn ordered(&self) -> Vec<Arc<dyn Middleware>> {
        if !self.sorted.load(Ordering::Acquire) {
            let mut middlewares = self
                .middlewares
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            // Stable: equal orders keep registration order.
            middlewares.sort_by_key(|m| m.order());
            self.sorted.store(true, Ordering::Release);
        }
        self.middlewares
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run `handler` for `command` inside the chain.
    ///
    /// Never fails: hook and handler errors become rejection-shaped results.
    #[tracing::instrument(
        skip(self, command, context, handler),
        name = "middleware_pipeline",
        fields(command_id = %command.id, command_type = %command.command_type)
    )]
    pub async fn execute<F, Fut>(
        &self,
        command: &Command,
        context: MiddlewareContext,
        handler: F,
    ) -> PipelineOutcome
    where
        F: FnOnce(MiddlewareContext) -> Fut,
        Fut: Future<Output = anyhow::Result<HandlerResult>>,
    {
        let start = Instant::now();
        let chain = self.ordered();
        let mut context = context;
        let mut entered = 0;
        let mut short_circuit: Option<(String, HandlerResult)> = None;

        for middleware in &chain {
            match middleware.before(command, context.clone()).await {
                Ok(BeforeOutcome::Continue(next)) => {
                    context = next;
                    entered += 1;
                }
                Ok(BeforeOutcome::ShortCircuit(result)) => {
                    tracing::info!(
                        middleware = middleware.name(),
                        outcome = result.outcome(),
                        "Middleware short-circuited command"
                    );
                    short_circuit = Some((middleware.name().to_string(), result));
                    break;
                }
                Err(error) => {
                    tracing::warn!(
                        middleware = middleware.name(),
                        error = %error,
                        "Middleware before-hook failed"
                    );
                    let result = HandlerResult::rejected(
                        codes::MIDDLEWARE_ERROR,
                        format!("Middleware '{}' failed: {error}", middleware.name()),
                    );
                    short_circuit = Some((middleware.name().to_string(), result));
                    break;
                }
            }
        }

        let (mut result, handler_invoked, short_circuited_by) = match short_circuit {
            Some((name, result)) => {
                MiddlewareMetrics::record_short_circuit(&name);
                (result, false, Some(name))
            }
            None => {
                let result = match handler(context.clone()).await {
                    Ok(result) => result,
                    Err(error) => {
                        tracing::warn!(error = %error, "Command handler failed");
                        HandlerResult::rejected(codes::HANDLER_ERROR, error.to_string())
                    }
                };
                (result, true, None)
            }
        };

        for middleware in chain[..entered].iter().rev() {
            match middleware.after(command, &context, result.clone()).await {
                Ok(next) => result = next,
                Err(error) => {
                    tracing::error!(
                        middleware = middleware.name(),
                        error = %error,
                        "Middleware after-hook failed, keeping result"
                    );
                    MiddlewareMetrics::record_after_error(middleware.name());
                    if let Some(reporter) = &self.reporter {
                        reporter(middleware.name(), command, &error);
                    }
                }
            }
        }

        MiddlewareMetrics::record_pipeline(start.elapsed());

        PipelineOutcome {
            result,
            context,
            handler_invoked,
            short_circuited_by,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use commandeer_core::environment::SystemClock;
    use commandeer_core::{EventData, Version};
    use serde_json::json;
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recording {
        name: String,
        order: i32,
        log: Log,
        short_circuit: bool,
        fail_before: bool,
        fail_after: bool,
    }

    impl Recording {
        fn new(name: &str, order: i32, log: &Log) -> Self {
            Self {
                name: name.to_string(),
                order,
                log: Arc::clone(log),
                short_circuit: false,
                fail_before: false,
                fail_after: false,
            }
        }
    }

    impl Middleware for Recording {
        fn name(&self) -> &str {
            &self.name
        }

        fn order(&self) -> i32 {
            self.order
        }

        fn before<'a>(
            &'a self,
            _command: &'a Command,
            context: MiddlewareContext,
        ) -> BoxFuture<'a, anyhow::Result<BeforeOutcome>> {
            Box::pin(async move {
                self.log.lock().unwrap().push(format!("before:{}", self.name));
                if self.fail_before {
                    anyhow::bail!("boom");
                }
                if self.short_circuit {
                    return Ok(BeforeOutcome::ShortCircuit(HandlerResult::rejected(
                        "FORBIDDEN",
                        "not allowed",
                    )));
                }
                Ok(BeforeOutcome::Continue(
                    context.with_extension(format!("seen_{}", self.name), true),
                ))
            })
        }

        fn after<'a>(
            &'a self,
            _command: &'a Command,
            _context: &'a MiddlewareContext,
            result: HandlerResult,
        ) -> BoxFuture<'a, anyhow::Result<HandlerResult>> {
            Box::pin(async move {
                self.log.lock().unwrap().push(format!("after:{}", self.name));
                if self.fail_after {
                    anyhow::bail!("after boom");
                }
                Ok(result)
            })
        }
    }

    fn command() -> Command {
        Command::new(
            "cmd-1",
            "CreateOrder",
            "orders",
            CommandCategory::Aggregate,
            json!({"orderId": "o1"}),
            &SystemClock,
        )
    }

    fn success() -> HandlerResult {
        HandlerResult::success(
            json!({"orderId": "o1"}),
            Version::new(1),
            EventData::new("OrderCreated", "Order", "o1", "orders", json!({})),
        )
    }

    fn pipeline_with(middlewares: Vec<Recording>) -> MiddlewarePipeline {
        let pipeline = MiddlewarePipeline::new();
        for m in middlewares {
            pipeline.add(Arc::new(m)).unwrap();
        }
        pipeline
    }

    async fn run(pipeline: &MiddlewarePipeline, log: &Log) -> PipelineOutcome {
        let cmd = command();
        let ctx = MiddlewareContext::for_command(&cmd, None);
        let log = Arc::clone(log);
        pipeline
            .execute(&cmd, ctx, |_ctx| async move {
                log.lock().unwrap().push("handler".to_string());
                Ok(success())
            })
            .await
    }

    #[tokio::test]
    async fn hooks_run_in_order_around_handler() {
        let log: Log = Arc::default();
        // Registered out of order on purpose.
        let pipeline = pipeline_with(vec![
            Recording::new("c", 30, &log),
            Recording::new("a", 10, &log),
            Recording::new("b", 20, &log),
        ]);

        let outcome = run(&pipeline, &log).await;

        assert!(outcome.handler_invoked);
        assert_eq!(outcome.result, success());
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "before:a", "before:b", "before:c", "handler", "after:c", "after:b", "after:a"
            ]
        );
    }

    #[tokio::test]
    async fn short_circuit_skips_later_middlewares_and_handler() {
        let log: Log = Arc::default();
        let mut gate = Recording::new("b", 20, &log);
        gate.short_circuit = true;
        let pipeline = pipeline_with(vec![
            Recording::new("a", 10, &log),
            gate,
            Recording::new("c", 30, &log),
        ]);

        let outcome = run(&pipeline, &log).await;

        assert!(!outcome.handler_invoked);
        assert_eq!(outcome.short_circuited_by.as_deref(), Some("b"));
        assert_eq!(outcome.result, HandlerResult::rejected("FORBIDDEN", "not allowed"));
        assert_eq!(*log.lock().unwrap(), vec!["before:a", "before:b", "after:a"]);
    }

    #[tokio::test]
    async fn before_hook_error_becomes_middleware_error() {
        let log: Log = Arc::default();
        let mut broken = Recording::new("broken", 20, &log);
        broken.fail_before = true;
        let pipeline = pipeline_with(vec![Recording::new("a", 10, &log), broken]);

        let outcome = run(&pipeline, &log).await;

        assert!(!outcome.handler_invoked);
        match outcome.result {
            HandlerResult::Rejected { code, reason, .. } => {
                assert_eq!(code, codes::MIDDLEWARE_ERROR);
                assert!(reason.contains("broken"));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(*log.lock().unwrap(), vec!["before:a", "before:broken", "after:a"]);
    }

    #[tokio::test]
    async fn handler_error_becomes_handler_error() {
        let pipeline = MiddlewarePipeline::new();
        let cmd = command();
        let ctx = MiddlewareContext::for_command(&cmd, None);

        let outcome = pipeline
            .execute(&cmd, ctx, |_ctx| async { Err(anyhow::anyhow!("state unavailable")) })
            .await;

        assert!(outcome.handler_invoked);
        assert_eq!(
            outcome.result,
            HandlerResult::rejected(codes::HANDLER_ERROR, "state unavailable")
        );
    }

    #[tokio::test]
    async fn after_hook_error_is_swallowed_and_reported() {
        let log: Log = Arc::default();
        let reported: Arc<Mutex<Vec<String>>> = Arc::default();
        let reported_clone = Arc::clone(&reported);

        let mut broken = Recording::new("broken", 20, &log);
        broken.fail_after = true;
        let pipeline = MiddlewarePipeline::new().with_after_error_reporter(Arc::new(
            move |name: &str, _cmd: &Command, err: &anyhow::Error| {
                reported_clone.lock().unwrap().push(format!("{name}: {err}"));
            },
        ));
        pipeline.add(Arc::new(Recording::new("a", 10, &log))).unwrap();
        pipeline.add(Arc::new(broken)).unwrap();

        let outcome = run(&pipeline, &log).await;

        assert_eq!(outcome.result, success());
        assert_eq!(*reported.lock().unwrap(), vec!["broken: after boom"]);
        assert!(log.lock().unwrap().contains(&"after:a".to_string()));
    }

    #[tokio::test]
    async fn context_modifications_reach_the_handler() {
        let log: Log = Arc::default();
        let pipeline = pipeline_with(vec![Recording::new("a", 10, &log)]);
        let cmd = command();
        let ctx = MiddlewareContext::for_command(&cmd, None).with_extension(keys::TENANT_ID, "t1");

        let outcome = pipeline
            .execute(&cmd, ctx, |ctx| async move {
                assert_eq!(ctx.get("seen_a"), Some(&json!(true)));
                assert_eq!(ctx.tenant_id(), Some("t1"));
                Ok(success())
            })
            .await;

        assert!(outcome.handler_invoked);
        assert_eq!(outcome.context.get("seen_a"), Some(&json!(true)));
    }

    #[test]
    fn registry_operations() {
        let log: Log = Arc::default();
        let pipeline = pipeline_with(vec![
            Recording::new("late", 50, &log),
            Recording::new("early", 5, &log),
        ]);

        assert_eq!(pipeline.names(), vec!["early", "late"]);
        assert!(pipeline.has("late"));
        assert_eq!(
            pipeline.add(Arc::new(Recording::new("late", 1, &log))),
            Err(MiddlewareError::Duplicate("late".to_string()))
        );

        assert!(pipeline.remove("late"));
        assert!(!pipeline.remove("late"));
        assert_eq!(pipeline.len(), 1);

        pipeline.clear();
        assert!(pipeline.is_empty());
    }

    #[test]
    fn context_user_id_falls_back_to_chain() {
        let cmd = command().with_user_id("u1");
        let ctx = MiddlewareContext::for_command(&cmd, None);
        assert_eq!(ctx.user_id(), Some("u1"));

        let ctx = ctx.with_extension(keys::USER_ID, "u2");
        assert_eq!(ctx.user_id(), Some("u2"));
    }
}
