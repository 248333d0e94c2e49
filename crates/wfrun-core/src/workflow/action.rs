//! Step actions: the pluggable behaviour behind a step's `type`.
//!
//! Actions implement [`StepAction`] (native async fn in traits). Because RPITIT
//! traits cannot be used as trait objects, the registry stores them through
//! a blanket-impl bridge:
//! 1. An object-safe `StepActionDyn` with boxed futures
//! 2. A blanket impl of `StepActionDyn` for every `T: StepAction`
//! 3. `BoxStepAction` wrapping `Box<dyn StepActionDyn>` and delegating

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wfrun_types::workflow::{STEP_GROUP_TYPE, reason};

// ---------------------------------------------------------------------------
// Action inputs and results
// ---------------------------------------------------------------------------

/// Everything an action sees about the step it executes.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub run_id: Uuid,
    pub run_name: String,
    pub step_name: String,
    pub step_type: String,
    /// Step properties with inputs already applied.
    pub properties: Value,
    /// Cancelled when the step's timeout elapses.
    pub cancel: CancellationToken,
}

/// What an action reports back for one invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    /// Work finished; `output` feeds the step's output bindings.
    Succeeded { output: Value },
    /// Still in flight; the step stays running and is re-entered next tick.
    Wait { message: String },
    /// Park the step and suspend the run until it is resumed.
    Suspend { message: String },
    /// Stop the step and terminate the run.
    Stop { message: String },
}

/// Action failure. The message is surfaced verbatim on the step status.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("{0}")]
    Failed(String),

    #[error("{message}")]
    WithReason { reason: String, message: String },
}

impl ActionError {
    /// Status reason recorded for this failure.
    pub fn reason(&self) -> &str {
        match self {
            ActionError::Failed(_) => reason::ACTION_FAILURE,
            ActionError::WithReason { reason, .. } => reason.as_str(),
        }
    }
}

// ---------------------------------------------------------------------------
// StepAction
// ---------------------------------------------------------------------------

/// Capability implemented by every step type.
pub trait StepAction: Send + Sync {
    /// Execute one invocation of the step.
    fn execute(
        &self,
        ctx: &ActionContext,
    ) -> impl Future<Output = Result<ActionOutcome, ActionError>> + Send;

    /// Best-effort cancellation after a timeout. Default: nothing to undo.
    fn cancel(&self, _ctx: &ActionContext) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Object-safe version of [`StepAction`] with boxed futures.
pub trait StepActionDyn: Send + Sync {
    fn execute_boxed<'a>(
        &'a self,
        ctx: &'a ActionContext,
    ) -> Pin<Box<dyn Future<Output = Result<ActionOutcome, ActionError>> + Send + 'a>>;

    fn cancel_boxed<'a>(&'a self, ctx: &'a ActionContext) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

impl<T: StepAction> StepActionDyn for T {
    fn execute_boxed<'a>(
        &'a self,
        ctx: &'a ActionContext,
    ) -> Pin<Box<dyn Future<Output = Result<ActionOutcome, ActionError>> + Send + 'a>> {
        Box::pin(self.execute(ctx))
    }

    fn cancel_boxed<'a>(&'a self, ctx: &'a ActionContext) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(self.cancel(ctx))
    }
}

/// Type-erased step action stored in the registry.
pub struct BoxStepAction {
    inner: Box<dyn StepActionDyn>,
}

impl BoxStepAction {
    pub fn new<T: StepAction + 'static>(action: T) -> Self {
        Self {
            inner: Box::new(action),
        }
    }

    pub async fn execute(&self, ctx: &ActionContext) -> Result<ActionOutcome, ActionError> {
        self.inner.execute_boxed(ctx).await
    }

    pub async fn cancel(&self, ctx: &ActionContext) {
        self.inner.cancel_boxed(ctx).await
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Maps step type names to actions.
#[derive(Default, Clone)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<BoxStepAction>>,
}

impl ActionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `noop` and `suspend` actions.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("noop", NoopAction);
        registry.register("suspend", SuspendAction);
        registry
    }

    /// Register (or replace) the action for a step type.
    pub fn register<T: StepAction + 'static>(&mut self, step_type: &str, action: T) {
        self.actions
            .insert(step_type.to_string(), Arc::new(BoxStepAction::new(action)));
    }

    pub fn get(&self, step_type: &str) -> Option<Arc<BoxStepAction>> {
        self.actions.get(step_type).cloned()
    }

    /// Whether a step type can be executed. Group steps are handled by the
    /// scheduler and always count as known.
    pub fn knows(&self, step_type: &str) -> bool {
        step_type == STEP_GROUP_TYPE || self.actions.contains_key(step_type)
    }

    /// Registered type names, sorted.
    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.actions.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

// ---------------------------------------------------------------------------
// Built-in actions
// ---------------------------------------------------------------------------

/// Succeeds immediately, echoing its properties as output.
pub struct NoopAction;

impl StepAction for NoopAction {
    async fn execute(&self, ctx: &ActionContext) -> Result<ActionOutcome, ActionError> {
        Ok(ActionOutcome::Succeeded {
            output: ctx.properties.clone(),
        })
    }
}

/// Suspends the run until it is resumed. An optional `message` property is
/// recorded on the step.
pub struct SuspendAction;

impl StepAction for SuspendAction {
    async fn execute(&self, ctx: &ActionContext) -> Result<ActionOutcome, ActionError> {
        let message = ctx
            .properties
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("waiting for resume")
            .to_string();
        tracing::info!(run = %ctx.run_name, step = %ctx.step_name, "step requested suspension");
        Ok(ActionOutcome::Suspend { message })
    }
}
