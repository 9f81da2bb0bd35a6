//! Configurable callbacks around dispatch, session, and task lifecycles.
//!
//! Hooks run in registration order. When panic recovery is enabled on
//! the server, a panicking hook is contained within its own frame and
//! the remaining hooks still run; otherwise the panic propagates.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;
use std::collections::HashMap;

use crate::error::Error;
use crate::types::jsonrpc::RequestId;
use crate::types::protocol::methods;
use crate::types::tasks::Task;

use super::session::Session;
use super::RequestContext;

/// Observer invoked before a method handler runs.
pub type BeforeHook =
    Arc<dyn Fn(&RequestContext, Option<&RequestId>, &str, &Value) + Send + Sync>;
/// Observer invoked after a method handler succeeds, with the raw result.
pub type AfterHook =
    Arc<dyn Fn(&RequestContext, Option<&RequestId>, &str, &Value) + Send + Sync>;
/// Observer invoked when a method handler fails.
pub type ErrorHook =
    Arc<dyn Fn(&RequestContext, Option<&RequestId>, &str, &Error) + Send + Sync>;
/// Observer for session registration and removal.
pub type SessionHook = Arc<dyn Fn(&Arc<dyn Session>) + Send + Sync>;
/// Observer for task lifecycle events.
pub type TaskHook = Arc<dyn Fn(&Task) + Send + Sync>;

/// The full hook surface.
///
/// Build one, register callbacks, and hand it to the server builder.
#[derive(Clone, Default)]
pub struct Hooks {
    before_any: Vec<BeforeHook>,
    after_any: Vec<AfterHook>,
    on_error: Vec<ErrorHook>,
    before_method: HashMap<String, Vec<BeforeHook>>,
    after_method: HashMap<String, Vec<AfterHook>>,
    on_register_session: Vec<SessionHook>,
    on_unregister_session: Vec<SessionHook>,
    on_task_created: Vec<TaskHook>,
    on_task_completed: Vec<TaskHook>,
    on_task_failed: Vec<TaskHook>,
    on_task_cancelled: Vec<TaskHook>,
    on_task_status_changed: Vec<TaskHook>,
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("before_any", &self.before_any.len())
            .field("after_any", &self.after_any.len())
            .field("on_error", &self.on_error.len())
            .field("before_method", &self.before_method.len())
            .field("after_method", &self.after_method.len())
            .finish_non_exhaustive()
    }
}

fn invoke(recover: bool, f: impl FnOnce()) {
    if recover {
        if catch_unwind(AssertUnwindSafe(f)).is_err() {
            tracing::warn!(target: "mcp.hooks", "hook panicked; recovered");
        }
    } else {
        f();
    }
}

impl Hooks {
    /// An empty hook set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run before every request and notification.
    pub fn add_before_any(
        &mut self,
        f: impl Fn(&RequestContext, Option<&RequestId>, &str, &Value) + Send + Sync + 'static,
    ) -> &mut Self {
        self.before_any.push(Arc::new(f));
        self
    }

    /// Run after every successful request.
    pub fn add_after_any(
        &mut self,
        f: impl Fn(&RequestContext, Option<&RequestId>, &str, &Value) + Send + Sync + 'static,
    ) -> &mut Self {
        self.after_any.push(Arc::new(f));
        self
    }

    /// Run when a handler fails or a notification send is dropped.
    pub fn add_on_error(
        &mut self,
        f: impl Fn(&RequestContext, Option<&RequestId>, &str, &Error) + Send + Sync + 'static,
    ) -> &mut Self {
        self.on_error.push(Arc::new(f));
        self
    }

    /// Run before handlers of one specific method.
    pub fn add_before_method(
        &mut self,
        method: impl Into<String>,
        f: impl Fn(&RequestContext, Option<&RequestId>, &str, &Value) + Send + Sync + 'static,
    ) -> &mut Self {
        self.before_method
            .entry(method.into())
            .or_default()
            .push(Arc::new(f));
        self
    }

    /// Run after handlers of one specific method succeed.
    pub fn add_after_method(
        &mut self,
        method: impl Into<String>,
        f: impl Fn(&RequestContext, Option<&RequestId>, &str, &Value) + Send + Sync + 'static,
    ) -> &mut Self {
        self.after_method
            .entry(method.into())
            .or_default()
            .push(Arc::new(f));
        self
    }

    /// Run before `initialize`.
    pub fn add_before_initialize(
        &mut self,
        f: impl Fn(&RequestContext, Option<&RequestId>, &str, &Value) + Send + Sync + 'static,
    ) -> &mut Self {
        self.add_before_method(methods::INITIALIZE, f)
    }

    /// Run after `initialize`.
    pub fn add_after_initialize(
        &mut self,
        f: impl Fn(&RequestContext, Option<&RequestId>, &str, &Value) + Send + Sync + 'static,
    ) -> &mut Self {
        self.add_after_method(methods::INITIALIZE, f)
    }

    /// Run before `tools/call`.
    pub fn add_before_call_tool(
        &mut self,
        f: impl Fn(&RequestContext, Option<&RequestId>, &str, &Value) + Send + Sync + 'static,
    ) -> &mut Self {
        self.add_before_method(methods::TOOLS_CALL, f)
    }

    /// Run after `tools/call`.
    pub fn add_after_call_tool(
        &mut self,
        f: impl Fn(&RequestContext, Option<&RequestId>, &str, &Value) + Send + Sync + 'static,
    ) -> &mut Self {
        self.add_after_method(methods::TOOLS_CALL, f)
    }

    /// Run before `resources/read`.
    pub fn add_before_read_resource(
        &mut self,
        f: impl Fn(&RequestContext, Option<&RequestId>, &str, &Value) + Send + Sync + 'static,
    ) -> &mut Self {
        self.add_before_method(methods::RESOURCES_READ, f)
    }

    /// Run after `resources/read`.
    pub fn add_after_read_resource(
        &mut self,
        f: impl Fn(&RequestContext, Option<&RequestId>, &str, &Value) + Send + Sync + 'static,
    ) -> &mut Self {
        self.add_after_method(methods::RESOURCES_READ, f)
    }

    /// Run before `prompts/get`.
    pub fn add_before_get_prompt(
        &mut self,
        f: impl Fn(&RequestContext, Option<&RequestId>, &str, &Value) + Send + Sync + 'static,
    ) -> &mut Self {
        self.add_before_method(methods::PROMPTS_GET, f)
    }

    /// Run after `prompts/get`.
    pub fn add_after_get_prompt(
        &mut self,
        f: impl Fn(&RequestContext, Option<&RequestId>, &str, &Value) + Send + Sync + 'static,
    ) -> &mut Self {
        self.add_after_method(methods::PROMPTS_GET, f)
    }

    /// Run when a session is registered.
    pub fn add_on_register_session(
        &mut self,
        f: impl Fn(&Arc<dyn Session>) + Send + Sync + 'static,
    ) -> &mut Self {
        self.on_register_session.push(Arc::new(f));
        self
    }

    /// Run when a session is unregistered.
    pub fn add_on_unregister_session(
        &mut self,
        f: impl Fn(&Arc<dyn Session>) + Send + Sync + 'static,
    ) -> &mut Self {
        self.on_unregister_session.push(Arc::new(f));
        self
    }

    /// Run when a task is created.
    pub fn add_on_task_created(
        &mut self,
        f: impl Fn(&Task) + Send + Sync + 'static,
    ) -> &mut Self {
        self.on_task_created.push(Arc::new(f));
        self
    }

    /// Run when a task completes successfully.
    pub fn add_on_task_completed(
        &mut self,
        f: impl Fn(&Task) + Send + Sync + 'static,
    ) -> &mut Self {
        self.on_task_completed.push(Arc::new(f));
        self
    }

    /// Run when a task fails.
    pub fn add_on_task_failed(&mut self, f: impl Fn(&Task) + Send + Sync + 'static) -> &mut Self {
        self.on_task_failed.push(Arc::new(f));
        self
    }

    /// Run when a task is cancelled.
    pub fn add_on_task_cancelled(
        &mut self,
        f: impl Fn(&Task) + Send + Sync + 'static,
    ) -> &mut Self {
        self.on_task_cancelled.push(Arc::new(f));
        self
    }

    /// Run on every task status transition.
    pub fn add_on_task_status_changed(
        &mut self,
        f: impl Fn(&Task) + Send + Sync + 'static,
    ) -> &mut Self {
        self.on_task_status_changed.push(Arc::new(f));
        self
    }

    // -- invocation, used by the dispatcher, session manager, and tasks --

    pub(crate) fn run_before(
        &self,
        recover: bool,
        ctx: &RequestContext,
        id: Option<&RequestId>,
        method: &str,
        params: &Value,
    ) {
        for hook in &self.before_any {
            invoke(recover, || hook(ctx, id, method, params));
        }
        if let Some(hooks) = self.before_method.get(method) {
            for hook in hooks {
                invoke(recover, || hook(ctx, id, method, params));
            }
        }
    }

    pub(crate) fn run_after(
        &self,
        recover: bool,
        ctx: &RequestContext,
        id: Option<&RequestId>,
        method: &str,
        result: &Value,
    ) {
        if let Some(hooks) = self.after_method.get(method) {
            for hook in hooks {
                invoke(recover, || hook(ctx, id, method, result));
            }
        }
        for hook in &self.after_any {
            invoke(recover, || hook(ctx, id, method, result));
        }
    }

    pub(crate) fn run_error(
        &self,
        recover: bool,
        ctx: &RequestContext,
        id: Option<&RequestId>,
        method: &str,
        error: &Error,
    ) {
        for hook in &self.on_error {
            invoke(recover, || hook(ctx, id, method, error));
        }
    }

    pub(crate) fn run_session_registered(&self, recover: bool, session: &Arc<dyn Session>) {
        for hook in &self.on_register_session {
            invoke(recover, || hook(session));
        }
    }

    pub(crate) fn run_session_unregistered(&self, recover: bool, session: &Arc<dyn Session>) {
        for hook in &self.on_unregister_session {
            invoke(recover, || hook(session));
        }
    }

    pub(crate) fn run_task_created(&self, recover: bool, task: &Task) {
        for hook in &self.on_task_created {
            invoke(recover, || hook(task));
        }
    }

    pub(crate) fn run_task_completed(&self, recover: bool, task: &Task) {
        for hook in &self.on_task_completed {
            invoke(recover, || hook(task));
        }
    }

    pub(crate) fn run_task_failed(&self, recover: bool, task: &Task) {
        for hook in &self.on_task_failed {
            invoke(recover, || hook(task));
        }
    }

    pub(crate) fn run_task_cancelled(&self, recover: bool, task: &Task) {
        for hook in &self.on_task_cancelled {
            invoke(recover, || hook(task));
        }
    }

    pub(crate) fn run_task_status_changed(&self, recover: bool, task: &Task) {
        for hook in &self.on_task_status_changed {
            invoke(recover, || hook(task));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn hooks_run_in_registration_order() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut hooks = Hooks::new();
        for tag in ["first", "second", "third"] {
            let order = order.clone();
            hooks.add_before_any(move |_, _, _, _| order.lock().push(tag));
        }

        let ctx = RequestContext::default();
        hooks.run_before(false, &ctx, None, "ping", &json!({}));
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn method_hooks_fire_only_for_their_method() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut hooks = Hooks::new();
        {
            let count = count.clone();
            hooks.add_before_call_tool(move |_, _, _, _| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }

        let ctx = RequestContext::default();
        hooks.run_before(false, &ctx, None, methods::TOOLS_CALL, &json!({}));
        hooks.run_before(false, &ctx, None, methods::PROMPTS_GET, &json!({}));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_hook_is_contained_when_recovery_on() {
        let reached = Arc::new(AtomicUsize::new(0));
        let mut hooks = Hooks::new();
        hooks.add_before_any(|_, _, _, _| panic!("hook exploded"));
        {
            let reached = reached.clone();
            hooks.add_before_any(move |_, _, _, _| {
                reached.fetch_add(1, Ordering::SeqCst);
            });
        }

        let ctx = RequestContext::default();
        hooks.run_before(true, &ctx, None, "ping", &json!({}));
        assert_eq!(reached.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "hook exploded")]
    fn panicking_hook_propagates_when_recovery_off() {
        let mut hooks = Hooks::new();
        hooks.add_before_any(|_, _, _, _| panic!("hook exploded"));
        let ctx = RequestContext::default();
        hooks.run_before(false, &ctx, None, "ping", &json!({}));
    }
}
