use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::keys::Key;

/// Callback installed by the worker for streaming requests. Invoking it ends
/// the aggregated plugin spans and returns the pipeline to its pool; it is
/// safe to call more than once.
pub type StreamFinalizer = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct ContextState {
    request_id: Option<String>,
    fallback_index: u32,
    fallback_request_id: Option<String>,
    span_id: Option<String>,
    trace_id: Option<String>,
    selected_key_id: Option<String>,
    selected_key_name: Option<String>,
    governance: HashMap<String, String>,
    stream_start: Option<Instant>,
    drop_raw_payloads: bool,
    skip_pipeline: bool,
    skip_key_selection: bool,
    pinned_key: Option<Key>,
    key_name: Option<String>,
    include_clients: Option<Vec<String>>,
    include_tools: Option<Vec<String>>,
    is_custom_provider: bool,
    stream_finalizer: Option<StreamFinalizer>,
}

struct ContextInner {
    cancel: CancellationToken,
    /// While hooks run, reserved keys cannot be overwritten by plugins.
    guard: AtomicBool,
    state: Mutex<ContextState>,
}

/// Per-call scoped state shared between the caller, the worker, and the
/// plugin pipeline. Cloning is cheap and refers to the same call.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! guarded_setter {
    ($(#[$doc:meta])* $setter:ident, $getter:ident, $field:ident, $ty:ty) => {
        $(#[$doc])*
        pub fn $setter(&self, value: $ty) {
            if self.inner.guard.load(Ordering::Acquire) {
                warn!(field = stringify!($field), "ignoring reserved context write during hook execution");
                return;
            }
            self.lock_state().$field = value;
        }

        pub fn $getter(&self) -> $ty {
            self.lock_state().$field.clone()
        }
    };
}

impl Context {
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    fn with_token(cancel: CancellationToken) -> Self {
        Context {
            inner: Arc::new(ContextInner {
                cancel,
                guard: AtomicBool::new(false),
                state: Mutex::new(ContextState::default()),
            }),
        }
    }

    /// A context whose cancellation follows the given parent token.
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self::with_token(parent.child_token())
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ContextState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.inner.cancel.cancelled().await
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// Enables the reserved-write guard for the duration of hook execution.
    pub(crate) fn block_reserved_writes(&self, blocked: bool) {
        self.inner.guard.store(blocked, Ordering::Release);
    }

    guarded_setter!(
        /// Seeds the id identifying this logical request across retries and
        /// fallbacks.
        set_request_id, request_id, request_id, Option<String>
    );
    guarded_setter!(set_span_id, span_id, span_id, Option<String>);
    guarded_setter!(set_trace_id, trace_id, trace_id, Option<String>);
    guarded_setter!(set_selected_key_id, selected_key_id, selected_key_id, Option<String>);
    guarded_setter!(
        set_selected_key_name,
        selected_key_name,
        selected_key_name,
        Option<String>
    );
    guarded_setter!(set_fallback_request_id, fallback_request_id, fallback_request_id, Option<String>);
    guarded_setter!(set_stream_start, stream_start, stream_start, Option<Instant>);

    pub fn ensure_request_id(&self) -> String {
        let mut state = self.lock_state();
        state
            .request_id
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone()
    }

    pub fn set_fallback_index(&self, index: u32) {
        if self.inner.guard.load(Ordering::Acquire) {
            warn!("ignoring reserved context write during hook execution");
            return;
        }
        self.lock_state().fallback_index = index;
    }

    pub fn fallback_index(&self) -> u32 {
        self.lock_state().fallback_index
    }

    pub fn set_stream_finalizer(&self, finalizer: Option<StreamFinalizer>) {
        if self.inner.guard.load(Ordering::Acquire) {
            warn!("ignoring reserved context write during hook execution");
            return;
        }
        self.lock_state().stream_finalizer = finalizer;
    }

    pub fn take_stream_finalizer(&self) -> Option<StreamFinalizer> {
        self.lock_state().stream_finalizer.take()
    }

    // Unreserved fields below: plugins and callers may set these at any time.

    pub fn set_governance(&self, key: impl Into<String>, value: impl Into<String>) {
        self.lock_state().governance.insert(key.into(), value.into());
    }

    pub fn governance(&self) -> HashMap<String, String> {
        self.lock_state().governance.clone()
    }

    pub fn set_drop_raw_payloads(&self, drop: bool) {
        self.lock_state().drop_raw_payloads = drop;
    }

    pub fn drop_raw_payloads(&self) -> bool {
        self.lock_state().drop_raw_payloads
    }

    pub fn set_skip_pipeline(&self, skip: bool) {
        self.lock_state().skip_pipeline = skip;
    }

    pub fn skip_pipeline(&self) -> bool {
        self.lock_state().skip_pipeline
    }

    pub fn set_skip_key_selection(&self, skip: bool) {
        self.lock_state().skip_key_selection = skip;
    }

    pub fn skip_key_selection(&self) -> bool {
        self.lock_state().skip_key_selection
    }

    pub fn set_pinned_key(&self, key: Option<Key>) {
        self.lock_state().pinned_key = key;
    }

    pub fn pinned_key(&self) -> Option<Key> {
        self.lock_state().pinned_key.clone()
    }

    /// Requests a specific credential by human name.
    pub fn set_key_name(&self, name: Option<String>) {
        self.lock_state().key_name = name;
    }

    pub fn key_name(&self) -> Option<String> {
        self.lock_state().key_name.clone()
    }

    pub fn set_include_clients(&self, clients: Option<Vec<String>>) {
        self.lock_state().include_clients = clients;
    }

    pub fn include_clients(&self) -> Option<Vec<String>> {
        self.lock_state().include_clients.clone()
    }

    pub fn set_include_tools(&self, tools: Option<Vec<String>>) {
        self.lock_state().include_tools = tools;
    }

    pub fn include_tools(&self) -> Option<Vec<String>> {
        self.lock_state().include_tools.clone()
    }

    pub(crate) fn set_is_custom_provider(&self, is_custom: bool) {
        self.lock_state().is_custom_provider = is_custom;
    }

    pub fn is_custom_provider(&self) -> bool {
        self.lock_state().is_custom_provider
    }

    /// Internal setters bypass the hook guard; the tracer and the worker own
    /// these fields even while hooks run.
    pub(crate) fn set_span_id_internal(&self, span_id: Option<String>) {
        self.lock_state().span_id = span_id;
    }

    pub(crate) fn ensure_trace_id(&self) -> String {
        let mut state = self.lock_state();
        state
            .trace_id
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone()
    }

    pub(crate) fn set_stream_start_internal(&self, start: Option<Instant>) {
        self.lock_state().stream_start = start;
    }

    pub(crate) fn set_selected_key_internal(&self, id: Option<String>, name: Option<String>) {
        let mut state = self.lock_state();
        state.selected_key_id = id;
        state.selected_key_name = name;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_writes_blocked_while_guarded() {
        let ctx = Context::new();
        ctx.set_request_id(Some("original".into()));

        ctx.block_reserved_writes(true);
        ctx.set_request_id(Some("overwritten".into()));
        ctx.set_fallback_index(7);
        assert_eq!(ctx.request_id().as_deref(), Some("original"));
        assert_eq!(ctx.fallback_index(), 0);

        ctx.block_reserved_writes(false);
        ctx.set_request_id(Some("overwritten".into()));
        assert_eq!(ctx.request_id().as_deref(), Some("overwritten"));
    }

    #[test]
    fn unreserved_writes_allowed_while_guarded() {
        let ctx = Context::new();
        ctx.block_reserved_writes(true);
        ctx.set_governance("team", "search");
        ctx.set_drop_raw_payloads(true);
        assert_eq!(ctx.governance().get("team").map(String::as_str), Some("search"));
        assert!(ctx.drop_raw_payloads());
    }

    #[test]
    fn internal_setters_bypass_guard() {
        let ctx = Context::new();
        ctx.block_reserved_writes(true);
        ctx.set_span_id_internal(Some("span-1".into()));
        assert_eq!(ctx.span_id().as_deref(), Some("span-1"));
    }

    #[test]
    fn child_cancellation_follows_parent() {
        let parent = CancellationToken::new();
        let ctx = Context::child_of(&parent);
        assert!(!ctx.is_cancelled());
        parent.cancel();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn ensure_request_id_is_stable() {
        let ctx = Context::new();
        let first = ctx.ensure_request_id();
        assert_eq!(first, ctx.ensure_request_id());
    }
}
