//! Isolated execution contexts for interactive programs.
//!
//! Each supported language gets one [`ExecutionContext`] implementation that
//! runs a single program on its own worker thread. The three backends wait
//! for input in structurally different ways (a tagged request/response
//! exchange, a suspended coroutine, and a thread blocked on shared memory),
//! but all of them surface the same [`ContextEvent`] stream to the runner.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::errors::ContextError;

pub mod javascript;
pub mod lua;
#[cfg(feature = "python")]
pub mod python;
pub mod shared_buffer;

pub use javascript::JavaScriptContext;
pub use lua::LuaContext;
#[cfg(feature = "python")]
pub use python::PythonContext;
pub use shared_buffer::SharedInputBuffer;

/// Token pairing an input request with its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationId(pub u64);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputRequest {
    pub id: CorrelationId,
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputResponse {
    pub id: CorrelationId,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextEvent {
    Output(String),
    InputNeeded(InputRequest),
    Done,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Idle,
    Running,
    AwaitingInput,
    Completed,
    Failed,
    Cancelled,
}

impl ContextState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ContextState::Completed | ContextState::Failed | ContextState::Cancelled
        )
    }
}

#[async_trait]
pub trait ExecutionContext: Send + Sync {
    fn language(&self) -> &'static str;

    fn state(&self) -> ContextState;

    /// Spawns the execution unit. Only valid once, from `Idle`.
    fn start(&self, source: &str) -> Result<(), ContextError>;

    /// Next event of the run, or `None` once the context is terminal.
    async fn next_event(&self) -> Option<ContextEvent>;

    /// Delivers an answer. Returns false, without side effects, unless the
    /// context is awaiting exactly this request.
    fn supply_input(&self, response: InputResponse) -> bool;

    /// Forces `Cancelled` and releases the unit. Idempotent.
    fn terminate(&self);
}

/// Creates a fresh, idle context for every run.
pub type ContextFactory = Arc<dyn Fn() -> Arc<dyn ExecutionContext> + Send + Sync>;

#[derive(Debug)]
struct LifecycleInner {
    state: ContextState,
    pending: Option<CorrelationId>,
}

/// Host-side state machine shared by every context implementation.
///
/// `Idle → Running → {AwaitingInput ⇄ Running} → {Completed | Failed | Cancelled}`;
/// the first terminal transition wins and every later one is ignored.
#[derive(Debug)]
pub struct Lifecycle {
    inner: Mutex<LifecycleInner>,
    next_id: AtomicU64,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LifecycleInner {
                state: ContextState::Idle,
                pending: None,
            }),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn state(&self) -> ContextState {
        self.inner.lock().state
    }

    pub fn begin(&self) -> Result<(), ContextError> {
        let mut inner = self.inner.lock();
        if inner.state != ContextState::Idle {
            return Err(ContextError::AlreadyStarted);
        }
        inner.state = ContextState::Running;
        Ok(())
    }

    /// Allocates a correlation id for backends whose unit does not name its
    /// own requests.
    pub fn next_correlation_id(&self) -> CorrelationId {
        CorrelationId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// `Running → AwaitingInput`. Yields the request to relay, or `None` when
    /// the context is not running (a second request while one is pending,
    /// or a request racing a terminal transition).
    pub fn await_input(&self, id: CorrelationId, prompt: Option<String>) -> Option<InputRequest> {
        let mut inner = self.inner.lock();
        if inner.state != ContextState::Running {
            log::debug!(
                "Ignoring input request {} in state {:?}",
                id,
                inner.state
            );
            return None;
        }
        inner.state = ContextState::AwaitingInput;
        inner.pending = Some(id);
        Some(InputRequest { id, prompt })
    }

    /// `AwaitingInput → Running` for the matching id, honored once per episode.
    pub fn accept_input(&self, id: CorrelationId) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != ContextState::AwaitingInput || inner.pending != Some(id) {
            return false;
        }
        inner.state = ContextState::Running;
        inner.pending = None;
        true
    }

    pub fn complete(&self) -> bool {
        self.finish(ContextState::Completed)
    }

    pub fn fail(&self) -> bool {
        self.finish(ContextState::Failed)
    }

    pub fn cancel(&self) -> bool {
        self.finish(ContextState::Cancelled)
    }

    fn finish(&self, terminal: ContextState) -> bool {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return false;
        }
        inner.state = terminal;
        inner.pending = None;
        true
    }
}

/// Whether a context's worker thread is still alive.
#[derive(Debug, Clone, Default)]
pub(crate) struct WorkerLiveness(Arc<AtomicBool>);

impl WorkerLiveness {
    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Marks the worker alive until the returned guard is dropped. Taken
    /// before the thread is spawned and moved into it.
    pub fn enter(&self) -> LivenessGuard {
        self.0.store(true, Ordering::SeqCst);
        LivenessGuard(Arc::clone(&self.0))
    }
}

pub(crate) struct LivenessGuard(Arc<AtomicBool>);

impl Drop for LivenessGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Clamps `text` to at most `limit` bytes without splitting a character.
pub(crate) fn truncate_at_char_boundary(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_starts_once() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), ContextState::Idle);
        assert!(lifecycle.begin().is_ok());
        assert!(matches!(lifecycle.begin(), Err(ContextError::AlreadyStarted)));
        assert_eq!(lifecycle.state(), ContextState::Running);
    }

    #[test]
    fn test_one_input_honored_per_episode() {
        let lifecycle = Lifecycle::new();
        lifecycle.begin().unwrap();

        let id = lifecycle.next_correlation_id();
        let request = lifecycle.await_input(id, Some("? ".to_string())).unwrap();
        assert_eq!(request.id, id);
        assert_eq!(lifecycle.state(), ContextState::AwaitingInput);

        // No pipelining while a request is outstanding.
        assert!(lifecycle
            .await_input(lifecycle.next_correlation_id(), None)
            .is_none());

        assert!(!lifecycle.accept_input(CorrelationId(id.0 + 100)));
        assert!(lifecycle.accept_input(id));
        assert!(!lifecycle.accept_input(id));
        assert_eq!(lifecycle.state(), ContextState::Running);
    }

    #[test]
    fn test_first_terminal_transition_wins() {
        let lifecycle = Lifecycle::new();
        lifecycle.begin().unwrap();

        assert!(lifecycle.complete());
        assert!(!lifecycle.cancel());
        assert!(!lifecycle.fail());
        assert_eq!(lifecycle.state(), ContextState::Completed);
    }

    #[test]
    fn test_cancel_discards_pending_request() {
        let lifecycle = Lifecycle::new();
        lifecycle.begin().unwrap();
        let id = lifecycle.next_correlation_id();
        lifecycle.await_input(id, None).unwrap();

        assert!(lifecycle.cancel());
        assert!(!lifecycle.accept_input(id));
        assert_eq!(lifecycle.state(), ContextState::Cancelled);
    }

    #[test]
    fn test_cancel_from_idle() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.cancel());
        assert!(lifecycle.begin().is_err());
    }

    #[test]
    fn test_liveness_follows_guard() {
        let liveness = WorkerLiveness::default();
        assert!(!liveness.is_alive());

        let guard = liveness.enter();
        let handle = std::thread::spawn(move || drop(guard));
        handle.join().unwrap();
        assert!(!liveness.is_alive());
    }

    #[test]
    fn test_truncate_at_char_boundary() {
        assert_eq!(truncate_at_char_boundary("hello", 10), "hello");
        assert_eq!(truncate_at_char_boundary("hello", 3), "hel");
        // 'é' is two bytes; never cut it in half.
        assert_eq!(truncate_at_char_boundary("ééé", 3), "é");
        assert_eq!(truncate_at_char_boundary("ééé", 0), "");
    }
}
