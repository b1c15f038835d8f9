//! Python backend: true blocking read over a shared input buffer
//!
//! The program runs in the embedded CPython interpreter on a worker thread.
//! `input()` must return synchronously, so the worker arms a
//! [`SharedInputBuffer`], announces the request and parks on the buffer with
//! the GIL released until the host delivers the answer (or a zero-length
//! wake-up on cancellation, which surfaces as `KeyboardInterrupt`).
//!
//! `sys.stdout`, `sys.stderr` and `sys.stdin` are replaced by stream objects
//! that route every call to the console bridge of the run executing on the
//! calling thread, so a stale worker that is still unwinding can never write
//! into, or read from, a newer run.
//!
//! All contexts share one interpreter. Runs take turns on it, and the module
//! table plus every loaded module's namespace are restored after each run.

use async_trait::async_trait;
use parking_lot::Mutex;
use pyo3::exceptions::{PyKeyboardInterrupt, PyOSError, PyRuntimeError, PySystemExit};
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyTracebackMethods};
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;

use super::shared_buffer::SharedInputBuffer;
use super::{
    ContextEvent, ContextState, ExecutionContext, InputResponse, Lifecycle, WorkerLiveness,
};
use crate::errors::ContextError;

/// Defines `input` on top of the `__console__` bridge.
const PRELUDE: &str = r#"
def input(prompt=""):
    line = __console__.readline(str(prompt))
    return line[:-1] if line.endswith("\n") else line
"#;

const INTERRUPT_SOURCE: &str = r#"
import ctypes
ctypes.pythonapi.PyThreadState_SetAsyncExc(ctypes.c_ulong(ident), ctypes.py_object(KeyboardInterrupt))
"#;

/// Snapshot and restore of `sys.modules` and each module's namespace.
const ISOLATION_SOURCE: &str = r#"
import sys
from types import ModuleType

_missing = object()

def snapshot():
    saved = {}
    for name, module in list(sys.modules.items()):
        attrs = dict(vars(module)) if isinstance(module, ModuleType) else None
        saved[name] = (module, attrs)
    return saved

def restore(saved):
    for name in [name for name in sys.modules if name not in saved]:
        del sys.modules[name]
    for name, (module, attrs) in saved.items():
        sys.modules[name] = module
        if attrs is None:
            continue
        current = vars(module)
        for key in [key for key in current if key not in attrs]:
            del current[key]
        for key, value in attrs.items():
            if current.get(key, _missing) is not value:
                current[key] = value
"#;

/// How long a new run waits for a cancelled predecessor to leave the
/// interpreter before starting alongside it.
const TURN_TIMEOUT: Duration = Duration::from_secs(5);

static INTERPRETER_TURN: Mutex<()> = parking_lot::const_mutex(());

thread_local! {
    static ACTIVE_BRIDGE: RefCell<Option<Py<ConsoleBridge>>> = const { RefCell::new(None) };
}

fn active_bridge(py: Python<'_>) -> Option<Py<ConsoleBridge>> {
    ACTIVE_BRIDGE.with(|slot| slot.borrow().as_ref().map(|bridge| bridge.clone_ref(py)))
}

/// Binds a bridge to the current worker thread for the lifetime of the guard.
struct ActiveBridge;

impl ActiveBridge {
    fn install(bridge: Py<ConsoleBridge>) -> Self {
        ACTIVE_BRIDGE.with(|slot| *slot.borrow_mut() = Some(bridge));
        ActiveBridge
    }
}

impl Drop for ActiveBridge {
    fn drop(&mut self) {
        ACTIVE_BRIDGE.with(|slot| slot.borrow_mut().take());
    }
}

/// Worker → host messages.
#[derive(Debug)]
enum PythonMessage {
    Ready,
    Stdout(String),
    Stderr(String),
    Stdin(Option<String>),
    Finished,
    Error(String),
}

/// Per-run console; reachable as `__console__` and through the routed
/// standard streams.
#[pyclass(frozen)]
struct ConsoleBridge {
    events: mpsc::UnboundedSender<PythonMessage>,
    buffer: Arc<SharedInputBuffer>,
    cancelled: Arc<AtomicBool>,
    stdout: Mutex<String>,
}

#[pymethods]
impl ConsoleBridge {
    fn write(&self, text: &str) -> usize {
        let mut pending = self.stdout.lock();
        pending.push_str(text);
        if let Some(lines) = take_complete_lines(&mut pending) {
            let _ = self.events.send(PythonMessage::Stdout(lines));
        }
        text.chars().count()
    }

    fn write_err(&self, text: &str) -> usize {
        self.flush();
        if !text.is_empty() {
            let _ = self.events.send(PythonMessage::Stderr(text.to_string()));
        }
        text.chars().count()
    }

    fn flush(&self) {
        let pending = std::mem::take(&mut *self.stdout.lock());
        if !pending.is_empty() {
            let _ = self.events.send(PythonMessage::Stdout(pending));
        }
    }

    #[pyo3(signature = (prompt=None))]
    fn readline(&self, py: Python<'_>, prompt: Option<String>) -> PyResult<String> {
        self.flush();
        self.buffer.arm();
        // Checked after arming so a concurrent wake-up cannot be missed.
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(PyKeyboardInterrupt::new_err("execution cancelled"));
        }

        let prompt = prompt.filter(|prompt| !prompt.is_empty());
        if self.events.send(PythonMessage::Stdin(prompt)).is_err() {
            return Err(PyKeyboardInterrupt::new_err("console closed"));
        }

        let buffer = Arc::clone(&self.buffer);
        let line = py.allow_threads(move || buffer.wait());
        if line.is_empty() {
            return Err(PyKeyboardInterrupt::new_err("execution cancelled"));
        }
        Ok(line)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamKind {
    Stdout,
    Stderr,
    Stdin,
}

/// File-like object installed as one of the standard streams. Threads with
/// no run bound to them write nowhere and read end-of-file.
#[pyclass(frozen)]
struct ConsoleStream {
    kind: StreamKind,
}

#[pymethods]
impl ConsoleStream {
    fn write(&self, py: Python<'_>, text: &str) -> PyResult<usize> {
        let Some(bridge) = active_bridge(py) else {
            log::debug!("Dropping {:?} write from a thread without a run", self.kind);
            return Ok(text.chars().count());
        };
        match self.kind {
            StreamKind::Stdout => Ok(bridge.get().write(text)),
            StreamKind::Stderr => Ok(bridge.get().write_err(text)),
            StreamKind::Stdin => Err(PyOSError::new_err("stdin is not writable")),
        }
    }

    fn flush(&self, py: Python<'_>) {
        if let Some(bridge) = active_bridge(py) {
            bridge.get().flush();
        }
    }

    /// Reads one whole line. A size hint is accepted; lines are never split.
    #[pyo3(signature = (size=-1))]
    fn readline(&self, py: Python<'_>, size: isize) -> PyResult<String> {
        let _ = size;
        if self.kind != StreamKind::Stdin {
            return Err(PyOSError::new_err("stream is not readable"));
        }
        match active_bridge(py) {
            Some(bridge) => bridge.get().readline(py, None),
            None => Ok(String::new()),
        }
    }

    /// Interactive input has no end, so `read` returns the next line.
    #[pyo3(signature = (size=-1))]
    fn read(&self, py: Python<'_>, size: isize) -> PyResult<String> {
        self.readline(py, size)
    }

    fn __iter__(slf: PyRef<'_, Self>) -> PyRef<'_, Self> {
        slf
    }

    fn __next__(&self, py: Python<'_>) -> PyResult<Option<String>> {
        let line = self.readline(py, -1)?;
        Ok((!line.is_empty()).then_some(line))
    }

    fn isatty(&self) -> bool {
        false
    }

    fn readable(&self) -> bool {
        self.kind == StreamKind::Stdin
    }

    fn writable(&self) -> bool {
        self.kind != StreamKind::Stdin
    }

    fn fileno(&self) -> PyResult<i32> {
        Err(PyOSError::new_err("console streams have no file descriptor"))
    }

    #[getter]
    fn encoding(&self) -> &'static str {
        "utf-8"
    }
}

/// Splits off everything up to and including the last newline.
fn take_complete_lines(pending: &mut String) -> Option<String> {
    let end = pending.rfind('\n')? + 1;
    let rest = pending.split_off(end);
    Some(std::mem::replace(pending, rest))
}

pub struct PythonContext {
    lifecycle: Lifecycle,
    buffer: Arc<SharedInputBuffer>,
    cancelled: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    thread_ident: Arc<AtomicU64>,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<PythonMessage>>,
    events_tx: Mutex<Option<mpsc::UnboundedSender<PythonMessage>>>,
    liveness: WorkerLiveness,
}

impl PythonContext {
    pub fn new(input_buffer_bytes: usize) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        Self {
            lifecycle: Lifecycle::new(),
            buffer: Arc::new(SharedInputBuffer::new(input_buffer_bytes)),
            cancelled: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            thread_ident: Arc::new(AtomicU64::new(0)),
            events: tokio::sync::Mutex::new(events),
            events_tx: Mutex::new(Some(events_tx)),
            liveness: WorkerLiveness::default(),
        }
    }

    /// Whether the worker thread is still running, including while it waits
    /// for its turn on the interpreter or unwinds after a terminate.
    pub fn worker_alive(&self) -> bool {
        self.liveness.is_alive()
    }

    /// Raises `KeyboardInterrupt` asynchronously in a worker that is still
    /// executing program code. Runs off the caller's thread since it needs
    /// the GIL.
    fn interrupt_worker(&self) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        let running = Arc::clone(&self.running);
        let ident = self.thread_ident.load(Ordering::SeqCst);
        let spawned = thread::Builder::new()
            .name("scriptbox-py-interrupt".to_string())
            .spawn(move || {
                Python::with_gil(|py| {
                    if !running.load(Ordering::SeqCst) {
                        return;
                    }
                    let scope = PyDict::new_bound(py);
                    let raised = scope
                        .set_item("ident", ident)
                        .and_then(|_| py.run_bound(INTERRUPT_SOURCE, Some(&scope), None));
                    if let Err(e) = raised {
                        log::warn!("Failed to interrupt Python worker: {}", e);
                    }
                })
            });
        if let Err(e) = spawned {
            log::warn!("Failed to spawn Python interrupt thread: {}", e);
        }
    }
}

#[async_trait]
impl ExecutionContext for PythonContext {
    fn language(&self) -> &'static str {
        "python"
    }

    fn state(&self) -> ContextState {
        self.lifecycle.state()
    }

    fn start(&self, source: &str) -> Result<(), ContextError> {
        self.lifecycle.begin()?;
        let events = self
            .events_tx
            .lock()
            .take()
            .ok_or(ContextError::AlreadyStarted)?;

        let worker = PythonWorker {
            source: source.to_string(),
            buffer: Arc::clone(&self.buffer),
            cancelled: Arc::clone(&self.cancelled),
            running: Arc::clone(&self.running),
            thread_ident: Arc::clone(&self.thread_ident),
            events,
        };
        let alive = self.liveness.enter();
        let spawned = thread::Builder::new()
            .name("scriptbox-py".to_string())
            .spawn(move || {
                let _alive = alive;
                worker.run()
            });

        if let Err(e) = spawned {
            self.lifecycle.fail();
            return Err(ContextError::Spawn(e));
        }
        log::debug!("Python worker started");
        Ok(())
    }

    async fn next_event(&self) -> Option<ContextEvent> {
        if self.lifecycle.state() == ContextState::Idle {
            return None;
        }
        let mut events = self.events.lock().await;
        loop {
            if self.lifecycle.state().is_terminal() {
                return None;
            }
            let Some(message) = events.recv().await else {
                return self.lifecycle.fail().then(|| {
                    ContextEvent::Failed("Python worker exited unexpectedly".to_string())
                });
            };
            match message {
                PythonMessage::Ready => log::debug!("Python interpreter ready"),
                PythonMessage::Stdout(text) | PythonMessage::Stderr(text) => {
                    return Some(ContextEvent::Output(text))
                }
                PythonMessage::Stdin(prompt) => {
                    let id = self.lifecycle.next_correlation_id();
                    if let Some(request) = self.lifecycle.await_input(id, prompt) {
                        return Some(ContextEvent::InputNeeded(request));
                    }
                }
                PythonMessage::Finished => {
                    return self.lifecycle.complete().then_some(ContextEvent::Done)
                }
                PythonMessage::Error(message) => {
                    return self.lifecycle.fail().then(|| ContextEvent::Failed(message))
                }
            }
        }
    }

    fn supply_input(&self, response: InputResponse) -> bool {
        if !self.lifecycle.accept_input(response.id) {
            return false;
        }
        self.buffer.deliver(&format!("{}\n", response.text));
        true
    }

    fn terminate(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if self.lifecycle.cancel() {
            log::debug!("Python context terminated");
        }
        self.buffer.wake_empty();
        self.interrupt_worker();
    }
}

impl Drop for PythonContext {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Module state captured before a run.
struct ModuleSnapshot<'py> {
    saved: Bound<'py, PyAny>,
    restore: Bound<'py, PyAny>,
}

impl<'py> ModuleSnapshot<'py> {
    fn take(py: Python<'py>) -> PyResult<Self> {
        let scope = PyDict::new_bound(py);
        py.run_bound(ISOLATION_SOURCE, Some(&scope), None)?;
        let lookup = |name: &str| -> PyResult<Bound<'py, PyAny>> {
            scope
                .get_item(name)?
                .ok_or_else(|| PyRuntimeError::new_err(format!("isolation helper '{}' missing", name)))
        };
        let saved = lookup("snapshot")?.call0()?;
        let restore = lookup("restore")?;
        Ok(Self { saved, restore })
    }

    fn restore(&self) -> PyResult<()> {
        self.restore.call1((self.saved.clone(),)).map(|_| ())
    }
}

struct PythonWorker {
    source: String,
    buffer: Arc<SharedInputBuffer>,
    cancelled: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    thread_ident: Arc<AtomicU64>,
    events: mpsc::UnboundedSender<PythonMessage>,
}

impl PythonWorker {
    fn run(self) {
        let turn = INTERPRETER_TURN.try_lock_for(TURN_TIMEOUT);
        if turn.is_none() {
            log::warn!("Previous Python run is still unwinding; starting without waiting");
        }
        Python::with_gil(|py| self.run_with_gil(py));
        drop(turn);
        log::debug!("Python worker exiting");
    }

    fn run_with_gil(&self, py: Python<'_>) {
        let prepared = self
            .prepare(py)
            .and_then(|(bridge, globals)| Ok((bridge, globals, ModuleSnapshot::take(py)?)));
        let (bridge, globals, snapshot) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                let _ = self.events.send(PythonMessage::Error(format!(
                    "failed to initialize Python: {}",
                    e
                )));
                return;
            }
        };
        let _active = ActiveBridge::install(bridge.clone().unbind());
        let _ = self.events.send(PythonMessage::Ready);

        // Published before the cancel check so a terminate either sees a
        // running worker or is seen by it.
        self.running.store(true, Ordering::SeqCst);
        let result = if self.cancelled.load(Ordering::SeqCst) {
            None
        } else {
            Some(py.run_bound(&self.source, Some(&globals), None))
        };
        self.running.store(false, Ordering::SeqCst);
        bridge.get().flush();

        let finished = match result {
            None => false,
            Some(Ok(())) => true,
            Some(Err(err)) if err.is_instance_of::<PySystemExit>(py) => true,
            Some(Err(_)) if self.cancelled.load(Ordering::SeqCst) => false,
            Some(Err(err)) => {
                bridge.get().write_err(&format_exception(py, &err));
                true
            }
        };

        // A pending asynchronous interrupt can abort the first attempt.
        if let Err(e) = snapshot.restore().or_else(|_| snapshot.restore()) {
            log::warn!("Failed to restore Python modules after run: {}", e);
        }
        if finished {
            let _ = self.events.send(PythonMessage::Finished);
        }
    }

    fn prepare<'py>(
        &self,
        py: Python<'py>,
    ) -> PyResult<(Bound<'py, ConsoleBridge>, Bound<'py, PyDict>)> {
        let ident: u64 = py
            .import_bound("threading")?
            .getattr("get_ident")?
            .call0()?
            .extract()?;
        self.thread_ident.store(ident, Ordering::SeqCst);
        // Loaded up front so an interrupt never imports it mid-run.
        py.import_bound("ctypes")?;

        let sys = py.import_bound("sys")?;
        for (name, kind) in [
            ("stdout", StreamKind::Stdout),
            ("stderr", StreamKind::Stderr),
            ("stdin", StreamKind::Stdin),
        ] {
            sys.setattr(name, Bound::new(py, ConsoleStream { kind })?)?;
        }

        let bridge = Bound::new(
            py,
            ConsoleBridge {
                events: self.events.clone(),
                buffer: Arc::clone(&self.buffer),
                cancelled: Arc::clone(&self.cancelled),
                stdout: Mutex::new(String::new()),
            },
        )?;

        let builtins = py.import_bound("builtins")?.dict().copy()?;
        builtins.set_item("__console__", &bridge)?;
        py.run_bound(PRELUDE, Some(&builtins), None)?;

        let globals = PyDict::new_bound(py);
        globals.set_item("__builtins__", &builtins)?;
        globals.set_item("__name__", "__main__")?;
        Ok((bridge, globals))
    }
}

fn format_exception(py: Python<'_>, err: &PyErr) -> String {
    let mut text = String::new();
    if let Some(traceback) = err.traceback_bound(py) {
        match traceback.format() {
            Ok(formatted) => text.push_str(&formatted),
            Err(e) => log::debug!("Could not format traceback: {}", e),
        }
    }
    text.push_str(&err.to_string());
    text.push('\n');
    text
}
