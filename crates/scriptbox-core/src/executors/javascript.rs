//! JavaScript backend: tagged request/response over an embedded QuickJS
//!
//! The engine lives on its own thread because a QuickJS runtime is not
//! `Send`. Script code talks to the host by posting JSON messages through a
//! single native function; `input(prompt)` returns a promise that the worker
//! resolves when the matching response arrives on the command channel.

use async_trait::async_trait;
use parking_lot::Mutex;
use rquickjs::{Context, Ctx, Function, Runtime};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread;
use tokio::sync::mpsc;

use super::{
    ContextEvent, ContextState, CorrelationId, ExecutionContext, InputResponse, Lifecycle,
    WorkerLiveness,
};
use crate::errors::ContextError;

/// Installs `console`, `input` and the run/resolve entry points.
const PRELUDE: &str = r#"
(() => {
  const post = globalThis.__host_post;
  delete globalThis.__host_post;

  const pending = new Map();
  let nextId = 1;

  const show = (value) => {
    if (typeof value === 'string') return value;
    if (value === null) return 'null';
    if (value === undefined) return 'undefined';
    try {
      const json = JSON.stringify(value);
      return json === undefined ? String(value) : json;
    } catch (_) {
      return String(value);
    }
  };
  const describe = (e) =>
    e !== null && typeof e === 'object' && e.message !== undefined ? String(e.message) : String(e);

  const log = (...args) => post(JSON.stringify({ type: 'log', payload: args.map(show).join(' ') + '\n' }));
  const console = Object.freeze({ log, info: log, warn: log, error: log });

  const input = (prompt) => new Promise((resolve) => {
    const id = nextId++;
    pending.set(id, resolve);
    post(JSON.stringify({
      type: 'inputRequest',
      id,
      payload: prompt === undefined || prompt === null ? null : String(prompt),
    }));
  });

  globalThis.console = console;
  globalThis.input = input;

  globalThis.__console_resolve = (id, text) => {
    const resolve = pending.get(id);
    if (resolve === undefined) return false;
    pending.delete(id);
    resolve(text);
    return true;
  };

  globalThis.__console_run = (source) => {
    let body;
    try {
      body = new Function('input', 'console', 'return (async () => {\n' + source + '\n})();');
    } catch (e) {
      const name = e !== null && typeof e === 'object' && e.name ? e.name + ': ' : '';
      post(JSON.stringify({ type: 'error', payload: name + describe(e) }));
      return;
    }
    body(input, console).then(
      () => post(JSON.stringify({ type: 'done' })),
      (e) => {
        log('Runtime error: ' + describe(e));
        post(JSON.stringify({ type: 'done' }));
      },
    );
  };
})();
"#;

/// Worker → host messages, as posted by the prelude.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum JsMessage {
    Log { payload: String },
    InputRequest { id: u64, payload: Option<String> },
    Done,
    Error { payload: String },
}

/// Host → worker commands.
#[derive(Debug)]
enum JsCommand {
    InputResponse { id: u64, text: String },
}

pub struct JavaScriptContext {
    lifecycle: Lifecycle,
    cancelled: Arc<AtomicBool>,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<JsMessage>>,
    events_tx: Mutex<Option<mpsc::UnboundedSender<JsMessage>>>,
    commands: Mutex<Option<std_mpsc::Sender<JsCommand>>>,
    liveness: WorkerLiveness,
}

impl JavaScriptContext {
    pub fn new() -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        Self {
            lifecycle: Lifecycle::new(),
            cancelled: Arc::new(AtomicBool::new(false)),
            events: tokio::sync::Mutex::new(events),
            events_tx: Mutex::new(Some(events_tx)),
            commands: Mutex::new(None),
            liveness: WorkerLiveness::default(),
        }
    }

    /// Whether the worker thread is still running, including while it
    /// unwinds after a terminate.
    pub fn worker_alive(&self) -> bool {
        self.liveness.is_alive()
    }
}

impl Default for JavaScriptContext {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionContext for JavaScriptContext {
    fn language(&self) -> &'static str {
        "javascript"
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
        let (commands_tx, commands) = std_mpsc::channel();
        *self.commands.lock() = Some(commands_tx);

        let source = source.to_string();
        let cancelled = Arc::clone(&self.cancelled);
        let alive = self.liveness.enter();
        let spawned = thread::Builder::new()
            .name("scriptbox-js".to_string())
            .spawn(move || {
                let _alive = alive;
                run_worker(source, cancelled, events, commands)
            });

        if let Err(e) = spawned {
            self.lifecycle.fail();
            self.commands.lock().take();
            return Err(ContextError::Spawn(e));
        }
        log::debug!("JavaScript worker started");
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
                    ContextEvent::Failed("JavaScript worker exited unexpectedly".to_string())
                });
            };
            match message {
                JsMessage::Log { payload } => return Some(ContextEvent::Output(payload)),
                JsMessage::InputRequest { id, payload } => {
                    if let Some(request) = self.lifecycle.await_input(CorrelationId(id), payload) {
                        return Some(ContextEvent::InputNeeded(request));
                    }
                }
                JsMessage::Done => return self.lifecycle.complete().then_some(ContextEvent::Done),
                JsMessage::Error { payload } => {
                    return self.lifecycle.fail().then(|| ContextEvent::Failed(payload))
                }
            }
        }
    }

    fn supply_input(&self, response: InputResponse) -> bool {
        if !self.lifecycle.accept_input(response.id) {
            return false;
        }
        let command = JsCommand::InputResponse {
            id: response.id.0,
            text: response.text,
        };
        match self.commands.lock().as_ref() {
            Some(commands) => commands.send(command).is_ok(),
            None => false,
        }
    }

    fn terminate(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if self.lifecycle.cancel() {
            log::debug!("JavaScript context terminated");
        }
        self.commands.lock().take();
    }
}

impl Drop for JavaScriptContext {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn run_worker(
    source: String,
    cancelled: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<JsMessage>,
    commands: std_mpsc::Receiver<JsCommand>,
) {
    let fail = |payload: String| {
        let _ = events.send(JsMessage::Error { payload });
    };

    let runtime = match Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => return fail(format!("failed to create JavaScript runtime: {}", e)),
    };
    let flag = Arc::clone(&cancelled);
    runtime.set_interrupt_handler(Some(Box::new(move || flag.load(Ordering::Relaxed))));

    let context = match Context::full(&runtime) {
        Ok(context) => context,
        Err(e) => return fail(format!("failed to create JavaScript context: {}", e)),
    };

    let settled = Arc::new(AtomicBool::new(false));
    let started = context.with(|ctx| {
        install_prelude(&ctx, events.clone(), Arc::clone(&settled))
            .and_then(|_| {
                let run: Function = ctx.globals().get("__console_run")?;
                run.call::<_, ()>((source,))
            })
            .map_err(|e| describe_error(&ctx, e))
    });
    if let Err(message) = started {
        if !cancelled.load(Ordering::SeqCst) {
            fail(message);
        }
        return;
    }

    loop {
        loop {
            match runtime.execute_pending_job() {
                Ok(true) => {}
                Ok(false) => break,
                Err(_) if cancelled.load(Ordering::SeqCst) => return,
                Err(_) => return fail("pending job raised an exception".to_string()),
            }
        }
        if cancelled.load(Ordering::SeqCst) || settled.load(Ordering::SeqCst) {
            break;
        }

        match commands.recv() {
            Ok(JsCommand::InputResponse { id, text }) => {
                let resolved = context.with(|ctx| {
                    let resolve: Function = ctx.globals().get("__console_resolve")?;
                    resolve.call::<_, bool>((id as f64, text))
                });
                match resolved {
                    Ok(true) => {}
                    Ok(false) => log::debug!("No pending input request with id {}", id),
                    Err(e) => log::warn!("Failed to resolve input request {}: {}", id, e),
                }
            }
            Err(_) => break,
        }
    }
    log::debug!("JavaScript worker exiting");
}

fn install_prelude<'js>(
    ctx: &Ctx<'js>,
    events: mpsc::UnboundedSender<JsMessage>,
    settled: Arc<AtomicBool>,
) -> rquickjs::Result<()> {
    let post = Function::new(ctx.clone(), move |raw: String| {
        match serde_json::from_str::<JsMessage>(&raw) {
            Ok(message) => {
                if matches!(message, JsMessage::Done | JsMessage::Error { .. }) {
                    settled.store(true, Ordering::SeqCst);
                }
                let _ = events.send(message);
            }
            Err(e) => log::warn!("Dropping malformed worker message: {}", e),
        }
    })?;
    ctx.globals().set("__host_post", post)?;
    ctx.eval::<(), _>(PRELUDE)
}

fn describe_error(ctx: &Ctx<'_>, err: rquickjs::Error) -> String {
    if !matches!(err, rquickjs::Error::Exception) {
        return err.to_string();
    }
    let value = ctx.catch();
    if let Some(exception) = value.as_exception() {
        return exception
            .message()
            .unwrap_or_else(|| "uncaught exception".to_string());
    }
    value
        .as_string()
        .and_then(|text| text.to_string().ok())
        .unwrap_or_else(|| "uncaught exception".to_string())
}
