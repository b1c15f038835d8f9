//! Lua backend: coroutine suspend/resume
//!
//! The program is compiled into a function and run as a coroutine on a
//! dedicated worker thread. `io.read()` yields a private token; the worker
//! turns that yield into an input request and resumes the coroutine with the
//! answer once the host supplies it. An instruction-count hook polls the
//! cancellation flag and raises a Lua error so a busy program unwinds.

use async_trait::async_trait;
use mlua::{Function, HookTriggers, Lua, MultiValue, Table, ThreadStatus, Value, VmState};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread;
use tokio::sync::mpsc;

use super::{
    ContextEvent, ContextState, ExecutionContext, InputResponse, Lifecycle, WorkerLiveness,
};
use crate::errors::ContextError;

const CANCELLED_MESSAGE: &str = "execution cancelled";

/// Builds `io.read` around a private yield token.
const READ_SOURCE: &str = r#"
local token = ...
local yield, tonumber = coroutine.yield, tonumber
return function(format)
  local line = yield(token)
  if format == "n" or format == "*n" then
    return tonumber(line)
  end
  return line
end
"#;

/// Worker → host messages.
#[derive(Debug)]
enum LuaMessage {
    Output(String),
    InputRequested,
    Finished,
    Crashed(String),
}

/// Host → worker commands.
#[derive(Debug)]
enum LuaCommand {
    Resume(String),
}

pub struct LuaContext {
    lifecycle: Lifecycle,
    hook_interval: u32,
    cancelled: Arc<AtomicBool>,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<LuaMessage>>,
    events_tx: Mutex<Option<mpsc::UnboundedSender<LuaMessage>>>,
    commands: Mutex<Option<std_mpsc::Sender<LuaCommand>>>,
    liveness: WorkerLiveness,
}

impl LuaContext {
    pub fn new(hook_interval: u32) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        Self {
            lifecycle: Lifecycle::new(),
            hook_interval: hook_interval.max(1),
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

#[async_trait]
impl ExecutionContext for LuaContext {
    fn language(&self) -> &'static str {
        "lua"
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
        let interval = self.hook_interval;
        let cancelled = Arc::clone(&self.cancelled);
        let alive = self.liveness.enter();
        let spawned = thread::Builder::new()
            .name("scriptbox-lua".to_string())
            .spawn(move || {
                let _alive = alive;
                run_worker(&source, interval, cancelled, events, commands)
            });

        if let Err(e) = spawned {
            self.lifecycle.fail();
            self.commands.lock().take();
            return Err(ContextError::Spawn(e));
        }
        log::debug!("Lua worker started");
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
                return self
                    .lifecycle
                    .fail()
                    .then(|| ContextEvent::Failed("Lua worker exited unexpectedly".to_string()));
            };
            match message {
                LuaMessage::Output(text) => return Some(ContextEvent::Output(text)),
                LuaMessage::InputRequested => {
                    let id = self.lifecycle.next_correlation_id();
                    if let Some(request) = self.lifecycle.await_input(id, None) {
                        return Some(ContextEvent::InputNeeded(request));
                    }
                }
                LuaMessage::Finished => return self.lifecycle.complete().then_some(ContextEvent::Done),
                LuaMessage::Crashed(message) => {
                    return self.lifecycle.fail().then(|| ContextEvent::Failed(message))
                }
            }
        }
    }

    fn supply_input(&self, response: InputResponse) -> bool {
        if !self.lifecycle.accept_input(response.id) {
            return false;
        }
        match self.commands.lock().as_ref() {
            Some(commands) => commands.send(LuaCommand::Resume(response.text)).is_ok(),
            None => false,
        }
    }

    fn terminate(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if self.lifecycle.cancel() {
            log::debug!("Lua context terminated");
        }
        // Unblocks a worker parked on the command channel.
        self.commands.lock().take();
    }
}

impl Drop for LuaContext {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn run_worker(
    source: &str,
    interval: u32,
    cancelled: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<LuaMessage>,
    commands: std_mpsc::Receiver<LuaCommand>,
) {
    if let Err(e) = drive_program(source, interval, &cancelled, &events, &commands) {
        if !cancelled.load(Ordering::SeqCst) {
            log::error!("Lua worker failed: {}", e);
            let _ = events.send(LuaMessage::Crashed(format_lua_error(&e)));
        }
    }
    log::debug!("Lua worker exiting");
}

fn drive_program(
    source: &str,
    interval: u32,
    cancelled: &Arc<AtomicBool>,
    events: &mpsc::UnboundedSender<LuaMessage>,
    commands: &std_mpsc::Receiver<LuaCommand>,
) -> mlua::Result<()> {
    let lua = Lua::new();
    let input_token = install_environment(&lua, events)?;

    let main = match lua.load(source).set_name("=main").into_function() {
        Ok(function) => function,
        Err(e) => {
            let _ = events.send(LuaMessage::Output(format!(
                "Syntax Error: {}\n",
                format_lua_error(&e)
            )));
            let _ = events.send(LuaMessage::Finished);
            return Ok(());
        }
    };

    // Coroutines inherit the hook of the state that creates them.
    let flag = Arc::clone(cancelled);
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(interval),
        move |_lua, _debug| {
            if flag.load(Ordering::Relaxed) {
                Err(mlua::Error::RuntimeError(CANCELLED_MESSAGE.to_string()))
            } else {
                Ok(VmState::Continue)
            }
        },
    );
    let coroutine = lua.create_thread(main)?;

    let mut answer: Option<String> = None;
    loop {
        let resumed = match answer.take() {
            Some(text) => coroutine.resume::<MultiValue>(text),
            None => coroutine.resume::<MultiValue>(()),
        };

        let values = match resumed {
            Ok(values) => values,
            Err(e) => {
                if cancelled.load(Ordering::SeqCst) {
                    return Ok(());
                }
                let _ = events.send(LuaMessage::Output(format!(
                    "Runtime Error: {}\n",
                    format_lua_error(&e)
                )));
                let _ = events.send(LuaMessage::Finished);
                return Ok(());
            }
        };

        if !matches!(coroutine.status(), ThreadStatus::Resumable) {
            let _ = events.send(LuaMessage::Finished);
            return Ok(());
        }

        let wants_input = matches!(values.iter().next(), Some(Value::Table(token)) if *token == input_token);
        if !wants_input {
            // A bare coroutine.yield() from the program body.
            continue;
        }
        if cancelled.load(Ordering::SeqCst) || events.send(LuaMessage::InputRequested).is_err() {
            return Ok(());
        }
        match commands.recv() {
            Ok(LuaCommand::Resume(text)) => answer = Some(text),
            Err(_) => return Ok(()),
        }
    }
}

/// Installs console I/O and strips process and filesystem access.
/// Returns the token `io.read` yields with.
fn install_environment(lua: &Lua, events: &mpsc::UnboundedSender<LuaMessage>) -> mlua::Result<Table> {
    let globals = lua.globals();

    if let Ok(os) = globals.get::<Table>("os") {
        for name in ["execute", "remove", "rename", "exit", "tmpname", "getenv"] {
            os.set(name, Value::Nil)?;
        }
    }
    // `package.loaded` and the debug registry both reach the real io library.
    for name in ["dofile", "loadfile", "load", "require", "package", "debug"] {
        globals.set(name, Value::Nil)?;
    }

    let print = {
        let events = events.clone();
        lua.create_function(move |lua, args: MultiValue| {
            let line = display_values(lua, &args)?.join("\t");
            let _ = events.send(LuaMessage::Output(line + "\n"));
            Ok(())
        })?
    };
    globals.set("print", print)?;

    let io = lua.create_table()?;
    let write = {
        let events = events.clone();
        lua.create_function(move |lua, args: MultiValue| {
            let text = display_values(lua, &args)?.concat();
            if !text.is_empty() {
                let _ = events.send(LuaMessage::Output(text));
            }
            Ok(())
        })?
    };
    io.set("write", write)?;
    io.set("flush", lua.create_function(|_, _: MultiValue| Ok(()))?)?;

    let token = lua.create_table()?;
    let read: Function = lua
        .load(READ_SOURCE)
        .set_name("=io.read")
        .call(token.clone())?;
    io.set("read", read)?;
    globals.set("io", io)?;

    Ok(token)
}

fn display_values(lua: &Lua, args: &MultiValue) -> mlua::Result<Vec<String>> {
    let tostring: Function = lua.globals().get("tostring")?;
    args.iter()
        .map(|value| {
            let text: mlua::String = tostring.call(value.clone())?;
            Ok(String::from_utf8_lossy(&text.as_bytes()).into_owned())
        })
        .collect()
}

fn format_lua_error(err: &mlua::Error) -> String {
    let message = match err {
        mlua::Error::RuntimeError(msg) => msg.clone(),
        mlua::Error::CallbackError { cause, .. } => format_lua_error(cause),
        mlua::Error::SyntaxError { message, .. } => message.clone(),
        _ => err.to_string(),
    };
    match message.split_once("\nstack traceback:") {
        Some((head, _)) => head.to_string(),
        None => message,
    }
}
