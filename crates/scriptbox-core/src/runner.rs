//! Per-language runner
//!
//! A [`Runner`] owns at most one execution context at a time. It turns the
//! context's event stream into calls on the host's output and input
//! callbacks, and it resolves every run exactly once, whatever ends it.
//! Cancellation is synchronous: by the time [`Runner::cancel`] returns, the
//! pending prompt has been answered, the context is terminated and the run's
//! outcome is settled, even though the worker itself may still be unwinding.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::{ConsoleConfig, JavaScriptRunnerConfig, LuaRunnerConfig};
use crate::console::{InputHandler, LogHandler};
use crate::executors::{
    ContextEvent, ContextFactory, ContextState, ExecutionContext, JavaScriptContext, LuaContext,
};
use crate::languages::{self, LanguageDescriptor};
use crate::relay::InputRelay;

/// Terminal result of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed(String),
    Cancelled,
    Unsupported,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Completed => write!(f, "completed"),
            RunOutcome::Failed(message) => write!(f, "failed: {}", message),
            RunOutcome::Cancelled => write!(f, "cancelled"),
            RunOutcome::Unsupported => write!(f, "unsupported"),
        }
    }
}

/// One-shot completion signal; the first resolution wins.
struct CompletionLatch {
    sender: Mutex<Option<oneshot::Sender<RunOutcome>>>,
}

impl CompletionLatch {
    fn new() -> (Arc<Self>, oneshot::Receiver<RunOutcome>) {
        let (sender, receiver) = oneshot::channel();
        let latch = Self {
            sender: Mutex::new(Some(sender)),
        };
        (Arc::new(latch), receiver)
    }

    fn resolve(&self, outcome: RunOutcome) -> bool {
        match self.sender.lock().take() {
            Some(sender) => {
                // The waiting run may already have been dropped.
                let _ = sender.send(outcome);
                true
            }
            None => false,
        }
    }
}

/// Output path of a single run. Closing it is final; text emitted
/// afterwards is dropped.
struct OutputGate {
    open: Mutex<bool>,
    sink: Arc<dyn LogHandler>,
}

impl OutputGate {
    fn new(sink: Arc<dyn LogHandler>) -> Self {
        Self {
            open: Mutex::new(true),
            sink,
        }
    }

    fn close(&self) {
        *self.open.lock() = false;
    }

    /// Writes `text` as the last chunk of the run.
    fn close_with(&self, text: &str) {
        let mut open = self.open.lock();
        if *open && !text.is_empty() {
            self.sink.log(text);
        }
        *open = false;
    }
}

impl LogHandler for OutputGate {
    fn log(&self, text: &str) {
        let open = self.open.lock();
        if *open {
            self.sink.log(text);
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub echo_input: bool,
    pub interruption_marker: String,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            echo_input: false,
            interruption_marker: ConsoleConfig::default().interruption_marker,
        }
    }
}

/// A run registered with its runner but not yet started.
pub(crate) struct PreparedRun {
    run: ActiveRun,
    completion: oneshot::Receiver<RunOutcome>,
}

#[derive(Clone)]
struct ActiveRun {
    id: u64,
    context: Arc<dyn ExecutionContext>,
    cancel: CancellationToken,
    latch: Arc<CompletionLatch>,
    on_input: Arc<dyn InputHandler>,
    output: Arc<OutputGate>,
}

impl ActiveRun {
    fn fail(&self, message: String) {
        let line = format!("Execution failed: {}\n", message);
        if self.latch.resolve(RunOutcome::Failed(message)) {
            self.output.close_with(&line);
        }
    }
}

pub struct Runner {
    descriptor: LanguageDescriptor,
    factory: ContextFactory,
    options: RunnerOptions,
    active: Mutex<Option<ActiveRun>>,
    next_run: AtomicU64,
}

impl Runner {
    pub fn new(descriptor: LanguageDescriptor, factory: ContextFactory, options: RunnerOptions) -> Self {
        Self {
            descriptor,
            factory,
            options,
            active: Mutex::new(None),
            next_run: AtomicU64::new(1),
        }
    }

    pub fn javascript(config: &JavaScriptRunnerConfig, console: &ConsoleConfig) -> Self {
        let factory: ContextFactory =
            Arc::new(|| Arc::new(JavaScriptContext::new()) as Arc<dyn ExecutionContext>);
        Self::new(
            languages::JAVASCRIPT,
            factory,
            RunnerOptions {
                echo_input: config.echo_input,
                interruption_marker: console.interruption_marker.clone(),
            },
        )
    }

    pub fn lua(config: &LuaRunnerConfig, console: &ConsoleConfig) -> Self {
        let interval = config.hook_instruction_interval;
        let factory: ContextFactory =
            Arc::new(move || Arc::new(LuaContext::new(interval)) as Arc<dyn ExecutionContext>);
        Self::new(
            languages::LUA,
            factory,
            RunnerOptions {
                echo_input: config.echo_input,
                interruption_marker: console.interruption_marker.clone(),
            },
        )
    }

    #[cfg(feature = "python")]
    pub fn python(config: &crate::config::PythonRunnerConfig, console: &ConsoleConfig) -> Self {
        use crate::executors::PythonContext;

        let capacity = config.input_buffer_bytes;
        let factory: ContextFactory = Arc::new(move || {
            Arc::new(PythonContext::new(capacity)) as Arc<dyn ExecutionContext>
        });
        Self::new(
            languages::PYTHON,
            factory,
            RunnerOptions {
                echo_input: config.echo_input,
                interruption_marker: console.interruption_marker.clone(),
            },
        )
    }

    pub fn descriptor(&self) -> &LanguageDescriptor {
        &self.descriptor
    }

    /// Whether this runner currently holds a context.
    pub fn is_running(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Runs `source` to a terminal state. Any run this runner still holds is
    /// cancelled first.
    pub async fn execute(
        &self,
        source: &str,
        on_input: Arc<dyn InputHandler>,
        on_log: Arc<dyn LogHandler>,
    ) -> RunOutcome {
        let prepared = self.prepare(on_input, on_log);
        self.run_prepared(prepared, source).await
    }

    /// Installs a fresh run as this runner's active run without starting it.
    /// From here on [`Runner::cancel`] reaches the run, even before its
    /// context has been started.
    pub(crate) fn prepare(
        &self,
        on_input: Arc<dyn InputHandler>,
        on_log: Arc<dyn LogHandler>,
    ) -> PreparedRun {
        self.cancel();

        let (latch, completion) = CompletionLatch::new();
        let run = ActiveRun {
            id: self.next_run.fetch_add(1, Ordering::Relaxed),
            context: (self.factory)(),
            cancel: CancellationToken::new(),
            latch,
            on_input,
            output: Arc::new(OutputGate::new(on_log)),
        };
        let stale = self.active.lock().replace(run.clone());
        if let Some(stale) = stale {
            // Only reachable when two prepares race on one runner.
            log::warn!("{} runner replaced a run it had not retired", self.descriptor.name);
            stale.cancel.cancel();
            stale.context.terminate();
            self.settle_cancelled(&stale);
        }
        PreparedRun { run, completion }
    }

    /// Starts a prepared run and drives it to a terminal state.
    pub(crate) async fn run_prepared(&self, prepared: PreparedRun, source: &str) -> RunOutcome {
        let PreparedRun { run, completion } = prepared;

        if run.cancel.is_cancelled() {
            log::debug!("{} run #{} cancelled before start", self.descriptor.name, run.id);
        } else {
            log::info!("Starting {} run #{}", self.descriptor.name, run.id);
            match run.context.start(source) {
                Ok(()) => self.drive(&run).await,
                Err(e) => run.fail(e.to_string()),
            }
        }

        self.release(run.id);
        let outcome = completion.await.unwrap_or(RunOutcome::Cancelled);
        log::info!("{} run #{} {}", self.descriptor.name, run.id, outcome);
        outcome
    }

    async fn drive(&self, run: &ActiveRun) {
        let relay = InputRelay::new(
            Arc::clone(&run.context),
            Arc::clone(&run.on_input),
            run.output.clone(),
            run.cancel.clone(),
            self.options.echo_input,
        );

        loop {
            let event = tokio::select! {
                biased;
                _ = run.cancel.cancelled() => return,
                event = run.context.next_event() => event,
            };

            match event {
                Some(ContextEvent::Output(text)) => run.output.log(&text),
                Some(ContextEvent::InputNeeded(request)) => {
                    let outcome = relay.forward(request).await;
                    log::debug!("{} input relay: {:?}", self.descriptor.name, outcome);
                }
                Some(ContextEvent::Done) => {
                    run.latch.resolve(RunOutcome::Completed);
                    run.output.close();
                    return;
                }
                Some(ContextEvent::Failed(message)) => {
                    run.fail(message);
                    return;
                }
                None if run.context.state() == ContextState::Cancelled => {
                    self.settle_cancelled(run);
                    return;
                }
                None => {
                    run.fail("execution context closed without a result".to_string());
                    return;
                }
            }
        }
    }

    /// Cancels the held run, if any. Synchronous and idempotent.
    pub fn cancel(&self) {
        let Some(run) = self.active.lock().take() else {
            return;
        };

        run.cancel.cancel();
        if run.context.state() == ContextState::AwaitingInput {
            run.on_input.abandon();
        }
        run.context.terminate();
        self.settle_cancelled(&run);
    }

    /// Cancels the held run and releases its context.
    pub fn cleanup(&self) {
        self.cancel();
        log::debug!("{} runner cleaned up", self.descriptor.name);
    }

    fn settle_cancelled(&self, run: &ActiveRun) {
        if run.latch.resolve(RunOutcome::Cancelled) {
            log::info!("{} run #{} cancelled", self.descriptor.name, run.id);
            run.output.close_with(&self.options.interruption_marker);
        } else {
            run.output.close();
        }
    }

    fn release(&self, run_id: u64) {
        let released = {
            let mut active = self.active.lock();
            match active.as_ref() {
                Some(run) if run.id == run_id => active.take(),
                _ => None,
            }
        };
        if let Some(run) = released {
            run.output.close();
        }
    }
}

impl Drop for Runner {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::{ConsoleBuffer, InputRendezvous};
    use crate::errors::ContextError;
    use crate::executors::{InputResponse, Lifecycle};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::time::Duration;

    const MARKER: &str = "\n[execution interrupted]\n";

    #[derive(Debug, Clone)]
    enum Step {
        Emit(ContextEvent),
        Ask(Option<&'static str>),
        EchoAnswer,
        Hang,
    }

    /// Context that replays a fixed script of events.
    struct ScriptedContext {
        lifecycle: Lifecycle,
        steps: Mutex<VecDeque<Step>>,
        answers: Mutex<Vec<String>>,
        fail_start: bool,
    }

    impl ScriptedContext {
        fn new(steps: Vec<Step>, fail_start: bool) -> Self {
            Self {
                lifecycle: Lifecycle::new(),
                steps: Mutex::new(steps.into()),
                answers: Mutex::new(Vec::new()),
                fail_start,
            }
        }
    }

    #[async_trait]
    impl ExecutionContext for ScriptedContext {
        fn language(&self) -> &'static str {
            "scripted"
        }

        fn state(&self) -> ContextState {
            self.lifecycle.state()
        }

        fn start(&self, _source: &str) -> Result<(), ContextError> {
            self.lifecycle.begin()?;
            if self.fail_start {
                self.lifecycle.fail();
                return Err(ContextError::Spawn(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "no threads left",
                )));
            }
            Ok(())
        }

        async fn next_event(&self) -> Option<ContextEvent> {
            if self.lifecycle.state().is_terminal() {
                return None;
            }
            let step = self.steps.lock().pop_front();
            match step {
                Some(Step::Emit(ContextEvent::Done)) | None => {
                    self.lifecycle.complete().then_some(ContextEvent::Done)
                }
                Some(Step::Emit(ContextEvent::Failed(message))) => {
                    self.lifecycle.fail().then(|| ContextEvent::Failed(message))
                }
                Some(Step::Emit(event)) => Some(event),
                Some(Step::Ask(prompt)) => {
                    let id = self.lifecycle.next_correlation_id();
                    self.lifecycle
                        .await_input(id, prompt.map(str::to_string))
                        .map(ContextEvent::InputNeeded)
                }
                Some(Step::EchoAnswer) => {
                    let answer = self.answers.lock().last().cloned().unwrap_or_default();
                    Some(ContextEvent::Output(format!("{}\n", answer)))
                }
                Some(Step::Hang) => std::future::pending().await,
            }
        }

        fn supply_input(&self, response: InputResponse) -> bool {
            if !self.lifecycle.accept_input(response.id) {
                return false;
            }
            self.answers.lock().push(response.text);
            true
        }

        fn terminate(&self) {
            self.lifecycle.cancel();
        }
    }

    struct Harness {
        runner: Arc<Runner>,
        contexts: Arc<Mutex<Vec<Arc<ScriptedContext>>>>,
        console: Arc<ConsoleBuffer>,
        input: Arc<InputRendezvous>,
    }

    fn harness(steps: Vec<Step>, fail_start: bool) -> Harness {
        let contexts: Arc<Mutex<Vec<Arc<ScriptedContext>>>> = Arc::default();
        let factory: ContextFactory = {
            let contexts = Arc::clone(&contexts);
            Arc::new(move || {
                let context = Arc::new(ScriptedContext::new(steps.clone(), fail_start));
                contexts.lock().push(Arc::clone(&context));
                context as Arc<dyn ExecutionContext>
            })
        };
        Harness {
            runner: Arc::new(Runner::new(
                languages::LUA,
                factory,
                RunnerOptions::default(),
            )),
            contexts,
            console: Arc::new(ConsoleBuffer::new()),
            input: Arc::new(InputRendezvous::new()),
        }
    }

    impl Harness {
        fn spawn_run(&self) -> tokio::task::JoinHandle<RunOutcome> {
            let runner = Arc::clone(&self.runner);
            let input = Arc::clone(&self.input);
            let console = Arc::clone(&self.console);
            tokio::spawn(async move { runner.execute("", input, console).await })
        }

        async fn wait_for_prompt(&self) {
            tokio::time::timeout(Duration::from_secs(5), self.input.wait_for_request())
                .await
                .expect("no input request");
        }
    }

    async fn finish(handle: tokio::task::JoinHandle<RunOutcome>) -> RunOutcome {
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("run did not resolve")
            .unwrap()
    }

    fn output(text: &str) -> Step {
        Step::Emit(ContextEvent::Output(text.to_string()))
    }

    #[tokio::test]
    async fn test_start_then_input_scenario() {
        let h = harness(vec![output("start\n"), Step::Ask(None), Step::EchoAnswer], false);
        let run = h.spawn_run();

        h.wait_for_prompt().await;
        assert!(h.input.submit("42"));

        assert_eq!(finish(run).await, RunOutcome::Completed);
        assert_eq!(h.console.chunks(), vec!["start\n".to_string(), "42\n".to_string()]);
        assert!(!h.runner.is_running());
    }

    #[tokio::test]
    async fn test_unit_failure_is_logged_once() {
        let h = harness(
            vec![
                output("partial\n"),
                Step::Emit(ContextEvent::Failed("worker crashed".to_string())),
                output("never\n"),
            ],
            false,
        );
        let outcome = finish(h.spawn_run()).await;

        assert_eq!(outcome, RunOutcome::Failed("worker crashed".to_string()));
        assert_eq!(
            h.console.chunks(),
            vec![
                "partial\n".to_string(),
                "Execution failed: worker crashed\n".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_start_failure_resolves_failed() {
        let h = harness(vec![output("never\n")], true);
        let outcome = finish(h.spawn_run()).await;

        assert!(matches!(outcome, RunOutcome::Failed(_)));
        assert_eq!(
            h.console.contents(),
            "Execution failed: failed to spawn execution unit: no threads left\n"
        );
    }

    #[tokio::test]
    async fn test_cancel_while_awaiting_input() {
        let h = harness(vec![output("start\n"), Step::Ask(Some("? ")), Step::EchoAnswer], false);
        let run = h.spawn_run();
        h.wait_for_prompt().await;

        h.runner.cancel();
        h.runner.cancel();

        assert_eq!(finish(run).await, RunOutcome::Cancelled);
        assert_eq!(h.input.history(), vec![String::new()]);
        assert_eq!(
            h.console.chunks(),
            vec!["start\n".to_string(), "? ".to_string(), MARKER.to_string()]
        );
        assert_eq!(h.contexts.lock()[0].state(), ContextState::Cancelled);
        assert!(h.contexts.lock()[0].answers.lock().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_mid_computation() {
        let h = harness(vec![output("spin\n"), Step::Hang], false);
        let run = h.spawn_run();
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.console.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        h.runner.cancel();
        assert_eq!(finish(run).await, RunOutcome::Cancelled);
        assert_eq!(h.console.chunks(), vec!["spin\n".to_string(), MARKER.to_string()]);
        assert!(h.input.history().is_empty());
    }

    #[tokio::test]
    async fn test_new_run_cancels_previous() {
        let h = harness(vec![Step::Ask(None), Step::EchoAnswer], false);
        let first = h.spawn_run();
        h.wait_for_prompt().await;

        let second = h.spawn_run();
        assert_eq!(finish(first).await, RunOutcome::Cancelled);

        // The abandoned prompt was answered with empty text; the new run asks again.
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.input.history().is_empty() || !h.input.is_waiting() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        h.input.submit("again");

        assert_eq!(finish(second).await, RunOutcome::Completed);
        assert_eq!(h.contexts.lock().len(), 2);
        assert_eq!(h.contexts.lock()[0].state(), ContextState::Cancelled);
        assert_eq!(h.console.chunks(), vec![MARKER.to_string(), "again\n".to_string()]);
    }

    #[tokio::test]
    async fn test_cancel_without_run_is_noop() {
        let h = harness(vec![], false);
        h.runner.cancel();
        h.runner.cleanup();
        assert!(h.console.is_empty());

        assert_eq!(finish(h.spawn_run()).await, RunOutcome::Completed);
        h.runner.cancel();
        assert!(h.console.is_empty());
    }

    #[test]
    fn test_latch_resolves_once() {
        let (latch, mut receiver) = CompletionLatch::new();
        assert!(latch.resolve(RunOutcome::Completed));
        assert!(!latch.resolve(RunOutcome::Cancelled));
        assert_eq!(receiver.try_recv().unwrap(), RunOutcome::Completed);
    }
}
