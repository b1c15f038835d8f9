use scriptbox_core::{ConsoleBuffer, Dispatcher, InputRendezvous, RunOutcome, ScriptboxConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const MARKER: &str = "\n[execution interrupted]\n";

struct Session {
    dispatcher: Arc<Dispatcher>,
    console: Arc<ConsoleBuffer>,
    input: Arc<InputRendezvous>,
}

impl Session {
    fn new() -> Self {
        Self::with_config(test_config())
    }

    fn with_config(config: ScriptboxConfig) -> Self {
        Self {
            dispatcher: Arc::new(Dispatcher::from_config(&config)),
            console: Arc::new(ConsoleBuffer::new()),
            input: Arc::new(InputRendezvous::new()),
        }
    }

    fn spawn(&self, language: &str, source: &str) -> JoinHandle<RunOutcome> {
        let dispatcher = Arc::clone(&self.dispatcher);
        let input = Arc::clone(&self.input);
        let console = Arc::clone(&self.console);
        let language = language.to_string();
        let source = source.to_string();
        tokio::spawn(async move { dispatcher.dispatch(&language, &source, input, console).await })
    }

    async fn run(&self, language: &str, source: &str) -> RunOutcome {
        finish(self.spawn(language, source)).await
    }

    async fn wait_for_prompt(&self) {
        tokio::time::timeout(Duration::from_secs(10), self.input.wait_for_request())
            .await
            .expect("program never asked for input");
    }

    fn chunks(&self) -> Vec<String> {
        self.console.chunks()
    }
}

fn test_config() -> ScriptboxConfig {
    let mut config = ScriptboxConfig::default();
    // The embedded interpreter is covered by its own serialized suite.
    config.runners.python.enabled = false;
    config.runners.lua.hook_instruction_interval = 1_000;
    config
}

async fn finish(handle: JoinHandle<RunOutcome>) -> RunOutcome {
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("run did not resolve")
        .expect("run task panicked")
}

async fn eventually(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never became true");
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

#[tokio::test]
async fn test_unknown_language_reports_and_returns() {
    let session = Session::new();

    let outcome = session.run("brainfuck", "+[]").await;

    assert_eq!(outcome, RunOutcome::Unsupported);
    assert_eq!(session.chunks(), strings(&["Unsupported language: brainfuck\n"]));
    assert_eq!(session.dispatcher.in_flight(), None);
}

#[tokio::test]
async fn test_javascript_input_round_trip() {
    let session = Session::new();
    let run = session.spawn(
        "javascript",
        "const name = await input('Name: ');\nconsole.log('Hello, ' + name);",
    );

    session.wait_for_prompt().await;
    assert_eq!(session.dispatcher.in_flight(), Some("javascript"));
    assert!(session.input.submit("Ada"));

    assert_eq!(finish(run).await, RunOutcome::Completed);
    assert_eq!(session.chunks(), strings(&["Name: ", "Hello, Ada\n"]));
    assert_eq!(
        session.chunks().iter().filter(|c| c.contains("Hello, Ada")).count(),
        1
    );
    assert_eq!(session.dispatcher.in_flight(), None);
}

#[tokio::test]
async fn test_echo_input_writes_answer() {
    let mut config = test_config();
    config.runners.javascript.echo_input = true;
    let session = Session::with_config(config);
    let run = session.spawn(
        "javascript",
        "const name = await input('Name: ');\nconsole.log('Hello, ' + name);",
    );

    session.wait_for_prompt().await;
    session.input.submit("Ada");

    assert_eq!(finish(run).await, RunOutcome::Completed);
    assert_eq!(session.chunks(), strings(&["Name: ", "Ada\n", "Hello, Ada\n"]));
}

#[tokio::test]
async fn test_lua_start_then_input_scenario() {
    let session = Session::new();
    let run = session.spawn("lua", "print('start')\nlocal v = io.read()\nprint(v)");

    session.wait_for_prompt().await;
    assert_eq!(session.input.pending_prompt(), Some(None));
    session.input.submit("42");

    assert_eq!(finish(run).await, RunOutcome::Completed);
    assert_eq!(session.chunks(), strings(&["start\n", "42\n"]));
}

#[tokio::test]
async fn test_cancel_while_awaiting_input() {
    let session = Session::new();
    let run = session.spawn("lua", "print('start')\nlocal v = io.read()\nprint('got ' .. v)");
    session.wait_for_prompt().await;

    session.dispatcher.cancel_current();
    session.dispatcher.cancel_current();

    assert_eq!(finish(run).await, RunOutcome::Cancelled);
    assert_eq!(session.input.history(), vec![String::new()]);
    assert!(!session.input.is_waiting());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(session.chunks(), strings(&["start\n", MARKER]));
}

#[tokio::test]
async fn test_cancel_busy_lua_program() {
    let session = Session::new();
    let run = session.spawn("lua", "print('spin')\nwhile true do end");
    eventually(|| !session.console.is_empty()).await;

    session.dispatcher.cancel_current();

    assert_eq!(finish(run).await, RunOutcome::Cancelled);
    assert_eq!(session.chunks(), strings(&["spin\n", MARKER]));
}

#[tokio::test]
async fn test_new_dispatch_cancels_other_language_first() {
    let session = Session::new();
    let first = session.spawn("javascript", "console.log('x');\nwhile (true) {}");
    eventually(|| !session.console.is_empty()).await;

    let second = session.run("lua", "print('y')").await;

    assert_eq!(second, RunOutcome::Completed);
    assert_eq!(finish(first).await, RunOutcome::Cancelled);
    assert_eq!(session.chunks(), strings(&["x\n", MARKER, "y\n"]));
}

#[tokio::test]
async fn test_rerun_same_language_cancels_previous() {
    let session = Session::new();
    let first = session.spawn("lua", "local v = io.read()\nprint('first ' .. v)");
    session.wait_for_prompt().await;

    let second = session.spawn("lua", "local v = io.read()\nprint('second ' .. v)");
    assert_eq!(finish(first).await, RunOutcome::Cancelled);

    eventually(|| session.input.history().len() == 1 && session.input.is_waiting()).await;
    session.input.submit("ok");

    assert_eq!(finish(second).await, RunOutcome::Completed);
    assert_eq!(session.chunks(), strings(&[MARKER, "second ok\n"]));
}

#[tokio::test]
async fn test_cleanup_all_is_idempotent() {
    let session = Session::new();
    let run = session.spawn("javascript", "await input();\nconsole.log('unreachable');");
    session.wait_for_prompt().await;

    session.dispatcher.cleanup_all();
    assert_eq!(finish(run).await, RunOutcome::Cancelled);
    let chunks = session.chunks();
    let history = session.input.history();

    session.dispatcher.cleanup_all();
    assert_eq!(session.chunks(), chunks);
    assert_eq!(session.input.history(), history);
    assert_eq!(session.dispatcher.in_flight(), None);
    assert_eq!(chunks, strings(&[MARKER]));
}

#[tokio::test]
async fn test_javascript_runtime_error_completes() {
    let session = Session::new();

    let outcome = session
        .run("javascript", "console.log('before');\nnull.field;")
        .await;

    assert_eq!(outcome, RunOutcome::Completed);
    let chunks = session.chunks();
    assert_eq!(chunks[0], "before\n");
    assert!(chunks[1].starts_with("Runtime error: "));
    assert_eq!(chunks.len(), 2);
}

#[tokio::test]
async fn test_javascript_compile_error_fails() {
    let session = Session::new();

    let outcome = session.run("javascript", "function (").await;

    assert!(matches!(outcome, RunOutcome::Failed(_)));
    let chunks = session.chunks();
    assert_eq!(chunks.len(), 1);
    assert!(chunks[0].starts_with("Execution failed: "));
}

#[tokio::test]
async fn test_lua_errors_are_reported_as_output() {
    let session = Session::new();

    assert_eq!(session.run("lua", "x = = 1").await, RunOutcome::Completed);
    assert!(session.chunks()[0].starts_with("Syntax Error: "));

    session.console.clear();
    assert_eq!(
        session.run("lua", "local t = nil\nprint(t.field)").await,
        RunOutcome::Completed
    );
    assert!(session.chunks()[0].starts_with("Runtime Error: "));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_dispatches_stay_reachable_by_cancel() {
    let session = Session::new();

    for _ in 0..50 {
        let runs = vec![
            session.spawn("lua", "while true do end"),
            session.spawn("javascript", "while (true) {}"),
        ];

        // Whichever dispatch registers last is the one in flight; every
        // earlier one must already be settled or still reachable from here.
        tokio::time::timeout(Duration::from_secs(10), async {
            while !runs.iter().all(|run| run.is_finished()) {
                session.dispatcher.cancel_current();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("a run escaped cancellation");

        for run in runs {
            assert_eq!(finish(run).await, RunOutcome::Cancelled);
        }
        assert_eq!(session.dispatcher.in_flight(), None);
    }
}
