//! Scriptbox Core - sandboxed multi-runtime execution engine
//!
//! Runs short interactive programs written in JavaScript, Lua or Python inside
//! isolated worker threads, streams their console output to a host sink and
//! relays their input requests to a human. At most one program runs at a
//! time across the whole process; starting another one, or cancelling,
//! retires the previous run synchronously.
//!
//! ```no_run
//! use std::sync::Arc;
//! use scriptbox_core::{ConsoleBuffer, Dispatcher, InputRendezvous, ScriptboxConfig};
//!
//! # async fn demo() {
//! let dispatcher = Dispatcher::from_config(&ScriptboxConfig::default());
//! let console = Arc::new(ConsoleBuffer::new());
//! let input = Arc::new(InputRendezvous::new());
//! dispatcher
//!     .dispatch("lua", "print('hi')", input, console.clone())
//!     .await;
//! assert_eq!(console.contents(), "hi\n");
//! # }
//! ```

pub mod config;
pub mod console;
pub mod dispatcher;
pub mod errors;
pub mod executors;
pub mod languages;
pub mod relay;
pub mod runner;

pub use config::{ConfigLoader, ScriptboxConfig};
pub use console::{ConsoleBuffer, InputHandler, InputRendezvous, LogHandler, StdoutConsole};
pub use dispatcher::Dispatcher;
pub use errors::{ContextError, ScriptboxError};
pub use executors::{ContextEvent, ContextState, ExecutionContext};
pub use languages::{find_language, language_for_extension, LanguageDescriptor, LANGUAGES};
pub use runner::{RunOutcome, Runner, RunnerOptions};
