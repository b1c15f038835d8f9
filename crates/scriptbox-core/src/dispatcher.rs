//! Runner registry and process-wide single-flight dispatch
//!
//! The dispatcher owns one [`Runner`] per enabled language and guarantees that
//! at most one run is in flight across all of them. Every run is tagged with a
//! generation number; the callbacks handed to a runner are wrapped so that
//! once a newer generation starts, anything the old run still tries to print
//! or ask is discarded.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::ScriptboxConfig;
use crate::console::{InputHandler, LogHandler};
use crate::languages::{LanguageDescriptor, LANGUAGES};
use crate::runner::{RunOutcome, Runner};

/// Output callback bound to one dispatch generation.
struct ScopedLog {
    generation: u64,
    current: Arc<AtomicU64>,
    inner: Arc<dyn LogHandler>,
}

impl LogHandler for ScopedLog {
    fn log(&self, text: &str) {
        if self.current.load(Ordering::SeqCst) == self.generation {
            self.inner.log(text);
        } else {
            log::debug!("Dropping output from stale run generation {}", self.generation);
        }
    }
}

/// Input callback bound to one dispatch generation.
struct ScopedInput {
    generation: u64,
    current: Arc<AtomicU64>,
    inner: Arc<dyn InputHandler>,
}

#[async_trait]
impl InputHandler for ScopedInput {
    async fn read_input(&self, prompt: Option<&str>) -> String {
        if self.current.load(Ordering::SeqCst) != self.generation {
            log::debug!("Refusing input request from stale run generation {}", self.generation);
            return String::new();
        }
        self.inner.read_input(prompt).await
    }

    fn abandon(&self) {
        // Runners only abandon while their own run is being retired, which
        // always happens before the next generation is published.
        self.inner.abandon();
    }
}

struct InFlight {
    generation: u64,
    runner: Arc<Runner>,
}

pub struct Dispatcher {
    runners: HashMap<&'static str, Arc<Runner>>,
    in_flight: Mutex<Option<InFlight>>,
    generation: Arc<AtomicU64>,
}

impl Dispatcher {
    pub fn new(runners: Vec<Runner>) -> Self {
        let runners = runners
            .into_iter()
            .map(|runner| (runner.descriptor().id, Arc::new(runner)))
            .collect();
        Self {
            runners,
            in_flight: Mutex::new(None),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Builds the registry from configuration, skipping disabled backends.
    pub fn from_config(config: &ScriptboxConfig) -> Self {
        let console = &config.console;
        let mut runners = Vec::new();

        if config.runners.javascript.enabled {
            runners.push(Runner::javascript(&config.runners.javascript, console));
        }
        #[cfg(feature = "python")]
        if config.runners.python.enabled {
            runners.push(Runner::python(&config.runners.python, console));
        }
        #[cfg(not(feature = "python"))]
        if config.runners.python.enabled {
            log::warn!("Python is enabled in configuration but support was not compiled in");
        }
        if config.runners.lua.enabled {
            runners.push(Runner::lua(&config.runners.lua, console));
        }

        let dispatcher = Self::new(runners);
        log::info!(
            "Registered runners: {}",
            dispatcher
                .languages()
                .iter()
                .map(|lang| lang.id)
                .collect::<Vec<_>>()
                .join(", ")
        );
        dispatcher
    }

    /// Registered languages, in presentation order.
    pub fn languages(&self) -> Vec<&'static LanguageDescriptor> {
        LANGUAGES
            .iter()
            .filter(|lang| self.runners.contains_key(lang.id))
            .collect()
    }

    pub fn supports(&self, language: &str) -> bool {
        self.runners.contains_key(language)
    }

    /// Language id of the run currently in flight.
    pub fn in_flight(&self) -> Option<&'static str> {
        self.in_flight
            .lock()
            .as_ref()
            .map(|flight| flight.runner.descriptor().id)
    }

    /// Runs `source` with the runner for `language`, cancelling whatever run
    /// is in flight first. Resolves once the run reaches a terminal state.
    pub async fn dispatch(
        &self,
        language: &str,
        source: &str,
        on_input: Arc<dyn InputHandler>,
        on_log: Arc<dyn LogHandler>,
    ) -> RunOutcome {
        let Some(runner) = self.runners.get(language).cloned() else {
            log::warn!("Unsupported language requested: {}", language);
            on_log.log(&format!("Unsupported language: {}\n", language));
            return RunOutcome::Unsupported;
        };

        // Retiring the previous run and registering this one happen under one
        // lock, so a concurrent dispatch or cancel always finds a run it can
        // reach.
        let (generation, prepared) = {
            let mut in_flight = self.in_flight.lock();
            if let Some(previous) = in_flight.take() {
                log::info!(
                    "Cancelling in-flight {} run before starting {}",
                    previous.runner.descriptor().name,
                    runner.descriptor().name
                );
                previous.runner.cancel();
            }
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let scoped_input = Arc::new(ScopedInput {
                generation,
                current: Arc::clone(&self.generation),
                inner: on_input,
            });
            let scoped_log = Arc::new(ScopedLog {
                generation,
                current: Arc::clone(&self.generation),
                inner: on_log,
            });
            let prepared = runner.prepare(scoped_input, scoped_log);
            *in_flight = Some(InFlight {
                generation,
                runner: Arc::clone(&runner),
            });
            (generation, prepared)
        };

        let outcome = runner.run_prepared(prepared, source).await;

        let mut in_flight = self.in_flight.lock();
        if matches!(in_flight.as_ref(), Some(flight) if flight.generation == generation) {
            in_flight.take();
        }
        outcome
    }

    /// Cancels the in-flight run, if any. Synchronous and idempotent.
    pub fn cancel_current(&self) {
        let mut in_flight = self.in_flight.lock();
        if let Some(flight) = in_flight.take() {
            flight.runner.cancel();
            // Retire the generation only after the interruption marker is out.
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Cancels every runner and releases every held context.
    pub fn cleanup_all(&self) {
        self.cancel_current();
        for runner in self.runners.values() {
            runner.cleanup();
        }
        log::debug!("All runners cleaned up");
    }
}
