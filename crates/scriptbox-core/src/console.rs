//! Host-side console surfaces
//!
//! A run talks to its host through two callbacks: an append-only output sink
//! ([`LogHandler`]) and an asynchronous human-input source ([`InputHandler`]).
//! This module defines both seams plus the implementations the engine ships
//! with: an in-memory [`ConsoleBuffer`], a [`StdoutConsole`] for terminals and
//! the single-slot [`InputRendezvous`] a front end answers prompts through.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{oneshot, Notify};

/// Append-only consumer of program output.
pub trait LogHandler: Send + Sync {
    fn log(&self, text: &str);
}

impl<F> LogHandler for F
where
    F: Fn(&str) + Send + Sync,
{
    fn log(&self, text: &str) {
        self(text)
    }
}

/// Source of answers to a program's input requests.
///
/// At most one `read_input` call is outstanding at a time. `abandon` resolves
/// that call with an empty string; it is a no-op when nothing is pending.
#[async_trait]
pub trait InputHandler: Send + Sync {
    async fn read_input(&self, prompt: Option<&str>) -> String;

    fn abandon(&self) {}
}

/// In-memory console sink that keeps every chunk it receives.
#[derive(Debug, Default)]
pub struct ConsoleBuffer {
    chunks: Mutex<Vec<String>>,
}

impl ConsoleBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunks(&self) -> Vec<String> {
        self.chunks.lock().clone()
    }

    pub fn contents(&self) -> String {
        self.chunks.lock().concat()
    }

    pub fn len(&self) -> usize {
        self.chunks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.lock().is_empty()
    }

    pub fn clear(&self) {
        self.chunks.lock().clear();
    }
}

impl LogHandler for ConsoleBuffer {
    fn log(&self, text: &str) {
        self.chunks.lock().push(text.to_string());
    }
}

/// Console sink writing straight to the process standard output.
#[derive(Debug, Default)]
pub struct StdoutConsole;

impl LogHandler for StdoutConsole {
    fn log(&self, text: &str) {
        let mut stdout = std::io::stdout().lock();
        if let Err(e) = stdout.write_all(text.as_bytes()).and_then(|_| stdout.flush()) {
            log::warn!("Failed to write program output to stdout: {}", e);
        }
    }
}

struct PendingPrompt {
    ticket: u64,
    prompt: Option<String>,
    reply: oneshot::Sender<String>,
}

/// Single-slot rendezvous between a waiting program and a human.
///
/// `read_input` parks the caller until `submit` or `abandon` fills the slot.
/// Answers are trimmed. Every value handed back to a caller is recorded in
/// [`history`](Self::history), abandonments included. A caller that stops
/// waiting has its request abandoned, so the slot never stays occupied by a
/// reader that is gone.
#[derive(Default)]
pub struct InputRendezvous {
    slot: Mutex<Option<PendingPrompt>>,
    requested: Notify,
    history: Mutex<Vec<String>>,
    next_ticket: AtomicU64,
}

impl InputRendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_waiting(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// The prompt of the pending request, if a request is pending.
    pub fn pending_prompt(&self) -> Option<Option<String>> {
        self.slot.lock().as_ref().map(|pending| pending.prompt.clone())
    }

    /// Waits until a request is pending.
    pub async fn wait_for_request(&self) {
        loop {
            let notified = self.requested.notified();
            if self.is_waiting() {
                return;
            }
            notified.await;
        }
    }

    /// Answers the pending request. Returns false when nothing was waiting.
    pub fn submit(&self, text: &str) -> bool {
        self.resolve(text.trim().to_string())
    }

    pub fn history(&self) -> Vec<String> {
        self.history.lock().clone()
    }

    fn resolve(&self, answer: String) -> bool {
        self.resolve_ticket(None, answer)
    }

    /// Resolves the pending request, optionally only if it carries `ticket`.
    fn resolve_ticket(&self, ticket: Option<u64>, answer: String) -> bool {
        let pending = {
            let mut slot = self.slot.lock();
            let current = match (slot.as_ref(), ticket) {
                (None, _) => false,
                (Some(pending), Some(ticket)) => pending.ticket == ticket,
                (Some(_), None) => true,
            };
            if !current {
                return false;
            }
            slot.take()
        };
        let Some(pending) = pending else {
            return false;
        };
        self.history.lock().push(answer.clone());
        // The reader may have been dropped by a cancelled relay.
        let _ = pending.reply.send(answer);
        true
    }
}

#[async_trait]
impl InputHandler for InputRendezvous {
    async fn read_input(&self, prompt: Option<&str>) -> String {
        let (reply, answer) = oneshot::channel();
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let previous = self.slot.lock().replace(PendingPrompt {
            ticket,
            prompt: prompt.map(str::to_string),
            reply,
        });
        if previous.is_some() {
            log::warn!("Input request replaced an unanswered one");
        }
        self.requested.notify_waiters();

        let _abandon_on_drop = TicketGuard {
            rendezvous: self,
            ticket,
        };
        answer.await.unwrap_or_default()
    }

    fn abandon(&self) {
        if self.resolve(String::new()) {
            log::debug!("Pending input request abandoned");
        }
    }
}

struct TicketGuard<'a> {
    rendezvous: &'a InputRendezvous,
    ticket: u64,
}

impl Drop for TicketGuard<'_> {
    fn drop(&mut self) {
        if self.rendezvous.resolve_ticket(Some(self.ticket), String::new()) {
            log::debug!("Input reader dropped; pending request abandoned");
        }
    }
}
