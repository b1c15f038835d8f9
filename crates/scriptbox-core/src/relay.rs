//! Input relay between an execution context and the host's input callback.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::console::{InputHandler, LogHandler};
use crate::executors::{ExecutionContext, InputRequest, InputResponse};

/// How a relay transaction ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// The answer reached the context.
    Delivered,
    /// The context no longer accepted this request.
    Rejected,
    /// The run was cancelled while the host callback was pending.
    Abandoned,
}

/// Turns one `InputNeeded` event into one host callback and routes the
/// answer back into the context that asked.
///
/// The relay never abandons the host callback itself: on cancellation the
/// runner resolves the pending prompt synchronously, before the relay's
/// future is dropped.
pub struct InputRelay {
    context: Arc<dyn ExecutionContext>,
    on_input: Arc<dyn InputHandler>,
    on_log: Arc<dyn LogHandler>,
    cancel: CancellationToken,
    echo_input: bool,
}

impl InputRelay {
    pub fn new(
        context: Arc<dyn ExecutionContext>,
        on_input: Arc<dyn InputHandler>,
        on_log: Arc<dyn LogHandler>,
        cancel: CancellationToken,
        echo_input: bool,
    ) -> Self {
        Self {
            context,
            on_input,
            on_log,
            cancel,
            echo_input,
        }
    }

    pub async fn forward(&self, request: InputRequest) -> RelayOutcome {
        if self.cancel.is_cancelled() {
            return RelayOutcome::Abandoned;
        }

        let prompt = request.prompt.as_deref().filter(|prompt| !prompt.is_empty());
        if let Some(prompt) = prompt {
            self.on_log.log(prompt);
        }

        let text = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return RelayOutcome::Abandoned,
            text = self.on_input.read_input(prompt) => text,
        };
        if self.cancel.is_cancelled() {
            return RelayOutcome::Abandoned;
        }

        if self.echo_input {
            self.on_log.log(&format!("{}\n", text));
        }

        let response = InputResponse {
            id: request.id,
            text,
        };
        if self.context.supply_input(response) {
            RelayOutcome::Delivered
        } else {
            log::debug!(
                "{} context rejected input for request {}",
                self.context.language(),
                request.id
            );
            RelayOutcome::Rejected
        }
    }
}
