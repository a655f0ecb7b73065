//! Generation stream boundary.
//!
//! The response model (external) is consumed through [`ResponseGenerator`]:
//! given a prompt built from the conversation history, it yields an ordered
//! stream of text tokens and a terminal completion signal. Cancellation is
//! out-of-band via a [`CancellationToken`] so an in-flight speculative
//! generation can be torn down without waiting for the stream to finish.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::conversation::ConversationTurn;

/// Error types for generation operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GenerationError {
    #[error("upstream model error: {0}")]
    Upstream(String),
    #[error("generation timed out: {0}")]
    Timeout(String),
    #[error("invalid prompt: {0}")]
    InvalidPrompt(String),
    #[error("generation cancelled")]
    Cancelled,
}

/// One item on the generation stream.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    /// A text delta, in arrival order.
    Token(String),
    /// Terminal signal: the model finished producing output.
    Done,
}

/// Request handed to the response model.
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    /// Prior turns, oldest first.
    pub history: Vec<ConversationTurn>,
    /// The user utterance to respond to. For speculative generation this is
    /// a partial transcript treated as if it were complete.
    pub user_text: String,
}

impl GenerationRequest {
    pub fn new(history: Vec<ConversationTurn>, user_text: impl Into<String>) -> Self {
        Self {
            history,
            user_text: user_text.into(),
        }
    }
}

/// An in-flight generation: a token stream plus its cancellation handle.
pub struct GenerationStream {
    rx: mpsc::Receiver<Result<GenerationEvent, GenerationError>>,
    cancel: CancellationToken,
}

impl GenerationStream {
    pub fn new(
        rx: mpsc::Receiver<Result<GenerationEvent, GenerationError>>,
        cancel: CancellationToken,
    ) -> Self {
        Self { rx, cancel }
    }

    /// Receives the next stream item. `None` means the producer hung up
    /// without sending `Done` (treated as an upstream failure by callers).
    pub async fn next_event(&mut self) -> Option<Result<GenerationEvent, GenerationError>> {
        self.rx.recv().await
    }

    /// Token observed by the producer side; cancelling it requests upstream
    /// teardown of the generation.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request best-effort cancellation of the upstream generation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl futures::Stream for GenerationStream {
    type Item = Result<GenerationEvent, GenerationError>;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Boundary trait for the response model.
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    /// Starts a streaming generation for the given request.
    async fn generate(&self, request: GenerationRequest)
    -> Result<GenerationStream, GenerationError>;
}

/// Channel capacity for generation streams. Producers block (cooperatively)
/// once this many tokens are unread, which bounds memory for abandoned
/// streams until cancellation lands.
pub const GENERATION_CHANNEL_CAPACITY: usize = 256;
