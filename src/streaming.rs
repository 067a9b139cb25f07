//! Streaming interface over the synchronous generate call
//!
//! [`TokenStream`] runs a turn on tokio's blocking pool and forwards each
//! fragment through a bounded channel. A slow consumer applies backpressure
//! to generation; dropping the stream cancels the turn at the next token.
//!
//! ## Example
//!
//! ```rust,no_run
//! use echollama::streaming::{StreamConfig, TokenStream};
//! use echollama::Runtime;
//! use futures::StreamExt;
//! use std::sync::Arc;
//!
//! async fn chat(runtime: Arc<Runtime>) -> Result<(), echollama::EchoError> {
//!     let mut stream = TokenStream::new(runtime, 0, "Hello!", StreamConfig::default());
//!     while let Some(event) = stream.next().await {
//!         if let echollama::streaming::StreamEvent::Token { text, .. } = event? {
//!             print!("{}", text);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

use crate::{
    error::{EchoError, Result},
    generation::{CancelToken, GenerationOutcome},
    runtime::Runtime,
    session::SessionId,
    vision::ImageSource,
};
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use tokio::sync::mpsc;

/// Items yielded by a [`TokenStream`]
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A valid UTF-8 fragment, in generation order
    Token { text: String, index: usize },
    /// The turn finished; always the last item of a successful stream
    Complete(GenerationOutcome),
}

/// Configuration for streaming operations
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Capacity of the fragment channel
    pub buffer_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self { buffer_size: 32 }
    }
}

impl StreamConfig {
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(1);
        self
    }
}

/// Token stream for real-time generation
pub struct TokenStream {
    receiver: mpsc::Receiver<Result<StreamEvent>>,
    cancel: CancelToken,
    _handle: tokio::task::JoinHandle<()>,
}

impl TokenStream {
    /// Start a chat turn on `session`. Must be called from a tokio runtime.
    pub fn new(
        runtime: Arc<Runtime>,
        session: SessionId,
        prompt: impl Into<String>,
        config: StreamConfig,
    ) -> Self {
        let prompt = prompt.into();
        Self::spawn(runtime, config, move |rt, cancel, on_token| {
            rt.generate_cancellable(session, &prompt, cancel, on_token, |_| {})
        })
    }

    /// Start a turn that first splices `image` into the session
    pub fn with_image(
        runtime: Arc<Runtime>,
        session: SessionId,
        prompt: impl Into<String>,
        image: ImageSource,
        config: StreamConfig,
    ) -> Self {
        let prompt = prompt.into();
        Self::spawn(runtime, config, move |rt, cancel, on_token| {
            rt.generate_with_image_cancellable(session, &prompt, &image, cancel, on_token, |_| {})
        })
    }

    fn spawn<F>(runtime: Arc<Runtime>, config: StreamConfig, job: F) -> Self
    where
        F: FnOnce(&Runtime, &CancelToken, &mut dyn FnMut(&str)) -> Result<GenerationOutcome>
            + Send
            + 'static,
    {
        let (sender, receiver) = mpsc::channel(config.buffer_size.max(1));
        let cancel = CancelToken::new();
        let worker_cancel = cancel.clone();

        let handle = tokio::task::spawn_blocking(move || {
            let mut index = 0usize;
            let mut on_token = |text: &str| {
                let event = StreamEvent::Token {
                    text: text.to_string(),
                    index,
                };
                index += 1;
                if sender.blocking_send(Ok(event)).is_err() {
                    // receiver dropped
                    worker_cancel.cancel();
                }
            };

            let result = job(&runtime, &worker_cancel, &mut on_token);
            let last = result.map(StreamEvent::Complete);
            if sender.blocking_send(last).is_err() {
                tracing::trace!("token stream receiver dropped before completion");
            }
        });

        TokenStream {
            receiver,
            cancel,
            _handle: handle,
        }
    }

    /// Stop generation at the next token
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }
}

impl Stream for TokenStream {
    type Item = Result<StreamEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for TokenStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Utility functions for streaming
pub mod utils {
    use super::*;

    /// Collect a stream into the complete response text
    pub async fn collect_to_string(
        stream: impl Stream<Item = Result<StreamEvent>> + Unpin,
    ) -> Result<String> {
        Ok(collect_outcome(stream).await?.text)
    }

    /// Drain a stream and return the outcome of the turn
    pub async fn collect_outcome(
        mut stream: impl Stream<Item = Result<StreamEvent>> + Unpin,
    ) -> Result<GenerationOutcome> {
        while let Some(event) = stream.next().await {
            match event? {
                StreamEvent::Token { .. } => {}
                StreamEvent::Complete(outcome) => return Ok(outcome),
            }
        }

        Err(EchoError::BackendError(
            "stream ended before completion".to_string(),
        ))
    }
}
