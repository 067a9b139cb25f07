//! Token-by-token generation for one session
//!
//! A turn appends the user message, re-expands the chat template over the
//! whole history, decodes only the part of the expansion the session's
//! context has not seen yet, then samples one token at a time until an
//! end-of-generation token, the capacity limit, the token ceiling or a
//! cancellation request.
//!
//! Fragments are delivered synchronously on the calling thread, so a slow
//! `on_token` consumer blocks generation. Use [`crate::streaming`] to put a
//! bounded channel in between.

use crate::{
    batch::Batch,
    error::{EchoError, Result},
    model::Model,
    session::{ChatMessage, Session, SessionHandles},
    token::{Pos, Token, TokenId},
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cells kept free at the end of every context
pub const SAFETY_MARGIN: u32 = 4;

/// Runaway guard on sampled tokens per turn
pub const MAX_GENERATED_TOKENS: usize = 4096;

/// Cooperative cancellation flag, checked once per generated token
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the running turn to stop at the next token
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Re-arm the token for another turn
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Why the sampling loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The backend sampled an end-of-generation token
    EndOfSequence,
    /// Remaining capacity reached the safety margin
    ContextFull,
    /// The per-turn ceiling was hit
    TokenLimit,
    Cancelled,
}

/// Result of a successful turn
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutcome {
    pub text: String,
    pub prompt_tokens: usize,
    pub tokens_generated: usize,
    pub stop_reason: StopReason,
}

/// Drives the decode, sample and emit loop
#[derive(Debug, Clone)]
pub struct GenerationEngine {
    safety_margin: u32,
    max_tokens: usize,
}

impl Default for GenerationEngine {
    fn default() -> Self {
        Self {
            safety_margin: SAFETY_MARGIN,
            max_tokens: MAX_GENERATED_TOKENS,
        }
    }
}

impl GenerationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_safety_margin(mut self, safety_margin: u32) -> Self {
        self.safety_margin = safety_margin;
        self
    }

    pub fn safety_margin(&self) -> u32 {
        self.safety_margin
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Highest `n_past` a context of `n_ctx` cells may reach
    pub fn capacity_limit(&self, n_ctx: u32) -> u32 {
        n_ctx.saturating_sub(self.safety_margin)
    }

    /// Run one chat turn.
    ///
    /// On success the history has gained the user message and the
    /// assistant reply, and `on_complete` was called exactly once with the
    /// concatenation of every fragment passed to `on_token`.
    ///
    /// Failures before the prompt reaches the context remove the user
    /// message again. A failure while sampling keeps it, keeps the partial
    /// reply in `last_response`, and does not add an assistant message. The
    /// context is emptied in that case, so the next turn re-applies the
    /// whole history.
    pub fn generate(
        &self,
        model: &Model,
        session: &mut Session,
        prompt: &str,
        cancel: &CancelToken,
        on_token: &mut dyn FnMut(&str),
        on_complete: &mut dyn FnMut(&str),
    ) -> Result<GenerationOutcome> {
        if prompt.is_empty() {
            return Err(EchoError::ConfigurationError("Empty prompt".to_string()));
        }

        let is_first = session.handles_mut()?.context.used_cells() == 0;

        session.history.push(ChatMessage::user(prompt));
        let prompt_tokens = match self.commit_prompt(model, session, is_first) {
            Ok(n) => n,
            Err(e) => {
                session.history.pop();
                tracing::error!("Session {}: {}", session.id(), e);
                return Err(e);
            }
        };

        session.last_response.clear();
        let result = turn_parts(session)
            .and_then(|parts| self.sample_loop(model, parts, cancel, on_token));
        let (stop_reason, tokens_generated) = match result {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(
                    "Session {}: generation aborted: {}; context reset",
                    session.id(),
                    e
                );
                session.reset_context();
                return Err(e);
            }
        };

        let text = session.last_response.clone();
        session.history.push(ChatMessage::assistant(text.clone()));

        session.committed_len =
            match model.apply_chat_template(&session.history, false, &mut session.formatted) {
                Ok(len) => len,
                Err(e) => {
                    tracing::warn!(
                        "Session {}: {}; keeping the prompt expansion as committed",
                        session.id(),
                        e
                    );
                    session.committed_len
                }
            };

        tracing::debug!(
            "Session {}: {} prompt tokens, {} generated, n_past {} ({:?})",
            session.id(),
            prompt_tokens,
            tokens_generated,
            session.n_past,
            stop_reason
        );

        on_complete(&text);

        Ok(GenerationOutcome {
            text,
            prompt_tokens,
            tokens_generated,
            stop_reason,
        })
    }

    /// Template, tokenize, check capacity and decode the new part of the
    /// conversation. Nothing is decoded when any check fails.
    fn commit_prompt(&self, model: &Model, session: &mut Session, is_first: bool) -> Result<usize> {
        let new_len = model.apply_chat_template(&session.history, true, &mut session.formatted)?;
        let start = session.committed_len;
        if start > new_len {
            return Err(EchoError::BackendError(format!(
                "chat template shrank from {} to {} bytes",
                start, new_len
            )));
        }

        let text = std::str::from_utf8(&session.formatted[start..new_len]).map_err(|_| {
            EchoError::BackendError("chat template produced invalid UTF-8".to_string())
        })?;
        let tokens = model.tokenize(text, is_first)?;

        let n_past = session.n_past;
        let handles = session.handles_mut()?;
        let limit = self.capacity_limit(handles.context.n_ctx());
        if n_past as usize + tokens.len() > limit as usize {
            return Err(EchoError::CapacityError(format!(
                "context size exceeded: {} cells used + {} prompt tokens > {}",
                n_past,
                tokens.len(),
                limit
            )));
        }

        handles
            .context
            .decode(&Batch::from_tokens(&tokens, n_past as Pos))?;

        session.n_past += tokens.len() as u32;
        session.committed_len = new_len;
        Ok(tokens.len())
    }

    fn sample_loop(
        &self,
        model: &Model,
        parts: TurnParts<'_>,
        cancel: &CancelToken,
        on_token: &mut dyn FnMut(&str),
    ) -> Result<(StopReason, usize)> {
        let TurnParts {
            handles,
            n_past,
            response,
        } = parts;
        let limit = self.capacity_limit(handles.context.n_ctx());
        let mut generated = 0usize;

        loop {
            if cancel.is_cancelled() {
                return Ok((StopReason::Cancelled, generated));
            }
            if generated >= self.max_tokens {
                return Ok((StopReason::TokenLimit, generated));
            }
            if *n_past >= limit {
                return Ok((StopReason::ContextFull, generated));
            }

            let id: TokenId = handles.sampler.sample(&mut handles.context)?;
            if model.token_is_eog(id) {
                return Ok((StopReason::EndOfSequence, generated));
            }

            let token = Token {
                id,
                piece: model.token_to_piece(id)?,
            };
            match token.text() {
                Some(text) => {
                    on_token(text);
                    response.push_str(text);
                }
                None => tracing::trace!("token {} is not valid UTF-8, not emitted", id),
            }

            handles
                .context
                .decode(&Batch::from_tokens(&[id], *n_past as Pos))?;
            *n_past += 1;
            generated += 1;
        }
    }
}

/// Disjoint mutable borrows of a session used by the sampling loop
struct TurnParts<'a> {
    handles: &'a mut SessionHandles,
    n_past: &'a mut u32,
    response: &'a mut String,
}

fn turn_parts(session: &mut Session) -> Result<TurnParts<'_>> {
    let id = session.id();
    let handles = session.handles.as_mut().ok_or_else(|| {
        EchoError::BackendError(format!("Session {} has no backend context", id))
    })?;
    Ok(TurnParts {
        handles,
        n_past: &mut session.n_past,
        response: &mut session.last_response,
    })
}
