//! Model backend capability interface
//!
//! The runtime never implements tokenization, attention or sampling itself.
//! A backend (llama.cpp bindings, a remote worker, a test double) provides
//! them through the traits below and is injected into [`crate::Runtime`].
//!
//! Handle ownership follows the backend's own rules: a [`BackendModel`] is
//! owned by the session manager, every [`BackendContext`] and
//! [`BackendSampler`] is owned by exactly one session and released by drop.

use crate::batch::Batch;
use crate::context::ContextParams;
use crate::error::{EchoError, Result};
use crate::model::ModelParams;
use crate::sampling::SamplerParams;
use crate::session::ChatMessage;
use crate::token::TokenId;
use std::path::Path;

/// Entry point of a backend: turns files into loaded handles.
pub trait ModelBackend: Send + Sync {
    /// Short backend label used in diagnostics
    fn name(&self) -> &str {
        "backend"
    }

    /// Load a model file. The path has already been checked to exist.
    fn load_model(&self, path: &Path, params: &ModelParams) -> Result<Box<dyn BackendModel>>;

    /// Load an image encoder (multimodal projector) that produces embeddings
    /// compatible with `model`.
    fn load_image_encoder(
        &self,
        path: &Path,
        model: &dyn BackendModel,
    ) -> Result<Box<dyn ImageEncoder>> {
        let _ = (path, model);
        Err(EchoError::ResourceError(format!(
            "{} does not support image encoders",
            self.name()
        )))
    }
}

/// A loaded model and its vocabulary.
pub trait BackendModel: Send + Sync {
    /// Tokenize `text`. `add_special` is true for the first chunk of a
    /// sequence. Returns an empty vector on failure.
    fn tokenize(&self, text: &str, add_special: bool) -> Vec<TokenId>;

    /// Raw bytes of a token. May be a partial UTF-8 sequence.
    fn token_to_piece(&self, token: TokenId) -> Result<Vec<u8>>;

    /// True for end-of-generation tokens
    fn is_eog(&self, token: TokenId) -> bool;

    /// Expand `messages` through the model's chat template into `buf`.
    ///
    /// Returns the number of bytes the full expansion needs. When that is
    /// larger than `buf.len()` the buffer content is unspecified and the
    /// caller retries with a larger buffer.
    fn apply_chat_template(
        &self,
        messages: &[ChatMessage],
        add_assistant: bool,
        buf: &mut [u8],
    ) -> Result<usize>;

    /// Width of one embedding row
    fn n_embd(&self) -> usize;

    /// Context length the model was trained with
    fn n_ctx_train(&self) -> u32;

    fn new_context(&self, params: &ContextParams) -> Result<Box<dyn BackendContext>>;

    fn new_sampler(&self, params: &SamplerParams) -> Result<Box<dyn BackendSampler>>;
}

/// Rolling inference context. Not reentrant.
pub trait BackendContext: Send {
    fn decode(&mut self, batch: &Batch) -> Result<()>;

    /// Total number of cells
    fn n_ctx(&self) -> u32;

    /// Occupied cells
    fn used_cells(&self) -> u32;

    /// Remove every cell
    fn clear(&mut self);

    fn set_causal_attn(&mut self, causal: bool);
}

/// Token sampler bound to one context.
pub trait BackendSampler: Send {
    /// Sample the next token from the logits of the last decoded cell and
    /// accept it into the sampler history.
    fn sample(&mut self, ctx: &mut dyn BackendContext) -> Result<TokenId>;

    /// Forget accepted history
    fn reset(&mut self) {}
}

/// Image encoder producing a fixed number of embedding rows per image.
pub trait ImageEncoder: Send + Sync {
    /// Rows produced per image
    fn n_tokens(&self) -> usize {
        256
    }

    /// Width of each row; must match the text model
    fn n_embd(&self) -> usize;

    /// Encode interleaved RGB8 pixels into `n_tokens() * n_embd()` floats.
    fn encode(&self, rgb: &[u8], width: u32, height: u32) -> Result<Vec<f32>>;
}
