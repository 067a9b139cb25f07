//! # EchoLlama
//!
//! Session-oriented inference runtime on top of a pluggable model backend.
//!
//! ## Features
//!
//! - Independent chat sessions against one loaded model, each with its own
//!   rolling context and history
//! - Token-by-token generation with a hard capacity limit, cooperative
//!   cancellation and UTF-8 safe streaming
//! - Image embedding injection for vision-capable models
//! - GGUF header reader that works without loading the model
//! - JSON and environment configuration
//!
//! The tokenizer, forward pass and sampler are provided by an implementation
//! of [`ModelBackend`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use echollama::{ModelBackend, ModelParameter, Runtime};
//! use std::sync::Arc;
//!
//! # fn demo(backend: Arc<dyn ModelBackend>) -> Result<(), echollama::EchoError> {
//! let runtime = Runtime::new(backend);
//! runtime.load_model("model.gguf", &[ModelParameter::float("temperature", 0.7)])?;
//!
//! let outcome = runtime.generate(0, "Hello!", |piece| print!("{}", piece), |_| println!())?;
//! println!("{} tokens", outcome.tokens_generated);
//! println!("{}", runtime.get_context_info(0)?);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod batch;
pub mod config;
pub mod context;
pub mod error;
pub mod generation;
pub mod manager;
pub mod metadata;
pub mod model;
pub mod runtime;
pub mod sampling;
pub mod session;
pub mod token;
pub mod vision;

#[cfg(feature = "streaming")]
pub mod streaming;

pub use backend::{BackendContext, BackendModel, BackendSampler, ImageEncoder, ModelBackend};
pub use batch::{Batch, BatchInput};
pub use config::RuntimeConfig;
pub use context::{Context, ContextParams};
pub use error::{EchoError, ErrorKind, Result};
pub use generation::{CancelToken, GenerationEngine, GenerationOutcome, StopReason};
pub use manager::SessionManager;
pub use metadata::{MetadataEntry, ModelMetadata};
pub use model::{LoadParams, Model, ModelParameter, ModelParams, ParamValue};
pub use runtime::Runtime;
pub use sampling::{Sampler, SamplerParams};
pub use session::{ChatMessage, Role, Session, SessionId, SessionSnapshot};
pub use token::{Pos, SeqId, Token, TokenId};
pub use vision::{ImageSource, VisionConfig, VisionEmbedder};

pub mod prelude {
    pub use crate::{
        CancelToken, ChatMessage, EchoError, ImageSource, ModelBackend, ModelParameter, Runtime,
        RuntimeConfig, SessionId, StopReason,
    };
}
