use crate::{
    backend::BackendSampler,
    context::Context,
    error::{EchoError, Result},
    token::TokenId,
};

/// Sampling parameters
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerParams {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: i32,
    pub min_p: f32,
    pub repeat_penalty: f32,
    pub seed: u32,
}

impl Default for SamplerParams {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_p: 1.0,
            top_k: 40,
            min_p: 0.05,
            repeat_penalty: 1.0,
            seed: u32::MAX,
        }
    }
}

/// Sampler for generating tokens, owned by one session
pub struct Sampler {
    inner: Box<dyn BackendSampler>,
}

impl Sampler {
    pub(crate) fn new(inner: Box<dyn BackendSampler>) -> Self {
        Self { inner }
    }

    /// Sample the next token from the last decoded cell of `context`
    pub fn sample(&mut self, context: &mut Context) -> Result<TokenId> {
        self.inner
            .sample(context.backend_mut())
            .map_err(|e| match e {
                EchoError::BackendError(_) => e,
                other => EchoError::BackendError(format!("Sampling failed: {}", other)),
            })
    }

    /// Forget accepted tokens
    pub fn reset(&mut self) {
        self.inner.reset();
    }
}

impl std::fmt::Debug for Sampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sampler").finish_non_exhaustive()
    }
}
