use crate::{
    backend::BackendContext,
    batch::Batch,
    error::{EchoError, Result},
};

/// Parameters for creating a context
#[derive(Debug, Clone, PartialEq)]
pub struct ContextParams {
    pub n_ctx: u32,
    pub n_batch: u32,
    pub n_ubatch: u32,
    pub n_threads: i32,
    pub n_threads_batch: i32,
    pub embeddings: bool,
    pub offload_kqv: bool,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            n_ctx: 4096,
            n_batch: 4096,
            n_ubatch: 512,
            n_threads: num_cpus::get() as i32,
            n_threads_batch: num_cpus::get() as i32,
            embeddings: false,
            offload_kqv: true,
        }
    }
}

/// A session's rolling inference context
///
/// Released by drop. Never shared between sessions.
pub struct Context {
    inner: Box<dyn BackendContext>,
}

impl Context {
    pub(crate) fn new(inner: Box<dyn BackendContext>) -> Self {
        Self { inner }
    }

    /// Process a batch of tokens or embeddings
    pub fn decode(&mut self, batch: &Batch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.inner.decode(batch).map_err(|e| match e {
            EchoError::BackendError(_) => e,
            other => EchoError::BackendError(format!("Decode failed: {}", other)),
        })
    }

    /// Get the context size (number of cells)
    pub fn n_ctx(&self) -> u32 {
        self.inner.n_ctx()
    }

    /// Number of occupied cells
    pub fn used_cells(&self) -> u32 {
        self.inner.used_cells()
    }

    /// Clear the KV cache - removes all tokens
    pub fn kv_cache_clear(&mut self) {
        self.inner.clear();
    }

    /// Set causal attention mode
    pub fn set_causal_attn(&mut self, causal: bool) {
        self.inner.set_causal_attn(causal);
    }

    pub(crate) fn backend_mut(&mut self) -> &mut dyn BackendContext {
        self.inner.as_mut()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("n_ctx", &self.n_ctx())
            .field("used_cells", &self.used_cells())
            .finish()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        tracing::debug!("releasing context ({} cells used)", self.inner.used_cells());
    }
}
