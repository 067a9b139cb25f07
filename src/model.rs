use crate::{
    backend::{BackendModel, ModelBackend},
    context::{Context, ContextParams},
    error::{EchoError, Result},
    sampling::{Sampler, SamplerParams},
    session::ChatMessage,
    token::TokenId,
};
use std::fmt;
use std::path::{Path, PathBuf};

/// Parameters for loading a model file
#[derive(Debug, Clone, PartialEq)]
pub struct ModelParams {
    pub n_gpu_layers: i32,
    pub use_mmap: bool,
    pub use_mlock: bool,
    pub check_tensors: bool,
    pub vocab_only: bool,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            n_gpu_layers: 99,
            use_mmap: true,
            use_mlock: false,
            check_tensors: true,
            vocab_only: false,
        }
    }
}

/// Value of a named load-time parameter
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Float(f32),
    Int(i64),
    Str(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Float(v) => write!(f, "{}", v),
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::Str(v) => f.write_str(v),
        }
    }
}

/// A typed, named configuration value applied once at load time
#[derive(Debug, Clone, PartialEq)]
pub struct ModelParameter {
    pub key: String,
    pub value: ParamValue,
}

impl ModelParameter {
    pub fn float(key: impl Into<String>, value: f32) -> Self {
        Self {
            key: key.into(),
            value: ParamValue::Float(value),
        }
    }

    pub fn int(key: impl Into<String>, value: i64) -> Self {
        Self {
            key: key.into(),
            value: ParamValue::Int(value),
        }
    }

    pub fn string(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: ParamValue::Str(value.into()),
        }
    }
}

/// Everything a model load needs: file, per-session context and sampler settings
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadParams {
    pub model: ModelParams,
    pub context: ContextParams,
    pub sampling: SamplerParams,
}

impl LoadParams {
    /// Build settings from named parameters.
    ///
    /// Unknown names and recognised names with the wrong value type are
    /// logged and skipped, never rejected.
    pub fn from_parameters(params: &[ModelParameter]) -> Self {
        let mut settings = Self::default();
        for param in params {
            settings.apply(param);
        }
        settings
    }

    /// Apply one parameter. Returns false when it was ignored.
    pub fn apply(&mut self, param: &ModelParameter) -> bool {
        tracing::info!("{}: {}", param.key, param.value);

        let applied = match (param.key.as_str(), &param.value) {
            ("temperature", ParamValue::Float(v)) => {
                self.sampling.temperature = *v;
                true
            }
            ("repetition_penalty", ParamValue::Float(v)) => {
                self.sampling.repeat_penalty = *v;
                true
            }
            ("top_p" | "top_P", ParamValue::Float(v)) => {
                self.sampling.top_p = *v;
                true
            }
            ("min_p", ParamValue::Float(v)) => {
                self.sampling.min_p = *v;
                true
            }
            ("top_k", ParamValue::Float(v)) => {
                self.sampling.top_k = *v as i32;
                true
            }
            ("top_k", ParamValue::Int(v)) => match i32::try_from(*v) {
                Ok(k) => {
                    self.sampling.top_k = k;
                    true
                }
                Err(_) => false,
            },
            ("seed", ParamValue::Int(v)) => {
                self.sampling.seed = *v as u32;
                true
            }
            ("context_size", ParamValue::Int(v)) => match positive_u32(*v) {
                Some(n) => {
                    self.context.n_ctx = n;
                    self.context.n_batch = n;
                    true
                }
                None => false,
            },
            ("n_batch", ParamValue::Int(v)) => match positive_u32(*v) {
                Some(n) => {
                    self.context.n_batch = n;
                    true
                }
                None => false,
            },
            ("threads", ParamValue::Int(v)) => match i32::try_from(*v) {
                Ok(n) if n > 0 => {
                    self.context.n_threads = n;
                    self.context.n_threads_batch = n;
                    true
                }
                _ => false,
            },
            ("gpu_layers" | "n_gpu_layers", ParamValue::Int(v)) => match i32::try_from(*v) {
                Ok(n) => {
                    self.model.n_gpu_layers = n;
                    true
                }
                Err(_) => false,
            },
            _ => false,
        };

        if !applied {
            match param.value {
                ParamValue::Str(_) => {}
                _ => tracing::warn!("Unused parameter: {}", param.key),
            }
        }
        applied
    }
}

fn positive_u32(v: i64) -> Option<u32> {
    u32::try_from(v).ok().filter(|&n| n > 0)
}

/// The loaded model handle
///
/// Exclusively owned by the session manager. Every per-session context and
/// sampler is created through it and must be dropped before it.
pub struct Model {
    inner: Box<dyn BackendModel>,
    path: PathBuf,
    params: LoadParams,
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("path", &self.path)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl Model {
    /// Load a model through `backend`
    pub fn load(backend: &dyn ModelBackend, path: impl AsRef<Path>, params: LoadParams) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(EchoError::ModelLoadError(format!(
                "Model file not found: {}",
                path.display()
            )));
        }

        tracing::info!(
            "Loading model context({}): {}",
            params.context.n_ctx,
            path.display()
        );

        let inner = backend.load_model(path, &params.model).map_err(|e| match e {
            EchoError::ModelLoadError(_) => e,
            other => EchoError::ModelLoadError(other.to_string()),
        })?;

        Ok(Self {
            inner,
            path: path.to_path_buf(),
            params,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn params(&self) -> &LoadParams {
        &self.params
    }

    pub(crate) fn backend(&self) -> &dyn BackendModel {
        self.inner.as_ref()
    }

    /// Create a fresh context using the load-time context parameters
    pub fn create_context(&self) -> Result<Context> {
        let n_ctx_train = self.n_ctx_train();
        if n_ctx_train > 0 && self.params.context.n_ctx > n_ctx_train {
            tracing::warn!(
                "Context size {} exceeds the {} tokens the model was trained with",
                self.params.context.n_ctx,
                n_ctx_train
            );
        }
        let inner = self.inner.new_context(&self.params.context)?;
        let context = Context::new(inner);
        tracing::info!("Maximum context size: {}", context.n_ctx());
        Ok(context)
    }

    /// Create a fresh sampler using the load-time sampling parameters
    pub fn create_sampler(&self) -> Result<Sampler> {
        Ok(Sampler::new(self.inner.new_sampler(&self.params.sampling)?))
    }

    /// Tokenize text. An empty result for non-empty text is a failure.
    pub fn tokenize(&self, text: &str, add_special: bool) -> Result<Vec<TokenId>> {
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let tokens = self.inner.tokenize(text, add_special);
        if tokens.is_empty() {
            return Err(EchoError::TokenizationError(
                "Failed to tokenize the prompt".to_string(),
            ));
        }
        Ok(tokens)
    }

    /// Bytes of a token, possibly an incomplete UTF-8 sequence
    pub fn token_to_piece(&self, token: TokenId) -> Result<Vec<u8>> {
        self.inner.token_to_piece(token).map_err(|e| match e {
            EchoError::BackendError(_) => e,
            other => EchoError::BackendError(format!(
                "failed to convert token to piece: {}",
                other
            )),
        })
    }

    /// Check if token is end of generation
    pub fn token_is_eog(&self, token: TokenId) -> bool {
        self.inner.is_eog(token)
    }

    pub fn n_embd(&self) -> usize {
        self.inner.n_embd()
    }

    pub fn n_ctx_train(&self) -> u32 {
        self.inner.n_ctx_train()
    }

    /// Apply the chat template into `buf`, growing it once when undersized.
    ///
    /// Returns the length of the expansion; `buf[..len]` holds it.
    pub fn apply_chat_template(
        &self,
        messages: &[ChatMessage],
        add_assistant: bool,
        buf: &mut Vec<u8>,
    ) -> Result<usize> {
        let template_err = |e: EchoError| {
            EchoError::BackendError(format!("failed to apply the chat template: {}", e))
        };

        let mut required = self
            .inner
            .apply_chat_template(messages, add_assistant, buf)
            .map_err(template_err)?;
        if required > buf.len() {
            buf.resize(required, 0);
            required = self
                .inner
                .apply_chat_template(messages, add_assistant, buf)
                .map_err(template_err)?;
            if required > buf.len() {
                return Err(EchoError::BackendError(
                    "failed to apply the chat template: buffer still too small".to_string(),
                ));
            }
        }
        Ok(required)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recognised_parameters() {
        let params = vec![
            ModelParameter::float("temperature", 0.3),
            ModelParameter::float("top_P", 0.9),
            ModelParameter::float("top_k", 20.0),
            ModelParameter::float("repetition_penalty", 1.2),
            ModelParameter::int("context_size", 2048),
            ModelParameter::int("gpu_layers", 0),
        ];
        let settings = LoadParams::from_parameters(&params);
        assert_eq!(settings.sampling.temperature, 0.3);
        assert_eq!(settings.sampling.top_p, 0.9);
        assert_eq!(settings.sampling.top_k, 20);
        assert_eq!(settings.sampling.repeat_penalty, 1.2);
        assert_eq!(settings.context.n_ctx, 2048);
        assert_eq!(settings.context.n_batch, 2048);
        assert_eq!(settings.model.n_gpu_layers, 0);
    }

    #[test]
    fn test_unknown_and_mistyped_parameters_are_ignored() {
        let mut settings = LoadParams::default();
        let before = settings.clone();

        assert!(!settings.apply(&ModelParameter::float("warp_factor", 9.0)));
        assert!(!settings.apply(&ModelParameter::string("temperature", "hot")));
        assert!(!settings.apply(&ModelParameter::int("context_size", -5)));
        assert!(!settings.apply(&ModelParameter::string("model_name", "x")));
        assert_eq!(settings, before);
    }

    #[test]
    fn test_out_of_range_integers_are_ignored() {
        let mut settings = LoadParams::default();
        let before = settings.clone();

        assert!(!settings.apply(&ModelParameter::int("context_size", i64::MAX)));
        assert!(!settings.apply(&ModelParameter::int("context_size", 1 << 32)));
        assert!(!settings.apply(&ModelParameter::int("n_batch", u32::MAX as i64 + 1)));
        assert!(!settings.apply(&ModelParameter::int("threads", i64::MAX)));
        assert!(!settings.apply(&ModelParameter::int("gpu_layers", i64::MIN)));
        assert!(!settings.apply(&ModelParameter::int("top_k", i64::MAX)));
        assert_eq!(settings, before);

        assert!(settings.apply(&ModelParameter::int("context_size", u32::MAX as i64)));
        assert_eq!(settings.context.n_ctx, u32::MAX);
    }

    #[test]
    fn test_defaults() {
        let settings = LoadParams::default();
        assert_eq!(settings.model.n_gpu_layers, 99);
        assert_eq!(settings.context.n_ctx, 4096);
        assert_eq!(settings.sampling.temperature, 0.8);
    }

    #[test]
    fn test_param_display() {
        assert_eq!(ParamValue::Int(4096).to_string(), "4096");
        assert_eq!(ParamValue::Str("abc".into()).to_string(), "abc");
        assert_eq!(ParamValue::Float(0.5).to_string(), "0.5");
    }
}
