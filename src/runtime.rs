//! Caller-facing runtime API
//!
//! [`Runtime`] wraps a [`SessionManager`] behind a read/write lock:
//!
//! - generation, embedding and clearing take the read lock plus the
//!   session's own mutex, so different sessions advance in parallel while a
//!   single session never runs two turns at once
//! - loading a model, creating and deleting sessions take the write lock,
//!   which waits for every in-flight turn to finish
//!
//! Every public call returns a [`Result`] and records the message of its
//! failure, retrievable through [`Runtime::last_error`].

use crate::{
    backend::{ImageEncoder, ModelBackend},
    config::RuntimeConfig,
    error::{EchoError, Result},
    generation::{CancelToken, GenerationEngine, GenerationOutcome},
    manager::SessionManager,
    metadata::{self, ModelMetadata},
    model::ModelParameter,
    session::{SessionId, SessionSnapshot},
    vision::{ImageSource, VisionConfig, VisionEmbedder},
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub struct Runtime {
    manager: RwLock<SessionManager>,
    engine: GenerationEngine,
    vision_config: VisionConfig,
    last_error: Mutex<Option<String>>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("engine", &self.engine)
            .field("vision_config", &self.vision_config)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    pub fn new(backend: Arc<dyn ModelBackend>) -> Self {
        Self {
            manager: RwLock::new(SessionManager::new(backend)),
            engine: GenerationEngine::default(),
            vision_config: VisionConfig::default(),
            last_error: Mutex::new(None),
        }
    }

    pub fn with_engine(mut self, engine: GenerationEngine) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_vision_config(mut self, config: VisionConfig) -> Self {
        self.vision_config = config;
        self
    }

    /// Load the configured model and, when set, its image encoder
    pub fn load_from_config(&self, config: &RuntimeConfig) -> Result<()> {
        self.call(|| {
            config.validate()?;
            let path = config.model.path.as_ref().ok_or_else(|| {
                EchoError::ConfigurationError("No model path configured".to_string())
            })?;
            let mut manager = self.write()?;
            manager.load_model(path, &config.to_parameters())?;
            if let Some(mmproj) = &config.vision.mmproj_path {
                manager.load_image_encoder(mmproj, config.vision.clone())?;
            }
            Ok(())
        })
    }

    pub fn load_model(&self, path: impl AsRef<Path>, params: &[ModelParameter]) -> Result<()> {
        self.call(|| self.write()?.load_model(path.as_ref(), params))
    }

    /// Ask the backend for an image encoder matching the loaded model
    pub fn load_image_encoder(&self, path: impl AsRef<Path>) -> Result<()> {
        self.call(|| {
            self.write()?
                .load_image_encoder(path.as_ref(), self.vision_config.clone())
        })
    }

    pub fn set_image_encoder(&self, encoder: Box<dyn ImageEncoder>) -> Result<()> {
        self.call(|| {
            let embedder = VisionEmbedder::new(encoder, self.vision_config.clone());
            self.write()?.set_vision(Some(embedder));
            Ok(())
        })
    }

    pub fn has_vision(&self) -> bool {
        self.read().map(|m| m.vision().is_some()).unwrap_or(false)
    }

    pub fn is_loaded(&self) -> bool {
        self.read().map(|m| m.is_loaded()).unwrap_or(false)
    }

    pub fn model_path(&self) -> Option<PathBuf> {
        self.read()
            .ok()
            .and_then(|m| m.model().map(|model| model.path().to_path_buf()))
    }

    pub fn create_session(&self, id: SessionId) -> Result<()> {
        self.call(|| self.write()?.create_session(id))
    }

    pub fn clear_session(&self, id: SessionId) -> Result<()> {
        self.call(|| self.read()?.clear_session(id))
    }

    /// Clear the session, keeping the images it held in the context.
    ///
    /// Returns how many images were embedded again.
    pub fn clear_session_keep_images(&self, id: SessionId) -> Result<usize> {
        self.call(|| {
            self.read()?
                .clear_session_keep_images(id, self.engine.safety_margin())
        })
    }

    pub fn delete_session(&self, id: SessionId) -> Result<()> {
        self.call(|| self.write()?.delete_session(id))
    }

    /// Run one chat turn, streaming fragments to `on_token`.
    ///
    /// Both callbacks run on the calling thread while the runtime lock and
    /// the session's mutex are held. They must not call back into this
    /// `Runtime`: `get_context_info` on the same session or `load_model`
    /// deadlocks. Use [`crate::streaming::TokenStream`] to consume fragments
    /// elsewhere.
    pub fn generate(
        &self,
        id: SessionId,
        prompt: &str,
        on_token: impl FnMut(&str),
        on_complete: impl FnMut(&str),
    ) -> Result<GenerationOutcome> {
        self.generate_cancellable(id, prompt, &CancelToken::new(), on_token, on_complete)
    }

    /// [`Runtime::generate`] with a cancellation token. The same callback
    /// restrictions apply.
    pub fn generate_cancellable(
        &self,
        id: SessionId,
        prompt: &str,
        cancel: &CancelToken,
        mut on_token: impl FnMut(&str),
        mut on_complete: impl FnMut(&str),
    ) -> Result<GenerationOutcome> {
        self.call(|| {
            self.read()?.with_session(id, |model, session| {
                self.engine
                    .generate(model, session, prompt, cancel, &mut on_token, &mut on_complete)
            })
        })
    }

    /// Splice an image into the session, then run a chat turn.
    ///
    /// Callbacks must not re-enter the runtime, see [`Runtime::generate`].
    pub fn generate_with_image(
        &self,
        id: SessionId,
        prompt: &str,
        image: &ImageSource,
        on_token: impl FnMut(&str),
        on_complete: impl FnMut(&str),
    ) -> Result<GenerationOutcome> {
        self.generate_with_image_cancellable(
            id,
            prompt,
            image,
            &CancelToken::new(),
            on_token,
            on_complete,
        )
    }

    pub fn generate_with_image_cancellable(
        &self,
        id: SessionId,
        prompt: &str,
        image: &ImageSource,
        cancel: &CancelToken,
        mut on_token: impl FnMut(&str),
        mut on_complete: impl FnMut(&str),
    ) -> Result<GenerationOutcome> {
        self.call(|| {
            let manager = self.read()?;
            let vision = manager.vision().ok_or_else(no_encoder)?;
            if prompt.is_empty() {
                return Err(EchoError::ConfigurationError("Empty prompt".to_string()));
            }
            manager.with_session(id, |model, session| {
                vision.embed_image(model, session, image, self.engine.safety_margin())?;
                self.engine
                    .generate(model, session, prompt, cancel, &mut on_token, &mut on_complete)
            })
        })
    }

    /// Splice an image into the session without generating.
    ///
    /// Returns the number of context cells it occupies.
    pub fn embed_image(&self, id: SessionId, image: &ImageSource) -> Result<u32> {
        self.call(|| {
            let manager = self.read()?;
            let vision = manager.vision().ok_or_else(no_encoder)?;
            manager.with_session(id, |model, session| {
                vision.embed_image(model, session, image, self.engine.safety_margin())
            })
        })
    }

    /// Session id, message count, used and remaining token budget
    pub fn get_context_info(&self, id: SessionId) -> Result<String> {
        self.call(|| {
            self.read()?.with_session(id, |_, session| {
                Ok(session.context_info(self.engine.safety_margin()))
            })
        })
    }

    pub fn last_response(&self, id: SessionId) -> Result<String> {
        self.call(|| Ok(self.read()?.lock_session(id)?.last_response().to_string()))
    }

    pub fn session(&self, id: SessionId) -> Result<SessionSnapshot> {
        self.call(|| Ok(self.read()?.lock_session(id)?.snapshot()))
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.read().map(|m| m.session_ids()).unwrap_or_default()
    }

    /// Read a model file's header. Never fails; problems are logged.
    pub fn parse_model_metadata(&self, path: impl AsRef<Path>) -> ModelMetadata {
        self.clear_error();
        metadata::parse(path)
    }

    /// Message of the most recent failed call, cleared by every call
    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn call<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.clear_error();
        let result = f();
        if let Err(e) = &result {
            *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(e.to_string());
        }
        result
    }

    fn clear_error(&self) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, SessionManager>> {
        self.manager
            .read()
            .map_err(|_| EchoError::lock_poisoned("runtime"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, SessionManager>> {
        self.manager
            .write()
            .map_err(|_| EchoError::lock_poisoned("runtime"))
    }
}

fn no_encoder() -> EchoError {
    EchoError::ResourceError("Image encoder not loaded".to_string())
}
