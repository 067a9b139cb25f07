use crate::{
    backend::ModelBackend,
    context::Context,
    error::{EchoError, Result},
    model::{LoadParams, Model, ModelParameter},
    sampling::Sampler,
    session::{Session, SessionId, DEFAULT_SESSION_ID},
    vision::{VisionConfig, VisionEmbedder, KEEP_IMAGES_HEADROOM},
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Owns the loaded model and every session created against it
///
/// Sessions are released before the model, both on reload and on drop.
pub struct SessionManager {
    sessions: HashMap<SessionId, Mutex<Session>>,
    vision: Option<VisionEmbedder>,
    model: Option<Model>,
    backend: Arc<dyn ModelBackend>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("backend", &self.backend.name())
            .field("model", &self.model)
            .field("sessions", &self.session_ids())
            .field("vision", &self.vision.is_some())
            .finish()
    }
}

impl SessionManager {
    pub fn new(backend: Arc<dyn ModelBackend>) -> Self {
        Self {
            sessions: HashMap::new(),
            vision: None,
            model: None,
            backend,
        }
    }

    /// Load `path`, replacing any loaded model.
    ///
    /// Existing sessions keep their id and history and get fresh handles with
    /// an empty context. When no session exists the default one is created.
    pub fn load_model(&mut self, path: impl AsRef<Path>, params: &[ModelParameter]) -> Result<()> {
        let path = path.as_ref();

        if let Some(old) = self.model.take() {
            tracing::info!("Model already loaded, releasing {}", old.path().display());
            for session in self.sessions.values_mut() {
                session
                    .get_mut()
                    .unwrap_or_else(PoisonError::into_inner)
                    .release_handles();
            }
            drop(old);
        }

        let settings = LoadParams::from_parameters(params);
        let model = Model::load(self.backend.as_ref(), path, settings)?;

        let mut rebuilt = Vec::with_capacity(self.sessions.len());
        for &id in self.sessions.keys() {
            rebuilt.push((id, Self::create_handles(&model)?));
        }
        for (id, (context, sampler)) in rebuilt {
            if let Some(session) = self.sessions.get_mut(&id) {
                session
                    .get_mut()
                    .unwrap_or_else(PoisonError::into_inner)
                    .attach_handles(context, sampler);
                tracing::debug!("Session {}: handles rebuilt", id);
            }
        }

        if self.sessions.is_empty() {
            let (context, sampler) = Self::create_handles(&model)?;
            self.sessions.insert(
                DEFAULT_SESSION_ID,
                Mutex::new(Session::new(DEFAULT_SESSION_ID, context, sampler)),
            );
            tracing::info!("Created default session {}", DEFAULT_SESSION_ID);
        }

        tracing::info!(
            "Loaded model {} ({} sessions)",
            path.display(),
            self.sessions.len()
        );
        self.model = Some(model);
        Ok(())
    }

    fn create_handles(model: &Model) -> Result<(Context, Sampler)> {
        let context = model.create_context()?;
        let sampler = model.create_sampler()?;
        Ok((context, sampler))
    }

    pub fn create_session(&mut self, id: SessionId) -> Result<()> {
        let model = self.model.as_ref().ok_or_else(EchoError::no_model)?;
        if self.sessions.contains_key(&id) {
            return Err(EchoError::ConfigurationError(format!(
                "Session id already exists: {}",
                id
            )));
        }

        let (context, sampler) = Self::create_handles(model)?;
        self.sessions
            .insert(id, Mutex::new(Session::new(id, context, sampler)));
        tracing::info!("Created session {}", id);
        Ok(())
    }

    /// Empty the history and the rolling context of one session
    pub fn clear_session(&self, id: SessionId) -> Result<()> {
        self.lock_session(id)?.clear();
        tracing::info!("Cleared session {}", id);
        Ok(())
    }

    /// Clear one session, then splice the images it held back into the
    /// empty context.
    ///
    /// Images survive only when the last one ended at least
    /// [`KEEP_IMAGES_HEADROOM`] cells before the end of the context and an
    /// encoder is loaded. An image that fails to re-embed is skipped.
    /// Returns the number of images restored.
    pub fn clear_session_keep_images(&self, id: SessionId, safety_margin: u32) -> Result<usize> {
        let mut session = self.lock_session(id)?;
        let sources = std::mem::take(&mut session.image_sources);
        let keep = session.image_end_pos > 0
            && session.image_end_pos < session.n_ctx().saturating_sub(KEEP_IMAGES_HEADROOM);
        session.clear();

        let (model, vision) = match (self.model.as_ref(), self.vision.as_ref()) {
            (Some(model), Some(vision)) if keep => (model, vision),
            _ => {
                tracing::info!("Cleared session {}, images dropped", id);
                return Ok(0);
            }
        };

        let mut restored = 0;
        for source in &sources {
            match vision.embed_image(model, &mut session, source, safety_margin) {
                Ok(_) => restored += 1,
                Err(e) => tracing::warn!("Session {}: failed to reload image {}: {}", id, source, e),
            }
        }
        tracing::info!(
            "Cleared session {}, {} image(s) reloaded, n_past {}",
            id,
            restored,
            session.n_past()
        );
        Ok(restored)
    }

    pub fn delete_session(&mut self, id: SessionId) -> Result<()> {
        match self.sessions.remove(&id) {
            Some(session) => {
                drop(session);
                tracing::info!("Deleted session {}", id);
                Ok(())
            }
            None => Err(EchoError::unknown_session(id)),
        }
    }

    /// Pure lookup
    pub fn session(&self, id: SessionId) -> Option<&Mutex<Session>> {
        self.sessions.get(&id)
    }

    pub fn lock_session(&self, id: SessionId) -> Result<MutexGuard<'_, Session>> {
        self.sessions
            .get(&id)
            .ok_or_else(|| EchoError::unknown_session(id))?
            .lock()
            .map_err(|_| EchoError::lock_poisoned("session"))
    }

    /// Session ids in ascending order
    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn has_session(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn model(&self) -> Option<&Model> {
        self.model.as_ref()
    }

    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    /// Run `f` on the loaded model and the locked session
    pub fn with_session<T>(
        &self,
        id: SessionId,
        f: impl FnOnce(&Model, &mut Session) -> Result<T>,
    ) -> Result<T> {
        let model = self.model.as_ref().ok_or_else(EchoError::no_model)?;
        let mut session = self.lock_session(id)?;
        f(model, &mut session)
    }

    /// Load an image encoder compatible with the current model
    pub fn load_image_encoder(&mut self, path: impl AsRef<Path>, config: VisionConfig) -> Result<()> {
        let path = path.as_ref();
        let model = self.model.as_ref().ok_or_else(EchoError::no_model)?;
        if !path.exists() {
            return Err(EchoError::ResourceError(format!(
                "Image encoder file not found: {}",
                path.display()
            )));
        }

        let encoder = self.backend.load_image_encoder(path, model.backend())?;
        tracing::info!(
            "Loaded image encoder {} ({} tokens per image)",
            path.display(),
            encoder.n_tokens()
        );
        self.vision = Some(VisionEmbedder::new(encoder, config));
        Ok(())
    }

    pub fn set_vision(&mut self, vision: Option<VisionEmbedder>) {
        self.vision = vision;
    }

    pub fn vision(&self) -> Option<&VisionEmbedder> {
        self.vision.as_ref()
    }

    pub fn backend(&self) -> &Arc<dyn ModelBackend> {
        &self.backend
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.sessions.clear();
        self.vision = None;
        if let Some(model) = self.model.take() {
            tracing::debug!("Releasing model {}", model.path().display());
        }
    }
}
