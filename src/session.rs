use crate::{
    context::Context,
    error::{EchoError, Result},
    sampling::Sampler,
    vision::ImageSource,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

/// Caller-assigned session key, unique within a manager
pub type SessionId = i32;

/// Id of the session materialized when a model loads with none present
pub const DEFAULT_SESSION_ID: SessionId = 0;

/// Author of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }
}

/// Backend handles owned by one session
#[derive(Debug)]
pub(crate) struct SessionHandles {
    pub(crate) context: Context,
    pub(crate) sampler: Sampler,
}

/// A single conversation's mutable state
///
/// The session exclusively owns its context and sampler. They are released
/// on delete or model reload and never shared.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    pub(crate) history: Vec<ChatMessage>,
    /// Cells committed to this session's context
    pub(crate) n_past: u32,
    /// Chat template scratch buffer
    pub(crate) formatted: Vec<u8>,
    /// Length of the template expansion already decoded into the context
    pub(crate) committed_len: usize,
    pub(crate) last_response: String,
    pub(crate) images: usize,
    pub(crate) image_end_pos: u32,
    /// Images currently in the context, in embedding order
    pub(crate) image_sources: Vec<ImageSource>,
    pub(crate) handles: Option<SessionHandles>,
    created_at: SystemTime,
}

impl Session {
    pub(crate) fn new(id: SessionId, context: Context, sampler: Sampler) -> Self {
        Self {
            id,
            history: Vec::new(),
            n_past: 0,
            formatted: Vec::new(),
            committed_len: 0,
            last_response: String::new(),
            images: 0,
            image_end_pos: 0,
            image_sources: Vec::new(),
            handles: Some(SessionHandles { context, sampler }),
            created_at: SystemTime::now(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Tokens committed to the rolling context
    pub fn n_past(&self) -> u32 {
        self.n_past
    }

    pub fn last_response(&self) -> &str {
        &self.last_response
    }

    /// Number of images embedded since the last clear
    pub fn images(&self) -> usize {
        self.images
    }

    /// Position right after the most recent image, 0 when none
    pub fn image_end_pos(&self) -> u32 {
        self.image_end_pos
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Total cells of the session's context, 0 while handles are released
    pub fn n_ctx(&self) -> u32 {
        self.handles.as_ref().map_or(0, |h| h.context.n_ctx())
    }

    /// Cells the backend reports as occupied
    pub fn used_cells(&self) -> u32 {
        self.handles.as_ref().map_or(0, |h| h.context.used_cells())
    }

    pub fn has_handles(&self) -> bool {
        self.handles.is_some()
    }

    pub(crate) fn handles_mut(&mut self) -> Result<&mut SessionHandles> {
        let id = self.id;
        self.handles.as_mut().ok_or_else(|| {
            EchoError::BackendError(format!("Session {} has no backend context", id))
        })
    }

    /// Start the conversation over, keeping id and handles
    pub fn clear(&mut self) {
        self.history.clear();
        self.last_response.clear();
        self.reset_context();
    }

    /// Empty the rolling context but keep the history, so the next turn
    /// replays the whole conversation from position 0
    pub(crate) fn reset_context(&mut self) {
        self.reset_accounting();
        if let Some(handles) = self.handles.as_mut() {
            handles.context.kv_cache_clear();
            handles.sampler.reset();
        }
    }

    /// Drop the context and sampler. The session keeps its text history.
    pub(crate) fn release_handles(&mut self) {
        if let Some(handles) = self.handles.take() {
            // sampler is bound to the context
            drop(handles.sampler);
            drop(handles.context);
        }
        self.reset_accounting();
    }

    /// Install handles created against a newly loaded model
    pub(crate) fn attach_handles(&mut self, context: Context, sampler: Sampler) {
        self.release_handles();
        self.handles = Some(SessionHandles { context, sampler });
    }

    fn reset_accounting(&mut self) {
        self.n_past = 0;
        self.committed_len = 0;
        self.images = 0;
        self.image_end_pos = 0;
        self.image_sources.clear();
        self.formatted.clear();
    }

    /// Human-readable budget summary
    pub fn context_info(&self, safety_margin: u32) -> String {
        let n_ctx = self.n_ctx();
        let usable = n_ctx.saturating_sub(safety_margin);
        let mut info = format!(
            "Session {}: {} messages, {} / {} tokens used ({} cells in context), {} remaining",
            self.id,
            self.history.len(),
            self.n_past,
            n_ctx,
            self.used_cells(),
            usable.saturating_sub(self.n_past)
        );
        if self.images > 0 {
            info.push_str(&format!(
                ", {} image(s) ending at position {}",
                self.images, self.image_end_pos
            ));
        }
        info
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            history: self.history.clone(),
            n_past: self.n_past,
            used_cells: self.used_cells(),
            n_ctx: self.n_ctx(),
            last_response: self.last_response.clone(),
            images: self.images,
            image_end_pos: self.image_end_pos,
        }
    }
}

/// Owned copy of a session's observable state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub history: Vec<ChatMessage>,
    pub n_past: u32,
    pub used_cells: u32,
    pub n_ctx: u32,
    pub last_response: String,
    pub images: usize,
    pub image_end_pos: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_names() {
        assert_eq!(Role::User.as_str(), "user");
        assert_eq!(Role::Assistant.to_string(), "assistant");
        assert_eq!(Role::System.as_str(), "system");
    }

    #[test]
    fn test_message_serialization() {
        let msg = ChatMessage::user("Hello");
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"role":"user","content":"Hello"}"#);

        let back: ChatMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }
}
