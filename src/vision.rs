//! Image embedding injection
//!
//! An image is encoded into a fixed number of embedding rows and spliced into
//! a session's context between textual start and end markers:
//!
//! 1. marker tokens are decoded one at a time, without sampling. In an
//!    empty context the start marker carries the BOS token
//! 2. attention switches to non-causal
//! 3. the embedding rows are decoded as one batch at the next positions
//! 4. causal attention is restored and the end marker decoded
//!
//! Loading, decoding, encoding and capacity checks all happen before the
//! context is touched.

use crate::{
    backend::ImageEncoder,
    batch::Batch,
    error::{EchoError, Result},
    model::Model,
    session::Session,
    token::{Pos, TokenId},
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

pub const DEFAULT_START_MARKER: &str = "<start_of_image>";
pub const DEFAULT_END_MARKER: &str = "<end_of_image>";

/// Free cells past the last image required for a clear to keep images
pub const KEEP_IMAGES_HEADROOM: u32 = 100;

/// Vision settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionConfig {
    /// Image encoder (multimodal projector) file
    #[serde(default)]
    pub mmproj_path: Option<PathBuf>,

    #[serde(default = "default_start_marker")]
    pub start_marker: String,

    #[serde(default = "default_end_marker")]
    pub end_marker: String,
}

fn default_start_marker() -> String {
    DEFAULT_START_MARKER.to_string()
}

fn default_end_marker() -> String {
    DEFAULT_END_MARKER.to_string()
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            mmproj_path: None,
            start_marker: default_start_marker(),
            end_marker: default_end_marker(),
        }
    }
}

/// Where an image comes from
#[derive(Debug, Clone, PartialEq)]
pub enum ImageSource {
    /// Encoded image file (png, jpeg, bmp, gif, webp)
    Path(PathBuf),
    /// Interleaved RGB8 pixels
    Pixels {
        rgb: Vec<u8>,
        width: u32,
        height: u32,
    },
}

impl ImageSource {
    pub fn path(path: impl AsRef<Path>) -> Self {
        ImageSource::Path(path.as_ref().to_path_buf())
    }

    pub fn pixels(rgb: Vec<u8>, width: u32, height: u32) -> Self {
        ImageSource::Pixels { rgb, width, height }
    }

    /// Decode into validated RGB8 pixels
    pub fn load(&self) -> Result<RgbImage> {
        match self {
            ImageSource::Path(path) => {
                if path.as_os_str().is_empty() {
                    return Err(EchoError::ResourceError("Image path is empty".to_string()));
                }
                if !path.exists() {
                    return Err(EchoError::ResourceError(format!(
                        "Image file not found: {}",
                        path.display()
                    )));
                }
                let decoded = image::open(path).map_err(|e| {
                    EchoError::ImageError(format!(
                        "Unable to load image {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                let rgb = decoded.to_rgb8();
                let (width, height) = rgb.dimensions();
                RgbImage::new(rgb.into_raw(), width, height)
            }
            ImageSource::Pixels { rgb, width, height } => {
                RgbImage::new(rgb.clone(), *width, *height)
            }
        }
    }
}

impl fmt::Display for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageSource::Path(path) => write!(f, "{}", path.display()),
            ImageSource::Pixels { width, height, .. } => {
                write!(f, "<{}x{} pixel buffer>", width, height)
            }
        }
    }
}

/// Validated interleaved RGB8 image
#[derive(Debug, Clone, PartialEq)]
pub struct RgbImage {
    pixels: Vec<u8>,
    width: u32,
    height: u32,
}

impl RgbImage {
    pub fn new(pixels: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let needed = width as usize * height as usize * 3;
        if width == 0 || height == 0 || pixels.len() < needed {
            return Err(EchoError::ImageError(
                "Invalid image data or dimensions".to_string(),
            ));
        }
        Ok(Self {
            pixels,
            width,
            height,
        })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

/// Encodes images and splices the embeddings into session contexts
pub struct VisionEmbedder {
    encoder: Box<dyn ImageEncoder>,
    config: VisionConfig,
}

impl fmt::Debug for VisionEmbedder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VisionEmbedder")
            .field("n_tokens", &self.encoder.n_tokens())
            .field("n_embd", &self.encoder.n_embd())
            .field("config", &self.config)
            .finish()
    }
}

impl VisionEmbedder {
    pub fn new(encoder: Box<dyn ImageEncoder>, config: VisionConfig) -> Self {
        Self { encoder, config }
    }

    pub fn config(&self) -> &VisionConfig {
        &self.config
    }

    /// Pseudo-tokens produced per image
    pub fn n_tokens(&self) -> usize {
        self.encoder.n_tokens()
    }

    /// Encode `image` and inject it into `session`.
    ///
    /// Returns the number of cells added. Every failure that can be detected
    /// up front leaves the session untouched.
    pub fn embed_image(
        &self,
        model: &Model,
        session: &mut Session,
        image: &ImageSource,
        safety_margin: u32,
    ) -> Result<u32> {
        let rgb = image.load()?;
        let embedding = self.encode(model, &rgb)?;
        let n_embd = self.encoder.n_embd();
        let n_tokens = self.encoder.n_tokens();

        let is_first = session.used_cells() == 0;
        let start = self.marker_tokens(model, &self.config.start_marker, is_first)?;
        let end = self.marker_tokens(model, &self.config.end_marker, false)?;
        let total = (start.len() + n_tokens + end.len()) as u32;

        let id = session.id();
        let mut pos = session.n_past;
        let handles = session.handles_mut()?;
        let limit = handles.context.n_ctx().saturating_sub(safety_margin);
        if pos + total > limit {
            return Err(EchoError::CapacityError(format!(
                "image needs {} cells, {} of {} available",
                total,
                limit.saturating_sub(pos),
                limit
            )));
        }

        tracing::debug!("Session {}: encoding image {} ({} cells)", id, image, total);

        let context = &mut handles.context;
        let result = (|| -> Result<()> {
            for &token in &start {
                context.decode(&Batch::from_tokens(&[token], pos as Pos))?;
                pos += 1;
            }

            context.set_causal_attn(false);
            let decoded =
                context.decode(&Batch::from_embeddings(embedding, n_embd, pos as Pos, 0));
            context.set_causal_attn(true);
            decoded.map_err(|e| EchoError::BackendError(format!("failed to decode image: {}", e)))?;
            pos += n_tokens as u32;

            for &token in &end {
                context.decode(&Batch::from_tokens(&[token], pos as Pos))?;
                pos += 1;
            }
            Ok(())
        })();

        session.n_past = pos;
        if let Err(e) = result {
            tracing::error!("Session {}: {}", id, e);
            return Err(e);
        }

        session.images += 1;
        session.image_end_pos = pos;
        session.image_sources.push(image.clone());
        tracing::info!("Session {}: image embedded, n_past {}", id, pos);
        Ok(total)
    }

    fn encode(&self, model: &Model, rgb: &RgbImage) -> Result<Vec<f32>> {
        let n_embd = self.encoder.n_embd();
        if n_embd != model.n_embd() {
            return Err(EchoError::ConfigurationError(format!(
                "Image encoder width {} does not match model width {}",
                n_embd,
                model.n_embd()
            )));
        }

        let embedding = self
            .encoder
            .encode(rgb.pixels(), rgb.width(), rgb.height())
            .map_err(|e| EchoError::ImageError(format!("Unable to encode image: {}", e)))?;

        let expected = self.encoder.n_tokens() * n_embd;
        if embedding.len() != expected {
            return Err(EchoError::ImageError(format!(
                "Image encoder produced {} values, expected {}",
                embedding.len(),
                expected
            )));
        }
        Ok(embedding)
    }

    fn marker_tokens(&self, model: &Model, marker: &str, add_special: bool) -> Result<Vec<TokenId>> {
        if marker.is_empty() {
            return Ok(Vec::new());
        }
        model.tokenize(marker, add_special)
    }
}
