//! Local CLIP ViT-B/32 dual encoder via fastembed.
//!
//! The text and image halves of CLIP are separate ONNX models that project
//! into the same 512-dimensional space. Both are loaded lazily on first use
//! (model download happens then) and run on the blocking pool, since
//! fastembed inference is synchronous.

use anyhow::{bail, Result};
use async_trait::async_trait;
use fastembed::{
    EmbeddingModel, ImageEmbedding, ImageEmbeddingModel, ImageInitOptions, InitOptions,
    TextEmbedding,
};
use std::sync::{Arc, Mutex};
use tracing::info;

use mmrag_core::embedding::{normalize, Embedder};
use mmrag_core::error::EmbeddingError;
use mmrag_core::models::SpaceVersion;

use crate::config::EmbeddingConfig;

const CLIP_DIMS: usize = 512;

pub struct LocalEmbedder {
    model_name: String,
    text_model: Arc<Mutex<Option<TextEmbedding>>>,
    image_model: Arc<Mutex<Option<ImageEmbedding>>>,
}

impl LocalEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        match config.model.as_str() {
            "clip-vit-b-32" => {}
            other => bail!(
                "Unknown local embedding model: '{}'. Supported models: clip-vit-b-32",
                other
            ),
        }
        if config.dims != CLIP_DIMS {
            bail!(
                "embedding.dims must be {} for clip-vit-b-32 (got {})",
                CLIP_DIMS,
                config.dims
            );
        }
        Ok(Self {
            model_name: config.model.clone(),
            text_model: Arc::new(Mutex::new(None)),
            image_model: Arc::new(Mutex::new(None)),
        })
    }
}

fn join_error(e: tokio::task::JoinError) -> EmbeddingError {
    EmbeddingError::Unavailable(format!("embedding task failed: {}", e))
}

fn first(mut vectors: Vec<Vec<f32>>) -> Result<Vec<f32>, EmbeddingError> {
    vectors
        .pop()
        .ok_or_else(|| EmbeddingError::Unavailable("encoder returned no vector".to_string()))
}

#[async_trait]
impl Embedder for LocalEmbedder {
    fn space(&self) -> SpaceVersion {
        SpaceVersion::new(&self.model_name, CLIP_DIMS)
    }

    fn dims(&self) -> usize {
        CLIP_DIMS
    }

    async fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let slot = self.text_model.clone();
        let texts = vec![text.to_string()];
        let vectors = tokio::task::spawn_blocking(move || {
            let mut guard = slot
                .lock()
                .map_err(|_| EmbeddingError::Unavailable("text encoder lock poisoned".into()))?;
            if guard.is_none() {
                info!("Loading CLIP ViT-B/32 text encoder");
                let model = TextEmbedding::try_new(
                    InitOptions::new(EmbeddingModel::ClipVitB32).with_show_download_progress(true),
                )
                .map_err(|e| {
                    EmbeddingError::Unavailable(format!("failed to load text encoder: {}", e))
                })?;
                *guard = Some(model);
            }
            let Some(model) = guard.as_mut() else {
                return Err(EmbeddingError::Unavailable("text encoder missing".into()));
            };
            model
                .embed(texts, None)
                .map_err(|e| EmbeddingError::Unavailable(format!("text embedding failed: {}", e)))
        })
        .await
        .map_err(join_error)??;

        Ok(normalize(&first(vectors)?))
    }

    async fn embed_image(&self, bytes: &[u8]) -> Result<Vec<f32>, EmbeddingError> {
        // Surface undecodable payloads as content errors before touching the model.
        image::load_from_memory(bytes)
            .map_err(|e| EmbeddingError::InvalidContent(format!("image does not decode: {}", e)))?;

        let slot = self.image_model.clone();
        let bytes = bytes.to_vec();
        let vectors = tokio::task::spawn_blocking(move || {
            let mut guard = slot
                .lock()
                .map_err(|_| EmbeddingError::Unavailable("image encoder lock poisoned".into()))?;
            if guard.is_none() {
                info!("Loading CLIP ViT-B/32 image encoder");
                let model = ImageEmbedding::try_new(
                    ImageInitOptions::new(ImageEmbeddingModel::ClipVitB32)
                        .with_show_download_progress(true),
                )
                .map_err(|e| {
                    EmbeddingError::Unavailable(format!("failed to load image encoder: {}", e))
                })?;
                *guard = Some(model);
            }
            let Some(model) = guard.as_mut() else {
                return Err(EmbeddingError::Unavailable("image encoder missing".into()));
            };
            model.embed_bytes(&[bytes.as_slice()], None).map_err(|e| {
                EmbeddingError::InvalidContent(format!("image embedding failed: {}", e))
            })
        })
        .await
        .map_err(join_error)??;

        Ok(normalize(&first(vectors)?))
    }
}
