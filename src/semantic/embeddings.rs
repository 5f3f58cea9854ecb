//! Embedding models for images and text queries.
//!
//! - `Embedder`: the seam between the engine and a vision-language model
//! - `ClipEmbedder`: fastembed's CLIP towers, loaded once per process
//! - `embed_text` / `embed_images`: normalized outputs, batched image inference

use fastembed::{ImageEmbedding, ImageEmbeddingModel, ImageInitOptions, InitOptions, TextEmbedding};
use std::path::PathBuf;
use std::sync::Mutex;

use crate::semantic::normalize::{normalize_in_place, normalize_rows};

/// Error type for embedding operations
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),

    #[error("Model returned {got} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// A model mapping images and text into one shared vector space.
///
/// Implementations return raw model output; callers go through
/// [`embed_text`] and [`embed_images`], which normalize.
pub trait Embedder: Send + Sync {
    fn model_name(&self) -> &str;

    fn dimensions(&self) -> usize;

    /// Raw text features for a single string.
    fn text_features(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Raw image features for one batch of encoded images, one row per input.
    fn image_features(&self, images: &[&[u8]]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// SHA256 of the model name, stamped into every index file.
    fn model_id_hash(&self) -> [u8; 32] {
        model_id_hash(self.model_name())
    }
}

pub fn model_id_hash(model_name: &str) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(model_name.as_bytes());
    hasher.finalize().into()
}

/// Embed a text query and normalize it to unit length.
pub fn embed_text(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>, EmbeddingError> {
    let mut vector = embedder.text_features(text)?;
    check_dimensions(embedder, &vector)?;
    normalize_in_place(&mut vector);
    Ok(vector)
}

/// Embed images in fixed-size batches, returning one result per input in input order.
///
/// Batches run one after another. When a whole batch fails, its images are
/// retried one by one so a single corrupt image only fails its own slot.
pub fn embed_images(
    embedder: &dyn Embedder,
    images: &[&[u8]],
    batch_size: usize,
) -> Vec<Result<Vec<f32>, EmbeddingError>> {
    let mut out = Vec::with_capacity(images.len());

    for chunk in images.chunks(batch_size.max(1)) {
        match embed_batch(embedder, chunk) {
            Ok(rows) => out.extend(rows.into_iter().map(Ok)),
            Err(err) if chunk.len() == 1 => out.push(Err(err)),
            Err(err) => {
                log::warn!(
                    "batch of {} images failed ({err}), retrying individually",
                    chunk.len()
                );
                for image in chunk {
                    out.push(embed_batch(embedder, std::slice::from_ref(image)).and_then(
                        |mut rows| {
                            rows.pop().ok_or_else(|| {
                                EmbeddingError::EmbeddingFailed("No embedding returned".to_string())
                            })
                        },
                    ));
                }
            }
        }
    }

    out
}

fn embed_batch(embedder: &dyn Embedder, batch: &[&[u8]]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let mut rows = embedder.image_features(batch)?;

    if rows.len() != batch.len() {
        return Err(EmbeddingError::EmbeddingFailed(format!(
            "model returned {} embeddings for {} images",
            rows.len(),
            batch.len()
        )));
    }
    for row in &rows {
        check_dimensions(embedder, row)?;
    }

    normalize_rows(&mut rows);
    Ok(rows)
}

fn check_dimensions(embedder: &dyn Embedder, v: &[f32]) -> Result<(), EmbeddingError> {
    if v.len() != embedder.dimensions() {
        return Err(EmbeddingError::DimensionMismatch {
            expected: embedder.dimensions(),
            got: v.len(),
        });
    }
    Ok(())
}

/// CLIP text and vision towers from fastembed.
/// Uses a Mutex per tower because fastembed's embed() requires &mut self.
pub struct ClipEmbedder {
    text: Mutex<TextEmbedding>,
    vision: Mutex<ImageEmbedding>,
    model_name: String,
    dimensions: usize,
}

impl ClipEmbedder {
    /// Load both towers of the named model.
    ///
    /// Model files are downloaded on first use and cached under `cache_dir/models`.
    pub fn new(model_name: &str, cache_dir: PathBuf) -> Result<Self, EmbeddingError> {
        let (text_model, vision_model) = parse_model_name(model_name)?;

        let models_dir = cache_dir.join("models");
        std::fs::create_dir_all(&models_dir).map_err(|e| {
            EmbeddingError::InitFailed(format!("Failed to create models directory: {}", e))
        })?;

        log::info!("loading embedding model '{model_name}' from {}", models_dir.display());

        let mut text = TextEmbedding::try_new(
            InitOptions::new(text_model)
                .with_cache_dir(models_dir.clone())
                .with_show_download_progress(true),
        )
        .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;

        let vision = ImageEmbedding::try_new(
            ImageInitOptions::new(vision_model)
                .with_cache_dir(models_dir)
                .with_show_download_progress(true),
        )
        .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;

        let dimensions = probe_dimensions(&mut text)?;
        log::info!("embedding model '{model_name}' ready ({dimensions} dimensions)");

        Ok(Self {
            text: Mutex::new(text),
            vision: Mutex::new(vision),
            model_name: model_name.to_string(),
            dimensions,
        })
    }
}

impl Embedder for ClipEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn text_features(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut model = self.text.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        model
            .embed(vec![text], None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("No embedding returned".to_string()))
    }

    fn image_features(&self, images: &[&[u8]]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if images.is_empty() {
            return Ok(vec![]);
        }

        let mut model = self.vision.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        model
            .embed_bytes(images, Some(images.len()))
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))
    }
}

/// Parse a model name into its fastembed text and vision variants.
fn parse_model_name(
    name: &str,
) -> Result<(fastembed::EmbeddingModel, ImageEmbeddingModel), EmbeddingError> {
    match name.to_lowercase().as_str() {
        "clip-vit-b-32" | "clipvitb32" => Ok((
            fastembed::EmbeddingModel::ClipVitB32,
            ImageEmbeddingModel::ClipVitB32,
        )),
        "nomic-embed-v1.5" | "nomicembedv15" => Ok((
            fastembed::EmbeddingModel::NomicEmbedTextV15,
            ImageEmbeddingModel::NomicEmbedVisionV15,
        )),
        _ => Err(EmbeddingError::InvalidModel(format!(
            "Unknown model: {}. Supported models: clip-vit-b-32, nomic-embed-v1.5",
            name
        ))),
    }
}

fn probe_dimensions(model: &mut TextEmbedding) -> Result<usize, EmbeddingError> {
    model
        .embed(vec!["test"], None)
        .map_err(|e| EmbeddingError::InitFailed(format!("Failed to probe dimensions: {}", e)))?
        .first()
        .map(|v| v.len())
        .ok_or_else(|| EmbeddingError::InitFailed("Model returned no embedding".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::normalize::l2_norm;
    use crate::tests::support::{png_bytes, ColorEmbedder};

    #[test]
    fn test_invalid_model_name() {
        let tmp = tempfile::tempdir().unwrap();
        let result = ClipEmbedder::new("nonexistent-model", tmp.path().to_path_buf());
        assert!(matches!(result, Err(EmbeddingError::InvalidModel(_))));
    }

    #[test]
    fn test_model_id_hash_is_stable() {
        assert_eq!(model_id_hash("clip-vit-b-32"), model_id_hash("clip-vit-b-32"));
        assert_ne!(model_id_hash("clip-vit-b-32"), model_id_hash("nomic-embed-v1.5"));
    }

    #[test]
    fn test_embed_text_is_normalized() {
        let embedder = ColorEmbedder::new();
        let v = embed_text(&embedder, "dark red").unwrap();
        assert!((l2_norm(&v) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_embed_images_preserves_order_across_batches() {
        let embedder = ColorEmbedder::new();
        let red = png_bytes([255, 0, 0]);
        let green = png_bytes([0, 255, 0]);
        let blue = png_bytes([0, 0, 255]);
        let images: Vec<&[u8]> = vec![&red, &green, &blue, &red, &blue];

        let results = embed_images(&embedder, &images, 2);

        assert_eq!(results.len(), 5);
        assert_eq!(embedder.image_calls(), 3);
        let argmax = |v: &Vec<f32>| {
            v.iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(i, _)| i)
                .unwrap()
        };
        let channels: Vec<usize> = results.iter().map(|r| argmax(r.as_ref().unwrap())).collect();
        assert_eq!(channels, vec![0, 1, 2, 0, 2]);
    }

    #[test]
    fn test_embed_images_isolates_corrupt_item() {
        let embedder = ColorEmbedder::new();
        let red = png_bytes([255, 0, 0]);
        let garbage = b"\x89PNG\r\n\x1a\nnot really".to_vec();
        let blue = png_bytes([0, 0, 255]);
        let images: Vec<&[u8]> = vec![&red, &garbage, &blue];

        let results = embed_images(&embedder, &images, 32);

        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(EmbeddingError::EmbeddingFailed(_))));
        assert!(results[2].is_ok());
    }

    #[test]
    fn test_embed_images_empty_input() {
        let embedder = ColorEmbedder::new();
        assert!(embed_images(&embedder, &[], 32).is_empty());
        assert_eq!(embedder.image_calls(), 0);
    }

    #[test]
    #[ignore = "requires model download"]
    fn test_clip_text_and_image_share_space() {
        let tmp = tempfile::tempdir().unwrap();
        let model = ClipEmbedder::new("clip-vit-b-32", tmp.path().to_path_buf()).unwrap();
        assert_eq!(model.dimensions(), 512);

        let red = png_bytes([255, 0, 0]);
        let image = embed_images(&model, &[&red], 1).pop().unwrap().unwrap();
        let red_text = embed_text(&model, "a solid red square").unwrap();
        let blue_text = embed_text(&model, "a solid blue square").unwrap();

        let dot = crate::semantic::normalize::dot;
        assert!(dot(&image, &red_text) > dot(&image, &blue_text));
    }
}
