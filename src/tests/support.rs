//! Shared fixtures: a tiny deterministic embedder and image helpers.

use std::{
    io::Cursor,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use crate::{
    paths::PathResolver,
    semantic::{
        embeddings::{Embedder, EmbeddingError},
        engine::EngineOptions,
        SearchEngine,
    },
};

/// Embeds images as their mean RGB colour and text by colour words.
///
/// Text and images share one 3-dimensional space, so "red" lands next to
/// red images. A batch containing any undecodable image fails as a whole.
pub struct ColorEmbedder {
    image_calls: AtomicUsize,
    text_calls: AtomicUsize,
}

impl ColorEmbedder {
    pub fn new() -> Self {
        Self {
            image_calls: AtomicUsize::new(0),
            text_calls: AtomicUsize::new(0),
        }
    }

    /// Number of `image_features` invocations (one per batch attempt)
    pub fn image_calls(&self) -> usize {
        self.image_calls.load(Ordering::SeqCst)
    }

    pub fn text_calls(&self) -> usize {
        self.text_calls.load(Ordering::SeqCst)
    }
}

fn color_word(word: &str) -> Option<[f32; 3]> {
    Some(match word {
        "red" => [1.0, 0.0, 0.0],
        "green" => [0.0, 1.0, 0.0],
        "blue" => [0.0, 0.0, 1.0],
        "yellow" => [1.0, 1.0, 0.0],
        "cyan" => [0.0, 1.0, 1.0],
        "magenta" => [1.0, 0.0, 1.0],
        _ => return None,
    })
}

impl Embedder for ColorEmbedder {
    fn model_name(&self) -> &str {
        "color-test"
    }

    fn dimensions(&self) -> usize {
        3
    }

    fn text_features(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.text_calls.fetch_add(1, Ordering::SeqCst);

        let mut v = vec![0.0f32; 3];
        for word in text.to_lowercase().split_whitespace() {
            if let Some(c) = color_word(word) {
                v.iter_mut().zip(c).for_each(|(a, b)| *a += b);
            }
        }
        if v.iter().all(|x| *x == 0.0) {
            v = vec![1.0; 3];
        }
        Ok(v)
    }

    fn image_features(&self, images: &[&[u8]]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.image_calls.fetch_add(1, Ordering::SeqCst);

        images
            .iter()
            .map(|bytes| {
                let img = image::load_from_memory(bytes)
                    .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?
                    .to_rgb8();
                let n = (img.width() * img.height()).max(1) as f32;
                let mut sum = [0.0f32; 3];
                for px in img.pixels() {
                    for (s, c) in sum.iter_mut().zip(px.0) {
                        *s += c as f32 / 255.0;
                    }
                }
                Ok(sum.iter().map(|s| s / n).collect())
            })
            .collect()
    }
}

/// A solid 4x4 PNG of the given colour.
pub fn png_bytes(rgb: [u8; 3]) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(4, 4, image::Rgb(rgb));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
    buf.into_inner()
}

pub fn write_png(path: &Path, rgb: [u8; 3]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, png_bytes(rgb)).unwrap();
}

/// A file that sniffs as PNG but does not decode.
pub fn write_corrupt_png(path: &Path) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, b"\x89PNG\r\n\x1a\ntruncated").unwrap();
}

/// A complete engine over a temp directory laid out like a local install.
pub struct TestEngine {
    pub tmp: tempfile::TempDir,
    pub embedder: Arc<ColorEmbedder>,
    pub engine: Arc<SearchEngine>,
}

impl TestEngine {
    pub fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let embedder = Arc::new(ColorEmbedder::new());
        let engine = Self::open(tmp.path(), embedder.clone());

        Self {
            tmp,
            embedder,
            engine,
        }
    }

    /// Open another engine over the same directory.
    pub fn open(root: &Path, embedder: Arc<ColorEmbedder>) -> Arc<SearchEngine> {
        Self::open_with(root, embedder, false)
    }

    pub fn open_with(root: &Path, embedder: Arc<dyn Embedder>, parallel_search: bool) -> Arc<SearchEngine> {
        let resolver = PathResolver::detect(&root.join("no-container"), root);
        let opts = EngineOptions {
            index_dir: resolver.index_dir(),
            batch_size: 2,
            load_workers: 4,
            parallel_search,
        };
        Arc::new(SearchEngine::new(embedder, resolver, opts).unwrap())
    }

    pub fn root(&self) -> PathBuf {
        self.tmp.path().to_path_buf()
    }

    /// Write an upload and return the path the application would record.
    pub fn upload(&self, name: &str, rgb: [u8; 3]) -> String {
        write_png(&self.root().join("data/uploads/images").join(name), rgb);
        format!("images/{name}")
    }
}
