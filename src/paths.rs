//! Resolution of stored file paths to readable locations.
//!
//! The uploading application records image paths like `images/<owner>/<folder>/x.jpg`.
//! On disk those live under `<root>/data/uploads/images/...`, where `<root>`
//! is the container root when it carries an uploads directory and the local
//! development root otherwise.

use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;

/// Prefix used by the uploading application for stored images.
const IMAGES_PREFIX: &str = "images/";

/// Where `images/` paths live relative to the root.
const UPLOADS_IMAGES_DIR: &str = "data/uploads/images";

static PROCESS_RESOLVER: OnceCell<PathResolver> = OnceCell::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Container,
    Local,
}

#[derive(Debug, Clone)]
pub struct PathResolver {
    root: PathBuf,
    layout: Layout,
}

impl PathResolver {
    /// Pick the container root if `<container_root>/data/uploads` exists, else the local root.
    pub fn detect(container_root: &Path, local_root: &Path) -> Self {
        if container_root.join("data").join("uploads").is_dir() {
            Self {
                root: container_root.to_path_buf(),
                layout: Layout::Container,
            }
        } else {
            Self {
                root: local_root.to_path_buf(),
                layout: Layout::Local,
            }
        }
    }

    /// The resolver for this process. Detection runs on the first call only.
    pub fn for_process(container_root: &Path, local_root: &Path) -> &'static PathResolver {
        PROCESS_RESOLVER.get_or_init(|| {
            let resolver = Self::detect(container_root, local_root);
            log::info!(
                "using {:?} layout rooted at {}",
                resolver.layout,
                resolver.root.display()
            );
            resolver
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Default directory for index files.
    pub fn index_dir(&self) -> PathBuf {
        self.root.join("data").join("indexes")
    }

    /// Map a stored file path to an absolute location.
    ///
    /// - absolute paths are returned unchanged
    /// - `images/...` maps into the uploads directory
    /// - anything else is taken relative to the root
    pub fn resolve(&self, file_path: &str) -> PathBuf {
        let path = Path::new(file_path);
        if path.is_absolute() {
            return path.to_path_buf();
        }

        match file_path.strip_prefix(IMAGES_PREFIX) {
            Some(rest) => self.root.join(UPLOADS_IMAGES_DIR).join(rest),
            None => self.root.join(path),
        }
    }
}
