use std::path::{Path, PathBuf};

use crate::eid::Eid;

/// Small files kept directly under the base directory (config, journals).
#[derive(Clone, Debug)]
pub struct DataDir {
    base_dir: PathBuf,
}

impl DataDir {
    pub fn new(base_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_dir)?;
        Ok(DataDir { base_dir })
    }

    pub fn path(&self, ident: &str) -> PathBuf {
        self.base_dir.join(ident)
    }

    pub fn exists(&self, ident: &str) -> bool {
        self.path(ident).is_file()
    }

    pub fn read(&self, ident: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.path(ident))
    }

    /// Replace the file via a uniquely named temp file and a rename.
    pub fn write(&self, ident: &str, data: &[u8]) -> std::io::Result<()> {
        let temp_path = self.base_dir.join(format!(".{}-{ident}", Eid::new()));

        if let Err(e) = std::fs::write(&temp_path, data) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(e);
        }

        std::fs::rename(&temp_path, self.path(ident))
    }
}
