//! Binary storage for one collection's vectors.
//!
//! File format: `<collection>.idx`
//!
//! Header (47 bytes):
//! - version: u8 (1)
//! - model_id: [u8; 32] (SHA256 hash of model name)
//! - dimensions: u16 (little-endian)
//! - entry_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Entries (repeated, in insertion order):
//! - vector_id: u64 (little-endian)
//! - embedding: [f32; dimensions] (little-endian)

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::PathBuf;

use crate::semantic::index::{VectorEntry, VectorIndex};

/// Current file format version
const FORMAT_VERSION: u8 = 1;

/// Header size in bytes: version(1) + model_id(32) + dimensions(2) + entry_count(8) + checksum(4)
const HEADER_SIZE: usize = 47;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum VectorStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Model mismatch: file uses different model")]
    ModelMismatch,

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,

    #[error("Dimension mismatch: expected {expected}, file has {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Reads and writes a single index file.
pub struct VectorStorage {
    path: PathBuf,
}

impl VectorStorage {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    #[cfg(test)]
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the vector index from storage.
    ///
    /// The header must carry `expected_model_id` and `expected_dimensions`;
    /// vectors embedded by another model are not comparable.
    pub fn load(
        &self,
        expected_model_id: &[u8; 32],
        expected_dimensions: usize,
    ) -> Result<VectorIndex, VectorStorageError> {
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);

        let header = read_header(&mut reader)?;
        validate_header(&header, expected_model_id, expected_dimensions)?;

        let dimensions = header.dimensions as usize;
        let mut index = VectorIndex::with_capacity(dimensions, header.entry_count as usize);
        let mut buf = vec![0u8; 8 + dimensions * 4];

        for n in 0..header.entry_count {
            reader.read_exact(&mut buf).map_err(|e| match e.kind() {
                ErrorKind::UnexpectedEof => VectorStorageError::InvalidFormat(format!(
                    "truncated after {n} of {} entries",
                    header.entry_count
                )),
                _ => VectorStorageError::Io(e),
            })?;

            let (id, embedding) = decode_entry(&buf);
            index
                .push(id, embedding)
                .map_err(|e| VectorStorageError::InvalidFormat(e.to_string()))?;
        }

        Ok(index)
    }

    /// Save the vector index to storage, replacing any existing file.
    ///
    /// Uses atomic write: temp file -> fsync -> rename
    pub fn save(&self, index: &VectorIndex, model_id: &[u8; 32]) -> Result<(), VectorStorageError> {
        let temp_path = self.path.with_extension("tmp");

        let result = File::create(&temp_path)
            .map_err(VectorStorageError::from)
            .and_then(|file| write_index(file, index, model_id));

        if result.is_err() {
            let _ = std::fs::remove_file(&temp_path);
            return result;
        }

        std::fs::rename(&temp_path, &self.path)?;

        Ok(())
    }

    /// Write `index` only if no file exists at the path yet.
    ///
    /// Fails with `ErrorKind::AlreadyExists` otherwise, so two concurrent
    /// creators cannot both succeed.
    pub fn save_new(&self, index: &VectorIndex, model_id: &[u8; 32]) -> Result<(), VectorStorageError> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)?;

        let result = write_index(file, index, model_id);
        if result.is_err() {
            let _ = std::fs::remove_file(&self.path);
        }
        result
    }

    /// Delete the storage file. Returns whether a file was removed.
    pub fn delete(&self) -> Result<bool, VectorStorageError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

fn write_index(file: File, index: &VectorIndex, model_id: &[u8; 32]) -> Result<(), VectorStorageError> {
    let mut writer = BufWriter::new(file);

    let header = Header {
        version: FORMAT_VERSION,
        model_id: *model_id,
        dimensions: u16::try_from(index.dimensions()).map_err(|_| {
            VectorStorageError::InvalidFormat(format!(
                "{} dimensions do not fit the header",
                index.dimensions()
            ))
        })?,
        entry_count: index.len() as u64,
    };
    write_header(&mut writer, &header)?;

    for entry in index.iter() {
        write_entry(&mut writer, entry)?;
    }

    writer.flush()?;
    let file = writer
        .into_inner()
        .map_err(|e| std::io::Error::new(ErrorKind::Other, e))?;
    file.sync_all()?;

    Ok(())
}

fn read_header(reader: &mut impl Read) -> Result<Header, VectorStorageError> {
    let mut header_bytes = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_bytes).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => VectorStorageError::InvalidFormat("file shorter than header".into()),
        _ => VectorStorageError::Io(e),
    })?;

    let version = header_bytes[0];
    if version != FORMAT_VERSION {
        return Err(VectorStorageError::VersionMismatch(version, FORMAT_VERSION));
    }

    let stored_checksum = u32::from_le_bytes([
        header_bytes[43],
        header_bytes[44],
        header_bytes[45],
        header_bytes[46],
    ]);
    if stored_checksum != crc32fast::hash(&header_bytes[0..43]) {
        return Err(VectorStorageError::ChecksumMismatch);
    }

    let mut model_id = [0u8; 32];
    model_id.copy_from_slice(&header_bytes[1..33]);

    let dimensions = u16::from_le_bytes([header_bytes[33], header_bytes[34]]);
    let mut count_bytes = [0u8; 8];
    count_bytes.copy_from_slice(&header_bytes[35..43]);

    Ok(Header {
        version,
        model_id,
        dimensions,
        entry_count: u64::from_le_bytes(count_bytes),
    })
}

fn validate_header(
    header: &Header,
    expected_model_id: &[u8; 32],
    expected_dimensions: usize,
) -> Result<(), VectorStorageError> {
    if header.model_id != *expected_model_id {
        return Err(VectorStorageError::ModelMismatch);
    }

    if header.dimensions as usize != expected_dimensions {
        return Err(VectorStorageError::DimensionMismatch {
            expected: expected_dimensions,
            got: header.dimensions as usize,
        });
    }

    Ok(())
}

fn write_header(writer: &mut impl Write, header: &Header) -> Result<(), VectorStorageError> {
    let mut header_bytes = [0u8; HEADER_SIZE];

    header_bytes[0] = header.version;
    header_bytes[1..33].copy_from_slice(&header.model_id);
    header_bytes[33..35].copy_from_slice(&header.dimensions.to_le_bytes());
    header_bytes[35..43].copy_from_slice(&header.entry_count.to_le_bytes());

    let checksum = crc32fast::hash(&header_bytes[0..43]);
    header_bytes[43..47].copy_from_slice(&checksum.to_le_bytes());

    writer.write_all(&header_bytes)?;
    Ok(())
}

fn decode_entry(buf: &[u8]) -> (u64, Vec<f32>) {
    let mut id_bytes = [0u8; 8];
    id_bytes.copy_from_slice(&buf[0..8]);

    let embedding = buf[8..]
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    (u64::from_le_bytes(id_bytes), embedding)
}

fn write_entry(writer: &mut impl Write, entry: &VectorEntry) -> Result<(), VectorStorageError> {
    writer.write_all(&entry.id.to_le_bytes())?;
    for &value in &entry.embedding {
        writer.write_all(&value.to_le_bytes())?;
    }
    Ok(())
}

#[derive(Debug)]
struct Header {
    version: u8,
    model_id: [u8; 32],
    dimensions: u16,
    entry_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_model_id() -> [u8; 32] {
        let mut id = [0u8; 32];
        id[0] = 0xAB;
        id[31] = 0xCD;
        id
    }

    fn storage_in(dir: &tempfile::TempDir) -> VectorStorage {
        VectorStorage::new(dir.path().join("1.idx"))
    }

    #[test]
    fn test_save_and_load_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = storage_in(&tmp);
        let model_id = test_model_id();

        storage.save(&VectorIndex::new(512), &model_id).unwrap();
        assert!(storage.exists());

        let loaded = storage.load(&model_id, 512).unwrap();
        assert_eq!(loaded.len(), 0);
        assert_eq!(loaded.dimensions(), 512);
    }

    #[test]
    fn test_save_and_load_preserves_order() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = storage_in(&tmp);
        let model_id = test_model_id();

        let mut index = VectorIndex::new(3);
        index.push(9, vec![1.0, 0.0, 0.0]).unwrap();
        index.push(4, vec![0.0, 1.0, 0.0]).unwrap();
        index.push(6, vec![0.0, 0.0, 1.0]).unwrap();
        storage.save(&index, &model_id).unwrap();

        let loaded = storage.load(&model_id, 3).unwrap();
        let ids: Vec<u64> = loaded.ids().collect();
        assert_eq!(ids, vec![9, 4, 6]);
        let second = loaded.iter().nth(1).unwrap();
        assert_eq!(second.embedding, vec![0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_save_new_refuses_existing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = storage_in(&tmp);
        let model_id = test_model_id();

        storage.save_new(&VectorIndex::new(3), &model_id).unwrap();
        let again = storage.save_new(&VectorIndex::new(3), &model_id);

        match again {
            Err(VectorStorageError::Io(e)) => assert_eq!(e.kind(), ErrorKind::AlreadyExists),
            other => panic!("expected AlreadyExists, got {other:?}"),
        }
    }

    #[test]
    fn test_model_mismatch() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = storage_in(&tmp);
        storage.save(&VectorIndex::new(3), &test_model_id()).unwrap();

        let result = storage.load(&[0xFF; 32], 3);
        assert!(matches!(result, Err(VectorStorageError::ModelMismatch)));
    }

    #[test]
    fn test_dimension_mismatch() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = storage_in(&tmp);
        storage.save(&VectorIndex::new(3), &test_model_id()).unwrap();

        let result = storage.load(&test_model_id(), 512);
        assert!(matches!(
            result,
            Err(VectorStorageError::DimensionMismatch { expected: 512, got: 3 })
        ));
    }

    #[test]
    fn test_corrupted_header() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = storage_in(&tmp);
        storage.save(&VectorIndex::new(3), &test_model_id()).unwrap();

        let path = tmp.path().join("1.idx");
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[35] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let result = storage.load(&test_model_id(), 3);
        assert!(matches!(result, Err(VectorStorageError::ChecksumMismatch)));
    }

    #[test]
    fn test_truncated_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = storage_in(&tmp);

        let mut index = VectorIndex::new(3);
        index.push(1, vec![1.0, 0.0, 0.0]).unwrap();
        index.push(2, vec![0.0, 1.0, 0.0]).unwrap();
        storage.save(&index, &test_model_id()).unwrap();

        let path = tmp.path().join("1.idx");
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 5]).unwrap();

        let result = storage.load(&test_model_id(), 3);
        assert!(matches!(result, Err(VectorStorageError::InvalidFormat(_))));
    }

    #[test]
    fn test_delete_reports_presence() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = storage_in(&tmp);
        storage.save(&VectorIndex::new(3), &test_model_id()).unwrap();

        assert!(storage.delete().unwrap());
        assert!(!storage.exists());
        assert!(!storage.delete().unwrap());
    }
}
