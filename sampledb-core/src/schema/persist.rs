// schema/persist.rs
// Catalog persistence: in-memory store for tests, checksummed files otherwise

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::catalog::SchemaCatalog;
use crate::error::{Result, SampleDbError};

const CATALOG_MAGIC: &[u8; 8] = b"SDBCATLG";
const CATALOG_FORMAT_VERSION: u32 = 1;
// magic + format version + checksum + payload length
const CATALOG_HEADER_SIZE: usize = 8 + 4 + 4 + 4;

/// Durable home of collection catalogs
pub trait CatalogStore: Send + Sync {
    fn load(&self, collection: &str) -> Result<Option<SchemaCatalog>>;

    fn save(&self, collection: &str, catalog: &SchemaCatalog) -> Result<()>;
}

/// Catalogs kept in memory (tests, ephemeral collections)
#[derive(Debug, Default)]
pub struct MemoryCatalogStore {
    catalogs: Mutex<HashMap<String, SchemaCatalog>>,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CatalogStore for MemoryCatalogStore {
    fn load(&self, collection: &str) -> Result<Option<SchemaCatalog>> {
        Ok(self.catalogs.lock().get(collection).cloned())
    }

    fn save(&self, collection: &str, catalog: &SchemaCatalog) -> Result<()> {
        self.catalogs
            .lock()
            .insert(collection.to_string(), catalog.clone());
        Ok(())
    }
}

/// One `<collection>.catalog` file per collection under a directory
///
/// File layout (little endian):
///
/// ```text
/// [magic: 8][format: u32][crc32: u32][len: u32][bincode payload: len]
/// ```
#[derive(Debug, Clone)]
pub struct FileCatalogStore {
    dir: PathBuf,
}

impl FileCatalogStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        fs::create_dir_all(dir.as_ref())?;
        Ok(FileCatalogStore {
            dir: dir.as_ref().to_path_buf(),
        })
    }

    fn path_for(&self, collection: &str) -> PathBuf {
        self.dir.join(format!("{}.catalog", collection))
    }
}

impl CatalogStore for FileCatalogStore {
    fn load(&self, collection: &str) -> Result<Option<SchemaCatalog>> {
        let path = self.path_for(collection);
        if !path.exists() {
            return Ok(None);
        }

        let mut bytes = Vec::new();
        File::open(&path)?.read_to_end(&mut bytes)?;
        decode_catalog(&bytes).map(Some)
    }

    fn save(&self, collection: &str, catalog: &SchemaCatalog) -> Result<()> {
        let bytes = encode_catalog(catalog)?;

        // Write to a sibling temp file and rename so readers never observe a
        // partially written catalog
        let path = self.path_for(collection);
        let tmp = path.with_extension("catalog.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        crate::log_debug!(
            "Saved catalog for '{}' (version {}, {} bytes)",
            collection,
            catalog.version(),
            bytes.len()
        );
        Ok(())
    }
}

pub(crate) fn encode_catalog(catalog: &SchemaCatalog) -> Result<Vec<u8>> {
    let payload = bincode::serialize(catalog)?;
    let checksum = crc32fast::hash(&payload);

    let mut out = Vec::with_capacity(CATALOG_HEADER_SIZE + payload.len());
    out.extend_from_slice(CATALOG_MAGIC);
    out.extend_from_slice(&CATALOG_FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&checksum.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

pub(crate) fn decode_catalog(bytes: &[u8]) -> Result<SchemaCatalog> {
    if bytes.len() < CATALOG_HEADER_SIZE {
        return Err(SampleDbError::Corruption(format!(
            "Catalog file too short ({} bytes)",
            bytes.len()
        )));
    }
    if &bytes[0..8] != CATALOG_MAGIC {
        return Err(SampleDbError::Corruption("Invalid catalog magic".into()));
    }

    let read_u32 = |offset: usize| {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&bytes[offset..offset + 4]);
        u32::from_le_bytes(buf)
    };

    let format = read_u32(8);
    if format != CATALOG_FORMAT_VERSION {
        return Err(SampleDbError::Corruption(format!(
            "Unsupported catalog format version {}",
            format
        )));
    }
    let expected = read_u32(12);
    let len = read_u32(16) as usize;

    let payload = bytes
        .get(CATALOG_HEADER_SIZE..CATALOG_HEADER_SIZE + len)
        .ok_or_else(|| SampleDbError::Corruption("Truncated catalog payload".into()))?;
    let actual = crc32fast::hash(payload);
    if actual != expected {
        return Err(SampleDbError::Corruption(format!(
            "Catalog checksum mismatch: expected {:08x}, got {:08x}",
            expected, actual
        )));
    }

    Ok(bincode::deserialize(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::field::labels;
    use crate::schema::MediaType;
    use tempfile::TempDir;

    fn sample_catalog() -> SchemaCatalog {
        let mut catalog = SchemaCatalog::new(MediaType::Video);
        catalog.add_field("gt", labels::detections()).unwrap();
        catalog.add_frame_field("cls", labels::classification()).unwrap();
        catalog
    }

    #[test]
    fn test_file_store_persists_catalog() {
        let dir = TempDir::new().unwrap();
        let store = FileCatalogStore::new(dir.path()).unwrap();
        let catalog = sample_catalog();

        assert!(store.load("quickstart").unwrap().is_none());
        store.save("quickstart", &catalog).unwrap();

        // A fresh store over the same directory sees the catalog
        let reopened = FileCatalogStore::new(dir.path()).unwrap();
        let loaded = reopened.load("quickstart").unwrap().unwrap();
        assert_eq!(loaded, catalog);
        assert!(loaded.get_field("gt.detections.label").is_some());
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let mut bytes = encode_catalog(&sample_catalog()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;

        let err = decode_catalog(&bytes).unwrap_err();
        assert!(matches!(err, SampleDbError::Corruption(_)));
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn test_bad_magic_detected() {
        let mut bytes = encode_catalog(&sample_catalog()).unwrap();
        bytes[0] = b'X';
        assert!(decode_catalog(&bytes).is_err());
        assert!(decode_catalog(&bytes[..4]).is_err());
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryCatalogStore::new();
        store.save("a", &sample_catalog()).unwrap();
        assert!(store.load("a").unwrap().is_some());
        assert!(store.load("b").unwrap().is_none());
    }
}
