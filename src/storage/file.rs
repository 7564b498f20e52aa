// Every record lives in its own file under the storage directory:
//
//   blake3(payload) (32 bytes) | payload
//
// where the payload is zstd compressed when the storage is configured to
// compress. The digest covers the bytes as written, so a truncated or
// tampered file is caught before anything tries to deserialize it.

use std::{
    fs,
    path::{Path, PathBuf},
};

use arrayref::array_ref;
use tracing::{debug, trace};
use typed_builder::TypedBuilder;

use super::{Occupancy, Storage, StorageHandle};
use crate::{
    error::{Error, Result},
    serialization::BinaryBuffer,
};

const DIGEST_BYTES: usize = 32;

#[derive(Clone, Debug, TypedBuilder)]
pub struct FileStorageConfig {
    /// Directory records are written to. Created if it doesn't exist.
    #[builder(setter(into))]
    pub dir: PathBuf,
    /// Compress records with zstd.
    #[builder(default = false)]
    pub compress: bool,
    #[builder(default = 3)]
    pub compression_level: i32,
}

pub struct FileStorage {
    config: FileStorageConfig,
    occupancy: Occupancy,
}

impl FileStorage {
    pub fn new(config: FileStorageConfig) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;
        debug!(dir = %config.dir.display(), compress = config.compress, "file storage ready");
        Ok(Self {
            config,
            occupancy: Occupancy::default(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    fn path(&self, handle: StorageHandle) -> PathBuf {
        self.config.dir.join(format!("block-{:016x}.rec", handle))
    }
}

impl Storage for FileStorage {
    fn put(&self, record: BinaryBuffer) -> Result<StorageHandle> {
        let handle = self.occupancy.next_handle();
        let payload = if self.config.compress {
            zstd::encode_all(record.as_slice(), self.config.compression_level)?
        } else {
            record.into_vec()
        };
        let mut bytes = Vec::with_capacity(DIGEST_BYTES + payload.len());
        bytes.extend_from_slice(blake3::hash(&payload).as_bytes());
        bytes.extend_from_slice(&payload);
        fs::write(self.path(handle), &bytes)?;
        self.occupancy.added();
        trace!(handle, bytes = bytes.len(), "wrote record");
        Ok(handle)
    }

    fn get(&self, handle: StorageHandle) -> Result<BinaryBuffer> {
        let path = self.path(handle);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::MissingRecord(handle))?
            }
            Err(e) => Err(e)?,
        };
        if bytes.len() < DIGEST_BYTES {
            Err(Error::StorageCorrupted(handle))?
        }
        let digest = array_ref![bytes, 0, DIGEST_BYTES];
        let payload = &bytes[DIGEST_BYTES..];
        if blake3::hash(payload).as_bytes() != digest {
            Err(Error::StorageCorrupted(handle))?
        }
        let record = if self.config.compress {
            zstd::decode_all(payload)?
        } else {
            payload.to_vec()
        };
        fs::remove_file(&path)?;
        self.occupancy.removed();
        trace!(handle, bytes = bytes.len(), "read record");
        Ok(BinaryBuffer::from_vec(record))
    }

    fn discard(&self, handle: StorageHandle) -> Result<()> {
        fs::remove_file(self.path(handle))?;
        self.occupancy.removed();
        Ok(())
    }

    fn count(&self) -> usize {
        self.occupancy.count()
    }

    fn max_size(&self) -> usize {
        self.occupancy.max()
    }
}
