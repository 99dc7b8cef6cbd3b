// src/blobstore.rs
//! Content-addressed archive storage
//!
//! Layout: `<dir>/<hh>/<hash>` where `hh` is the first two hex digits.
//!
//! Trust boundary: `put` takes the caller's hash as the content address and,
//! unless verification is enabled, never recomputes it. A client can store
//! bytes under a hash they do not match; with `with_verification(true)` the
//! digest is streamed while writing and a mismatch is rejected before commit.

use crate::error::StoreError;
use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Longest hash accepted as a blob name
const MAX_HASH_LEN: usize = 128;

pub struct BlobStore {
    dir: PathBuf,
    verify_hashes: bool,
}

impl BlobStore {
    /// Open (creating if needed) a blob store rooted at `dir`
    pub fn open_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create blob directory: {}", dir.display()))?;
        Ok(Self {
            dir,
            verify_hashes: false,
        })
    }

    pub fn with_verification(mut self, verify_hashes: bool) -> Self {
        self.verify_hashes = verify_hashes;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Store `size` bytes from `reader` under `hash`.
    ///
    /// Returns `true` if this call created the blob and `false` if a blob with
    /// that hash already existed, in which case the reader is not consumed.
    /// Concurrent puts of one hash race on a no-clobber rename; the losers see
    /// the winner's file and report `false`.
    pub fn put<R: Read>(&self, hash: &str, reader: R, size: u64) -> Result<bool> {
        let path = self.blob_path(hash)?;
        if path.exists() {
            log::debug!("[BlobStore] {} already stored, skipping put", hash);
            return Ok(false);
        }

        let shard_dir = path
            .parent()
            .context("blob path has no parent directory")?
            .to_path_buf();
        fs::create_dir_all(&shard_dir)
            .with_context(|| format!("Failed to create blob shard: {}", shard_dir.display()))?;

        let temp = tempfile::NamedTempFile::new_in(&shard_dir)
            .with_context(|| format!("Failed to create temp blob in {}", shard_dir.display()))?;
        let mut writer = HashingWriter::new(temp.as_file(), self.verify_hashes);

        // Read one byte past the declared size so an overlong body is detected.
        let copied = io::copy(&mut reader.take(size.saturating_add(1)), &mut writer)
            .with_context(|| format!("Failed to write blob {}", hash))?;
        if copied != size {
            return Err(StoreError::bad_request(format!(
                "blob size mismatch: declared {} bytes, received {}{}",
                size,
                copied.min(size),
                if copied > size { "+" } else { "" }
            ))
            .into());
        }

        if let Some(actual) = writer.finish() {
            if !actual.eq_ignore_ascii_case(hash) {
                return Err(StoreError::HashMismatch(format!(
                    "hash mismatch: expected {}, content hashes to {}",
                    hash, actual
                ))
                .into());
            }
        }

        temp.as_file()
            .sync_all()
            .with_context(|| format!("Failed to sync blob {}", hash))?;

        match temp.persist_noclobber(&path) {
            Ok(_) => {
                log::debug!("[BlobStore] Stored {} ({} bytes)", hash, size);
                Ok(true)
            }
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                log::debug!("[BlobStore] {} stored concurrently, discarding duplicate", hash);
                Ok(false)
            }
            Err(e) => Err(e.error).with_context(|| format!("Failed to commit blob {}", hash)),
        }
    }

    /// Open a stored blob, returning the file and its size
    pub fn open(&self, hash: &str) -> Result<(File, u64)> {
        let path = self.blob_path(hash)?;
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::not_found(format!("blob {} not found", hash)).into());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to open blob {}", path.display()))
            }
        };
        let size = file
            .metadata()
            .with_context(|| format!("Failed to stat blob {}", path.display()))?
            .len();
        Ok((file, size))
    }

    /// Delete a blob. Only used to roll back a failed ingestion.
    pub fn remove(&self, hash: &str) -> Result<()> {
        let path = self.blob_path(hash)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::not_found(format!("blob {} not found", hash)).into())
            }
            Err(e) => Err(e).with_context(|| format!("Failed to remove blob {}", path.display())),
        }
    }

    pub fn exists(&self, hash: &str) -> bool {
        self.blob_path(hash).map(|p| p.exists()).unwrap_or(false)
    }

    fn blob_path(&self, hash: &str) -> Result<PathBuf> {
        if hash.len() < 2
            || hash.len() > MAX_HASH_LEN
            || !hash.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Err(StoreError::bad_request(format!("invalid blob hash {:?}", hash)).into());
        }
        let hash = hash.to_ascii_lowercase();
        Ok(self.dir.join(&hash[..2]).join(hash))
    }
}

/// Hex SHA-256 of a byte slice, the hash format `put` verifies against
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

struct HashingWriter<W> {
    inner: W,
    hasher: Option<Sha256>,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W, hash: bool) -> Self {
        Self {
            inner,
            hasher: hash.then(Sha256::new),
        }
    }

    fn finish(self) -> Option<String> {
        self.hasher.map(|h| format!("{:x}", h.finalize()))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(&buf[..n]);
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

// ============================================================================
// Positioned reads
// ============================================================================

/// Random access by absolute offset
pub trait ReadAt {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    fn read_exact_at(&self, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
        while !buf.is_empty() {
            match self.read_at(buf, offset) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "failed to fill whole buffer",
                    ))
                }
                Ok(n) => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl ReadAt for [u8] {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let start = (offset as usize).min(self.len());
        let n = buf.len().min(self.len() - start);
        buf[..n].copy_from_slice(&self[start..start + n]);
        Ok(n)
    }
}

/// Turns a single-cursor stream into a `ReadAt`.
///
/// Seek-then-read is one critical section: the cursor is shared, so two
/// positioned reads on one handle must not interleave.
pub struct SeekReaderAt<R> {
    inner: Mutex<R>,
}

impl<R: Read + Seek> SeekReaderAt<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Hand the stream back, e.g. to read on from where a lookup left off
    pub fn into_inner(self) -> R {
        self.inner.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<R: Read + Seek> ReadAt for SeekReaderAt<R> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "reader lock poisoned"))?;
        inner.seek(SeekFrom::Start(offset))?;
        inner.read(buf)
    }
}

/// A bounded window `[offset, offset + len)` of a `ReadAt`, read sequentially
pub struct SectionReader<'a, R: ?Sized> {
    source: &'a R,
    pos: u64,
    end: u64,
}

impl<'a, R: ReadAt + ?Sized> SectionReader<'a, R> {
    pub fn new(source: &'a R, offset: u64, len: u64) -> Self {
        Self {
            source,
            pos: offset,
            end: offset.saturating_add(len),
        }
    }
}

impl<R: ReadAt + ?Sized> Read for SectionReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.end.saturating_sub(self.pos);
        if remaining == 0 {
            return Ok(0);
        }
        let want = buf.len().min(remaining as usize);
        let n = self.source.read_at(&mut buf[..want], self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::Arc;

    fn store() -> (tempfile::TempDir, BlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open_dir(dir.path().join("blobs")).unwrap();
        (dir, store)
    }

    fn read_blob(store: &BlobStore, hash: &str) -> Vec<u8> {
        let (mut file, size) = store.open(hash).unwrap();
        let mut data = Vec::new();
        file.read_to_end(&mut data).unwrap();
        assert_eq!(data.len() as u64, size);
        data
    }

    #[test]
    fn test_put_is_idempotent() {
        let (_dir, store) = store();
        let content = b"archive contents";
        let hash = hash_bytes(content);

        assert!(store.put(&hash, &content[..], content.len() as u64).unwrap());
        assert!(!store.put(&hash, &content[..], content.len() as u64).unwrap());

        assert_eq!(read_blob(&store, &hash), content);
        assert_eq!(read_blob(&store, &hash), content);

        let shard = store.dir().join(&hash[..2]);
        assert_eq!(fs::read_dir(shard).unwrap().count(), 1);
    }

    #[test]
    fn test_put_size_mismatch() {
        let (_dir, store) = store();
        let err = store.put("abcd", &b"12345"[..], 3).unwrap_err();
        assert!(matches!(crate::error::classify(&err), Some(StoreError::BadRequest(_))));
        let err = store.put("abcd", &b"12"[..], 3).unwrap_err();
        assert!(matches!(crate::error::classify(&err), Some(StoreError::BadRequest(_))));
        assert!(!store.exists("abcd"));
    }

    #[test]
    fn test_unchallenged_put_accepts_any_hash() {
        let (_dir, store) = store();
        assert!(store.put("00ff", &b"not hashed"[..], 10).unwrap());
        assert_eq!(read_blob(&store, "00ff"), b"not hashed");
    }

    #[test]
    fn test_verified_put_rejects_mismatch() {
        let (_dir, store) = store();
        let store = store.with_verification(true);
        let err = store.put("00ff", &b"not hashed"[..], 10).unwrap_err();
        assert!(matches!(crate::error::classify(&err), Some(StoreError::HashMismatch(_))));
        assert!(!store.exists("00ff"));

        let hash = hash_bytes(b"hashed");
        assert!(store.put(&hash, &b"hashed"[..], 6).unwrap());
    }

    #[test]
    fn test_open_and_remove_missing() {
        let (_dir, store) = store();
        let err = store.open("deadbeef").unwrap_err();
        assert!(crate::error::is_not_found_error(&err));
        assert!(store.put("deadbeef", &b"x"[..], 1).unwrap());
        store.remove("deadbeef").unwrap();
        assert!(crate::error::is_not_found_error(&store.remove("deadbeef").unwrap_err()));
    }

    #[test]
    fn test_rejects_path_like_hash() {
        let (_dir, store) = store();
        assert!(store.put("../etc", &b""[..], 0).is_err());
        assert!(store.open("a").is_err());
    }

    #[test]
    fn test_concurrent_puts_of_same_hash() {
        let (_dir, store) = store();
        let store = Arc::new(store);
        let content: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
        let hash = hash_bytes(&content);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let content = content.clone();
                let hash = hash.clone();
                std::thread::spawn(move || {
                    store.put(&hash, Cursor::new(&content), content.len() as u64).unwrap()
                })
            })
            .collect();
        let created: usize = handles.into_iter().map(|h| h.join().unwrap() as usize).sum();

        assert!(created >= 1);
        assert_eq!(read_blob(&store, &hash), content);
        let shard = store.dir().join(&hash[..2]);
        assert_eq!(fs::read_dir(shard).unwrap().count(), 1);
    }

    #[test]
    fn test_seek_reader_at_concurrent_reads() {
        let data: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        let reader = Arc::new(SeekReaderAt::new(Cursor::new(data.clone())));
        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let reader = Arc::clone(&reader);
                let data = data.clone();
                std::thread::spawn(move || {
                    for i in 0..200u64 {
                        let offset = (t * 37 + i * 13) % 4000;
                        let mut buf = [0u8; 64];
                        reader.read_exact_at(&mut buf, offset).unwrap();
                        assert_eq!(&buf[..], &data[offset as usize..offset as usize + 64]);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_section_reader_bounds() {
        let data = b"0123456789";
        let mut section = SectionReader::new(&data[..], 3, 4);
        let mut out = String::new();
        section.read_to_string(&mut out).unwrap();
        assert_eq!(out, "3456");
    }
}
