//! Single-file backend with an append-only record log
//!
//! File format:
//! ```text
//! [HEADER: 64 bytes]
//!   - magic: 8 bytes ("RHIZOME\0")
//!   - version: 4 bytes (u32 LE)
//!   - reserved: 52 bytes
//!
//! [RECORDS: variable, appended]
//!   - tag: 1 byte
//!   - body: tag-specific
//!       PUT         hash (32) | len (u32 LE) | data
//!       DELETE      hash (32)
//!       META_PUT    key_len (u16 LE) | key | len (u32 LE) | value
//!       META_DELETE key_len (u16 LE) | key
//!   - checksum: first 4 bytes of blake3(tag | body)
//! ```
//!
//! Every mutation is one appended record, so each is atomic on its own. The
//! in-memory index and meta table are rebuilt by replaying the log on open; a
//! torn record at the tail (crash mid-append) is truncated away. Deleted
//! blobs keep occupying space until [`FileBackend::compact`] rewrites the file.

use super::backend::{Backend, CasOutcome};
use crate::model::Hash;
use crate::{Error, Result, MAGIC, VERSION};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const HEADER_SIZE: u64 = 64;

const TAG_PUT: u8 = 1;
const TAG_DELETE: u8 = 2;
const TAG_META_PUT: u8 = 3;
const TAG_META_DELETE: u8 = 4;

const CHECKSUM_LEN: usize = 4;

/// Location of a blob's bytes in the file
#[derive(Clone, Copy, Debug)]
struct IndexEntry {
    offset: u64,
    size: u32,
}

struct Inner {
    file: File,
    index: HashMap<Hash, IndexEntry>,
    meta: BTreeMap<String, Vec<u8>>,
    /// Current append position
    write_offset: u64,
    /// Bytes held by deleted or superseded records
    dead_bytes: u64,
}

/// A backend stored in one append-only file
pub struct FileBackend {
    path: PathBuf,
    sync_writes: bool,
    inner: Mutex<Inner>,
}

impl FileBackend {
    /// Create a new database file, truncating any existing one
    pub fn create(path: impl AsRef<Path>, sync_writes: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = write_fresh_file(&path)?;

        tracing::debug!(path = %path.display(), "created database file");
        Ok(FileBackend {
            path,
            sync_writes,
            inner: Mutex::new(Inner {
                file,
                index: HashMap::new(),
                meta: BTreeMap::new(),
                write_offset: HEADER_SIZE,
                dead_bytes: 0,
            }),
        })
    }

    /// Open an existing database file, replaying its log
    pub fn open(path: impl AsRef<Path>, sync_writes: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;
        if contents.len() < HEADER_SIZE as usize {
            return Err(Error::InvalidFile("File shorter than header".into()));
        }
        if &contents[0..8] != MAGIC {
            return Err(Error::InvalidFile("Invalid magic bytes".into()));
        }
        let version = u32::from_le_bytes([contents[8], contents[9], contents[10], contents[11]]);
        if version != VERSION {
            return Err(Error::VersionMismatch {
                expected: VERSION,
                found: version,
            });
        }

        let replay = replay(&contents);
        if replay.end < contents.len() as u64 {
            tracing::warn!(
                path = %path.display(),
                discarded = contents.len() as u64 - replay.end,
                "truncating torn record at end of log"
            );
            file.set_len(replay.end)?;
            file.sync_all()?;
        }

        tracing::debug!(
            path = %path.display(),
            objects = replay.index.len(),
            meta = replay.meta.len(),
            "opened database file"
        );
        Ok(FileBackend {
            path,
            sync_writes,
            inner: Mutex::new(Inner {
                file,
                index: replay.index,
                meta: replay.meta,
                write_offset: replay.end,
                dead_bytes: replay.dead_bytes,
            }),
        })
    }

    pub fn open_or_create(path: impl AsRef<Path>, sync_writes: bool) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::open(path, sync_writes)
        } else {
            Self::create(path, sync_writes)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn object_count(&self) -> usize {
        self.inner.lock().index.len()
    }

    /// Bytes a compaction would reclaim
    pub fn dead_bytes(&self) -> u64 {
        self.inner.lock().dead_bytes
    }

    /// Rewrite the file with only live blobs and meta, returning bytes reclaimed
    pub fn compact(&self) -> Result<u64> {
        let mut inner = self.inner.lock();
        let before = inner.write_offset;

        let tmp_path = self.path.with_extension("compact");
        let mut out = write_fresh_file(&tmp_path)?;
        let mut offset = HEADER_SIZE;
        let mut index = HashMap::with_capacity(inner.index.len());

        let mut live: Vec<(Hash, IndexEntry)> =
            inner.index.iter().map(|(h, e)| (*h, *e)).collect();
        live.sort_by_key(|(_, e)| e.offset);
        for (hash, entry) in live {
            let data = read_at(&mut inner.file, entry)?;
            let record = put_record(&hash, &data);
            out.write_all(&record)?;
            index.insert(
                hash,
                IndexEntry {
                    offset: offset + 1 + 32 + 4,
                    size: entry.size,
                },
            );
            offset += record.len() as u64;
        }
        for (key, value) in &inner.meta {
            let record = meta_put_record(key, value)?;
            out.write_all(&record)?;
            offset += record.len() as u64;
        }
        out.sync_all()?;
        drop(out);

        std::fs::rename(&tmp_path, &self.path)?;
        inner.file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        inner.index = index;
        inner.write_offset = offset;
        inner.dead_bytes = 0;

        let reclaimed = before.saturating_sub(offset);
        tracing::info!(path = %self.path.display(), reclaimed, "compacted database file");
        Ok(reclaimed)
    }

    fn append(&self, inner: &mut Inner, record: &[u8]) -> Result<u64> {
        let offset = inner.write_offset;
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(record)?;
        if self.sync_writes {
            inner.file.sync_data()?;
        }
        inner.write_offset = offset + record.len() as u64;
        Ok(offset)
    }
}

impl Backend for FileBackend {
    fn get(&self, hash: &Hash) -> Result<Option<Vec<u8>>> {
        let mut inner = self.inner.lock();
        match inner.index.get(hash).copied() {
            Some(entry) => Ok(Some(read_at(&mut inner.file, entry)?)),
            None => Ok(None),
        }
    }

    fn put(&self, hash: &Hash, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.index.contains_key(hash) {
            return Ok(());
        }
        let size = u32::try_from(data.len())
            .map_err(|_| Error::InvalidFile(format!("Blob too large: {} bytes", data.len())))?;
        let record = put_record(hash, data);
        let offset = self.append(&mut inner, &record)?;
        inner.index.insert(
            *hash,
            IndexEntry {
                offset: offset + 1 + 32 + 4,
                size,
            },
        );
        Ok(())
    }

    fn delete(&self, hash: &Hash) -> Result<bool> {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.index.get(hash).copied() else {
            return Ok(false);
        };
        let record = delete_record(hash);
        self.append(&mut inner, &record)?;
        inner.index.remove(hash);
        inner.dead_bytes += entry.size as u64 + record.len() as u64;
        Ok(true)
    }

    fn exists(&self, hash: &Hash) -> Result<bool> {
        Ok(self.inner.lock().index.contains_key(hash))
    }

    fn digests(&self) -> Result<Vec<Hash>> {
        Ok(self.inner.lock().index.keys().copied().collect())
    }

    fn get_meta(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.lock().meta.get(key).cloned())
    }

    fn put_meta(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        let record = meta_put_record(key, value)?;
        self.append(&mut inner, &record)?;
        inner.meta.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete_meta(&self, key: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        if !inner.meta.contains_key(key) {
            return Ok(false);
        }
        let record = meta_delete_record(key)?;
        self.append(&mut inner, &record)?;
        inner.meta.remove(key);
        Ok(true)
    }

    fn compare_and_swap_meta(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<CasOutcome> {
        let mut inner = self.inner.lock();
        let current = inner.meta.get(key).cloned();
        if current.as_deref() != expected {
            return Ok(CasOutcome::Conflict(current));
        }
        match new {
            Some(value) => {
                let record = meta_put_record(key, value)?;
                self.append(&mut inner, &record)?;
                inner.meta.insert(key.to_string(), value.to_vec());
            }
            None => {
                if current.is_some() {
                    let record = meta_delete_record(key)?;
                    self.append(&mut inner, &record)?;
                    inner.meta.remove(key);
                }
            }
        }
        Ok(CasOutcome::Swapped)
    }

    fn meta_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let inner = self.inner.lock();
        Ok(inner
            .meta
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn flush(&self) -> Result<()> {
        self.inner.lock().file.sync_all()?;
        Ok(())
    }
}

fn write_fresh_file(path: &Path) -> Result<File> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;

    let mut header = [0u8; HEADER_SIZE as usize];
    header[0..8].copy_from_slice(MAGIC);
    header[8..12].copy_from_slice(&VERSION.to_le_bytes());
    file.write_all(&header)?;
    file.sync_all()?;
    Ok(file)
}

fn read_at(file: &mut File, entry: IndexEntry) -> Result<Vec<u8>> {
    file.seek(SeekFrom::Start(entry.offset))?;
    let mut data = vec![0u8; entry.size as usize];
    file.read_exact(&mut data)?;
    Ok(data)
}

fn seal(mut record: Vec<u8>) -> Vec<u8> {
    let checksum = blake3::hash(&record);
    record.extend_from_slice(&checksum.as_bytes()[..CHECKSUM_LEN]);
    record
}

fn put_record(hash: &Hash, data: &[u8]) -> Vec<u8> {
    let mut record = Vec::with_capacity(1 + 32 + 4 + data.len() + CHECKSUM_LEN);
    record.push(TAG_PUT);
    record.extend_from_slice(hash.as_bytes());
    record.extend_from_slice(&(data.len() as u32).to_le_bytes());
    record.extend_from_slice(data);
    seal(record)
}

fn delete_record(hash: &Hash) -> Vec<u8> {
    let mut record = Vec::with_capacity(1 + 32 + CHECKSUM_LEN);
    record.push(TAG_DELETE);
    record.extend_from_slice(hash.as_bytes());
    seal(record)
}

fn meta_key_bytes(key: &str) -> Result<u16> {
    u16::try_from(key.len()).map_err(|_| Error::InvalidFile(format!("Meta key too long: {}", key)))
}

fn meta_put_record(key: &str, value: &[u8]) -> Result<Vec<u8>> {
    let key_len = meta_key_bytes(key)?;
    let value_len = u32::try_from(value.len())
        .map_err(|_| Error::InvalidFile(format!("Meta value too large for {}", key)))?;
    let mut record = Vec::with_capacity(1 + 2 + key.len() + 4 + value.len() + CHECKSUM_LEN);
    record.push(TAG_META_PUT);
    record.extend_from_slice(&key_len.to_le_bytes());
    record.extend_from_slice(key.as_bytes());
    record.extend_from_slice(&value_len.to_le_bytes());
    record.extend_from_slice(value);
    Ok(seal(record))
}

fn meta_delete_record(key: &str) -> Result<Vec<u8>> {
    let key_len = meta_key_bytes(key)?;
    let mut record = Vec::with_capacity(1 + 2 + key.len() + CHECKSUM_LEN);
    record.push(TAG_META_DELETE);
    record.extend_from_slice(&key_len.to_le_bytes());
    record.extend_from_slice(key.as_bytes());
    Ok(seal(record))
}

struct Replay {
    index: HashMap<Hash, IndexEntry>,
    meta: BTreeMap<String, Vec<u8>>,
    /// Offset just past the last intact record
    end: u64,
    dead_bytes: u64,
}

/// Rebuild index and meta from the record log, stopping at the first record
/// that is incomplete or fails its checksum
fn replay(contents: &[u8]) -> Replay {
    let mut state = Replay {
        index: HashMap::new(),
        meta: BTreeMap::new(),
        end: HEADER_SIZE,
        dead_bytes: 0,
    };
    let mut pos = HEADER_SIZE as usize;

    while pos < contents.len() {
        let mut cursor = Cursor {
            buf: contents,
            pos: pos + 1,
        };
        let tag = contents[pos];
        let parsed = match tag {
            TAG_PUT => cursor.hash().and_then(|hash| {
                let len = cursor.u32()? as usize;
                let offset = cursor.pos;
                cursor.skip(len)?;
                Some(Op::Put(hash, offset, len))
            }),
            TAG_DELETE => cursor.hash().map(Op::Delete),
            TAG_META_PUT => cursor.key().and_then(|key| {
                let len = cursor.u32()? as usize;
                let value = cursor.take(len)?.to_vec();
                Some(Op::MetaPut(key, value))
            }),
            TAG_META_DELETE => cursor.key().map(Op::MetaDelete),
            _ => None,
        };
        let Some(op) = parsed else { break };

        let body_end = cursor.pos;
        let Some(checksum) = contents.get(body_end..body_end + CHECKSUM_LEN) else {
            break;
        };
        if blake3::hash(&contents[pos..body_end]).as_bytes()[..CHECKSUM_LEN] != *checksum {
            break;
        }
        let record_len = (body_end + CHECKSUM_LEN - pos) as u64;

        match op {
            Op::Put(hash, offset, len) => {
                if state.index.contains_key(&hash) {
                    state.dead_bytes += record_len;
                } else {
                    state.index.insert(
                        hash,
                        IndexEntry {
                            offset: offset as u64,
                            size: len as u32,
                        },
                    );
                }
            }
            Op::Delete(hash) => {
                if let Some(entry) = state.index.remove(&hash) {
                    state.dead_bytes += entry.size as u64;
                }
                state.dead_bytes += record_len;
            }
            Op::MetaPut(key, value) => {
                state.meta.insert(key, value);
            }
            Op::MetaDelete(key) => {
                state.meta.remove(&key);
            }
        }

        pos = body_end + CHECKSUM_LEN;
        state.end = pos as u64;
    }

    state
}

enum Op {
    Put(Hash, usize, usize),
    Delete(Hash),
    MetaPut(String, Vec<u8>),
    MetaDelete(String),
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let slice = self.buf.get(self.pos..self.pos.checked_add(n)?)?;
        self.pos += n;
        Some(slice)
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        self.take(n).map(|_| ())
    }

    fn hash(&mut self) -> Option<Hash> {
        self.take(32).and_then(Hash::from_slice)
    }

    fn u32(&mut self) -> Option<u32> {
        Some(u32::from_le_bytes(self.take(4)?.try_into().ok()?))
    }

    fn key(&mut self) -> Option<String> {
        let len = u16::from_le_bytes(self.take(2)?.try_into().ok()?) as usize;
        String::from_utf8(self.take(len)?.to_vec()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_and_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.rhizome");

        {
            let store = FileBackend::create(&path, true).unwrap();
            assert_eq!(store.object_count(), 0);
        }

        {
            let store = FileBackend::open(&path, true).unwrap();
            assert_eq!(store.object_count(), 0);
        }
    }

    #[test]
    fn test_rejects_foreign_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("foreign");
        std::fs::write(&path, vec![b'x'; 128]).unwrap();
        assert!(matches!(
            FileBackend::open(&path, true),
            Err(Error::InvalidFile(_))
        ));
    }

    #[test]
    fn test_persistence_replays_puts_deletes_and_meta() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.rhizome");
        let kept = Hash::digest(b"kept");
        let gone = Hash::digest(b"gone");

        {
            let store = FileBackend::create(&path, true).unwrap();
            store.put(&kept, b"kept bytes").unwrap();
            store.put(&gone, b"gone bytes").unwrap();
            assert!(store.delete(&gone).unwrap());
            store.put_meta("ref/main", b"head").unwrap();
            store.put_meta("ref/tmp", b"x").unwrap();
            store.delete_meta("ref/tmp").unwrap();
        }

        let store = FileBackend::open(&path, true).unwrap();
        assert_eq!(store.get(&kept).unwrap(), Some(b"kept bytes".to_vec()));
        assert_eq!(store.get(&gone).unwrap(), None);
        assert_eq!(store.get_meta("ref/main").unwrap(), Some(b"head".to_vec()));
        assert_eq!(store.meta_keys("ref/").unwrap(), vec!["ref/main"]);
        assert!(store.dead_bytes() > 0);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.rhizome");
        let h = Hash::digest(b"a");
        {
            let store = FileBackend::create(&path, true).unwrap();
            store.put(&h, b"intact").unwrap();
        }
        let intact_len = std::fs::metadata(&path).unwrap().len();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[TAG_PUT, 1, 2, 3]).unwrap();
        }

        let store = FileBackend::open(&path, true).unwrap();
        assert_eq!(store.get(&h).unwrap(), Some(b"intact".to_vec()));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), intact_len);

        // appends continue cleanly after the truncation point
        let h2 = Hash::digest(b"b");
        store.put(&h2, b"after").unwrap();
        drop(store);
        let store = FileBackend::open(&path, true).unwrap();
        assert_eq!(store.get(&h2).unwrap(), Some(b"after".to_vec()));
    }

    #[test]
    fn test_compact_reclaims_deleted_space() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.rhizome");
        let store = FileBackend::create(&path, false).unwrap();
        let kept = Hash::digest(b"kept");
        store.put(&kept, &[1u8; 100]).unwrap();
        for i in 0..10u8 {
            let h = Hash::digest(&[i]);
            store.put(&h, &[i; 1000]).unwrap();
            store.delete(&h).unwrap();
        }
        store.put_meta("ref/main", b"head").unwrap();

        let reclaimed = store.compact().unwrap();
        assert!(reclaimed >= 10_000);
        assert_eq!(store.dead_bytes(), 0);
        assert_eq!(store.get(&kept).unwrap(), Some(vec![1u8; 100]));
        drop(store);

        let store = FileBackend::open(&path, true).unwrap();
        assert_eq!(store.object_count(), 1);
        assert_eq!(store.get_meta("ref/main").unwrap(), Some(b"head".to_vec()));
    }

    #[test]
    fn test_cas_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.rhizome");
        {
            let store = FileBackend::create(&path, true).unwrap();
            assert_eq!(
                store.compare_and_swap_meta("ref/main", None, Some(b"1")).unwrap(),
                CasOutcome::Swapped
            );
            assert_eq!(
                store.compare_and_swap_meta("ref/main", Some(b"0"), Some(b"2")).unwrap(),
                CasOutcome::Conflict(Some(b"1".to_vec()))
            );
        }
        let store = FileBackend::open(&path, true).unwrap();
        assert_eq!(store.get_meta("ref/main").unwrap(), Some(b"1".to_vec()));
    }
}
