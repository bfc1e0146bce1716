//! Durable storage collaborators backing the persisted log.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::ordering::Persisted;
use crate::utils::MiradorError;

use serde::{de::DeserializeOwned, Serialize};

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

/// Sequential reader of persisted entries, replayed from index 0 on startup.
pub trait Storage {
    /// Loads the entry at `index`; `Ok(None)` signals end of log.
    fn load(&mut self, index: u64) -> Result<Option<Persisted>, MiradorError>;
}

/// In-memory storage, for embedders that persist elsewhere and for tests.
#[derive(Debug, Clone, Default)]
pub struct MemStorage {
    entries: Vec<Persisted>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, entry: Persisted) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Storage for MemStorage {
    fn load(&mut self, index: u64) -> Result<Option<Persisted>, MiradorError> {
        Ok(self.entries.get(index as usize).cloned())
    }
}

/// Append-only log file. Each entry is an 8-byte big-endian length header
/// followed by the MessagePack encoding of the entry.
#[derive(Debug)]
pub struct FileStorage {
    /// Path of the backing file.
    path: PathBuf,

    /// Backing file; cursor is kept at EOF between calls.
    backer: File,

    /// Current file size.
    file_size: usize,

    /// Index and file offset of the next entry `load` would read
    /// sequentially.
    read_cursor: (u64, usize),
}

impl FileStorage {
    /// Opens the backing file, creating it if missing.
    pub fn open(path: &Path) -> Result<Self, MiradorError> {
        if !path.exists() {
            File::create(path)?;
            pf_info!("created backer file '{}'", path.display());
        } else {
            pf_info!("backer file '{}' already exists", path.display());
        }
        let mut backer = OpenOptions::new().read(true).write(true).open(path)?;
        let file_size = backer.seek(SeekFrom::End(0))? as usize;

        Ok(FileStorage {
            path: path.to_path_buf(),
            backer,
            file_size,
            read_cursor: (0, 0),
        })
    }

    /// Opens the backing file after discarding any previous content.
    pub fn create_fresh(path: &Path) -> Result<Self, MiradorError> {
        if path.exists() {
            fs::remove_file(path)?;
        }
        Self::open(path)
    }

    #[inline]
    pub fn file_size(&self) -> usize {
        self.file_size
    }

    /// Read out entry at given offset. Returns `None` at EOF or if a partial
    /// entry is found at the tail.
    fn read_entry<Ent: DeserializeOwned>(
        backer: &mut File,
        file_size: usize,
        offset: usize,
    ) -> Result<(Option<Ent>, usize), MiradorError> {
        if offset + 8 > file_size {
            if offset < file_size {
                // suppress warning if offset == file_size, the normal end
                pf_warn!(
                    "read header end offset {} out of file bound {}",
                    offset + 8,
                    file_size
                );
            }
            return Ok((None, offset));
        }

        // read entry length header
        let mut header = [0u8; 8];
        backer.seek(SeekFrom::Start(offset as u64))?;
        backer.read_exact(&mut header)?;
        let entry_len = u64::from_be_bytes(header) as usize;
        let offset_e = offset + 8 + entry_len;
        if offset_e > file_size {
            pf_warn!("read entry invalid length {}", entry_len);
            backer.seek(SeekFrom::End(0))?; // recover cursor to EOF
            return Ok((None, offset));
        }

        // read entry content
        let mut entry_buf: Vec<u8> = vec![0; entry_len];
        backer.read_exact(&mut entry_buf[..])?;
        let entry = decode_from_slice(&entry_buf)?;
        backer.seek(SeekFrom::End(0))?; // recover cursor to EOF
        Ok((Some(entry), offset_e))
    }

    /// Append given entry to EOF. Returns the file size after.
    fn append_entry<Ent: Serialize>(
        backer: &mut File,
        file_size: usize,
        entry: &Ent,
        sync: bool,
    ) -> Result<usize, MiradorError> {
        let entry_bytes = encode_to_vec(entry)?;
        let entry_len = entry_bytes.len();

        // write entry length header first, then entry content
        backer.write_all(&(entry_len as u64).to_be_bytes())?;
        backer.write_all(&entry_bytes[..])?;

        if sync {
            backer.sync_data()?;
        }

        Ok(file_size + 8 + entry_len)
    }

    /// Appends a persisted entry, optionally syncing it to disk.
    pub fn append(
        &mut self,
        entry: &Persisted,
        sync: bool,
    ) -> Result<(), MiradorError> {
        self.file_size =
            Self::append_entry(&mut self.backer, self.file_size, entry, sync)?;
        pf_trace!(
            "appended entry for seq {} now size {}",
            entry.seq_no(),
            self.file_size
        );
        Ok(())
    }

    /// Appends every entry of a batch of persistence side effects, syncing
    /// once at the end.
    pub fn append_all(
        &mut self,
        entries: &[Persisted],
        sync: bool,
    ) -> Result<(), MiradorError> {
        for entry in entries {
            self.append(entry, false)?;
        }
        if sync && !entries.is_empty() {
            self.backer.sync_data()?;
        }
        Ok(())
    }

    /// Chops off a partial entry left at the tail by a crash, so that later
    /// appends follow the last complete entry.
    pub fn truncate_tail(&mut self) -> Result<(), MiradorError> {
        let mut offset = 0;
        loop {
            let (entry, end) = Self::read_entry::<Persisted>(
                &mut self.backer,
                self.file_size,
                offset,
            )?;
            if entry.is_none() {
                break;
            }
            offset = end;
        }
        if offset < self.file_size {
            pf_warn!(
                "discarding {} trailing bytes of '{}'",
                self.file_size - offset,
                self.path.display()
            );
            self.backer.set_len(offset as u64)?;
            self.backer.seek(SeekFrom::End(0))?;
            self.backer.sync_all()?;
            self.file_size = offset;
        }
        self.read_cursor = (0, 0);
        Ok(())
    }
}

impl Storage for FileStorage {
    fn load(&mut self, index: u64) -> Result<Option<Persisted>, MiradorError> {
        // rewind if asked for an entry behind the sequential cursor
        if index < self.read_cursor.0 {
            self.read_cursor = (0, 0);
        }
        loop {
            let (entry, end) = Self::read_entry(
                &mut self.backer,
                self.file_size,
                self.read_cursor.1,
            )?;
            let entry = match entry {
                Some(entry) => entry,
                None => return Ok(None),
            };
            let at = self.read_cursor.0;
            self.read_cursor = (at + 1, end);
            if at == index {
                return Ok(Some(entry));
            }
        }
    }
}

#[cfg(test)]
mod storage_tests {
    use super::*;
    use crate::ordering::{load_persisted, PEntry, QEntry};

    use bytes::Bytes;

    fn q(seq_no: u64) -> Persisted {
        Persisted::QEntry(QEntry {
            seq_no,
            epoch: 1,
            digest: Bytes::from_static(b"digest"),
        })
    }

    #[test]
    fn append_then_load() -> Result<(), MiradorError> {
        let path = Path::new("/tmp/test-mirador-backer-0.log");
        let mut storage = FileStorage::create_fresh(path)?;
        storage.append(&q(1), false)?;
        storage.append_all(&[q(2), q(3)], true)?;
        let size = storage.file_size();
        assert!(size > 3 * 8);

        assert_eq!(storage.load(1)?, Some(q(2)));
        assert_eq!(storage.load(2)?, Some(q(3)));
        assert_eq!(storage.load(0)?, Some(q(1)));
        assert_eq!(storage.load(3)?, None);

        // reopen picks up where we left
        drop(storage);
        let mut storage = FileStorage::open(path)?;
        assert_eq!(storage.file_size(), size);
        assert_eq!(storage.load(2)?, Some(q(3)));
        Ok(())
    }

    #[test]
    fn partial_tail_is_ignored_and_truncated() -> Result<(), MiradorError> {
        let path = Path::new("/tmp/test-mirador-backer-1.log");
        let mut storage = FileStorage::create_fresh(path)?;
        storage.append(&q(1), true)?;
        let good_size = storage.file_size();
        drop(storage);

        // simulate a torn write of a header claiming a long entry
        let mut file = OpenOptions::new().append(true).open(path)?;
        file.write_all(&100u64.to_be_bytes())?;
        file.write_all(b"torn")?;
        drop(file);

        let mut storage = FileStorage::open(path)?;
        assert_eq!(storage.load(0)?, Some(q(1)));
        assert_eq!(storage.load(1)?, None);
        storage.truncate_tail()?;
        assert_eq!(storage.file_size(), good_size);
        storage.append(&q(2), true)?;
        assert_eq!(storage.load(1)?, Some(q(2)));
        Ok(())
    }

    #[test]
    fn reload_persisted_log_from_file() -> Result<(), MiradorError> {
        let path = Path::new("/tmp/test-mirador-backer-2.log");
        let mut storage = FileStorage::create_fresh(path)?;
        let mut log = crate::ordering::PersistedLog::new();
        let mut entries = vec![Persisted::CEntry(crate::ordering::CEntry {
            seq_no: 0,
            checkpoint_value: Bytes::from_static(b"genesis"),
            network_config: Some(Default::default()),
        })];
        entries.push(q(1));
        entries.push(Persisted::PEntry(PEntry {
            seq_no: 1,
            epoch: 1,
            digest: Bytes::from_static(b"digest"),
        }));
        for entry in entries {
            let actions = log.add_entry(entry)?;
            storage.append_all(&actions.persist, true)?;
        }
        log.truncate(0);

        let mut storage = FileStorage::open(path)?;
        let loaded = load_persisted(&mut storage)?;
        assert_eq!(loaded, log);
        Ok(())
    }
}
