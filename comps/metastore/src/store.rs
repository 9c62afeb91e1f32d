// SPDX-License-Identifier: MPL-2.0

use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use log::{debug, info, warn};
use xsan_types::{return_errno_with_msg, Errno, Error, Result};

use crate::wal::Record;

const SNAPSHOT_FILE: &str = "snapshot.db";
const SNAPSHOT_TMP_FILE: &str = "snapshot.db.tmp";
const WAL_FILE: &str = "wal.log";

/// Snapshot file prologue: magic + format version.
const SNAPSHOT_MAGIC: &[u8; 8] = b"XSANMETA";
const SNAPSHOT_VERSION: u32 = 1;

/// Compact once the write-ahead log outgrows this.
const WAL_COMPACT_THRESHOLD: u64 = 4 << 20;

/// When mutations become durable.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SyncPolicy {
    /// fsync the log on every `put`/`delete` (default; structural records
    /// must survive a crash at any point).
    Always,
    /// fsync only on compaction. For tests and bulk loads.
    OnCompact,
}

#[derive(Debug)]
struct Inner {
    table: BTreeMap<Vec<u8>, Vec<u8>>,
    wal: File,
    wal_len: u64,
}

/// An embedded ordered key/value store. See the crate docs.
#[derive(Debug)]
pub struct MetaStore {
    dir: PathBuf,
    sync_policy: SyncPolicy,
    inner: Mutex<Inner>,
}

impl MetaStore {
    /// Opens (or creates) the store rooted at directory `dir`.
    pub fn open(dir: impl AsRef<Path>, create_if_missing: bool) -> Result<Self> {
        Self::open_with_policy(dir, create_if_missing, SyncPolicy::Always)
    }

    /// Opens the store with an explicit durability policy.
    pub fn open_with_policy(
        dir: impl AsRef<Path>,
        create_if_missing: bool,
        sync_policy: SyncPolicy,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.exists() {
            if !create_if_missing {
                return_errno_with_msg!(Errno::FileNotFound, "metadata store directory missing");
            }
            fs::create_dir_all(&dir)?;
        }

        let mut table = BTreeMap::new();
        let snapshot_path = dir.join(SNAPSHOT_FILE);
        if snapshot_path.exists() {
            load_snapshot(&snapshot_path, &mut table)?;
        }

        let wal_path = dir.join(WAL_FILE);
        let mut replayed = 0usize;
        if wal_path.exists() {
            let mut reader = BufReader::new(File::open(&wal_path)?);
            while let Some(record) = Record::read_from(&mut reader)? {
                match record {
                    Record::Put { key, value } => {
                        table.insert(key, value);
                    }
                    Record::Delete { key } => {
                        table.remove(&key);
                    }
                }
                replayed += 1;
            }
        }

        let wal = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&wal_path)?;
        let wal_len = wal.metadata()?.len();
        info!(
            "metadata store opened at '{}': {} keys, {} log records replayed",
            dir.display(),
            table.len(),
            replayed
        );

        Ok(Self {
            dir,
            sync_policy,
            inner: Mutex::new(Inner {
                table,
                wal,
                wal_len,
            }),
        })
    }

    /// Stores `value` under `key`, durably under the active policy.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return_errno_with_msg!(Errno::InvalidArgs, "empty key");
        }
        let mut inner = self.lock();
        let record = Record::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        };
        self.append(&mut inner, &record)?;
        inner.table.insert(key.to_vec(), value.to_vec());
        drop(inner);
        self.maybe_compact();
        Ok(())
    }

    /// Returns an owned copy of the value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.lock()
            .table
            .get(key)
            .cloned()
            .ok_or(Error::new(Errno::NotFound))
    }

    /// Removes `key`; removing an absent key succeeds.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return_errno_with_msg!(Errno::InvalidArgs, "empty key");
        }
        let mut inner = self.lock();
        let record = Record::Delete { key: key.to_vec() };
        self.append(&mut inner, &record)?;
        inner.table.remove(key);
        drop(inner);
        self.maybe_compact();
        Ok(())
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.lock().table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A point-in-time ordered cursor over the whole store.
    pub fn iter(&self) -> MetaIter {
        let entries: Vec<(Vec<u8>, Vec<u8>)> = self
            .lock()
            .table
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        MetaIter { entries, pos: 0 }
    }

    /// Rewrites the snapshot from the live table and truncates the log.
    pub fn compact(&self) -> Result<()> {
        let mut inner = self.lock();
        let tmp_path = self.dir.join(SNAPSHOT_TMP_FILE);
        let snapshot_path = self.dir.join(SNAPSHOT_FILE);
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            writer.write_all(SNAPSHOT_MAGIC)?;
            writer.write_all(&SNAPSHOT_VERSION.to_le_bytes())?;
            for (key, value) in inner.table.iter() {
                Record::Put {
                    key: key.clone(),
                    value: value.clone(),
                }
                .write_to(&mut writer)?;
            }
            writer.flush()?;
            writer.get_ref().sync_data()?;
        }
        fs::rename(&tmp_path, &snapshot_path)?;

        inner.wal.set_len(0)?;
        inner.wal.sync_data()?;
        inner.wal_len = 0;
        debug!(
            "metadata store '{}' compacted to {} keys",
            self.dir.display(),
            inner.table.len()
        );
        Ok(())
    }

    fn append(&self, inner: &mut Inner, record: &Record) -> Result<()> {
        let mut buf = Vec::new();
        record.write_to(&mut buf)?;
        inner.wal.write_all(&buf)?;
        if self.sync_policy == SyncPolicy::Always {
            inner.wal.sync_data()?;
        }
        inner.wal_len += buf.len() as u64;
        Ok(())
    }

    fn maybe_compact(&self) {
        let over = self.lock().wal_len > WAL_COMPACT_THRESHOLD;
        if over {
            if let Err(err) = self.compact() {
                warn!(
                    "metadata store '{}': compaction failed: {err}",
                    self.dir.display()
                );
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn load_snapshot(path: &Path, table: &mut BTreeMap<Vec<u8>, Vec<u8>>) -> Result<()> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut prologue = [0u8; 12];
    std::io::Read::read_exact(&mut reader, &mut prologue)?;
    if &prologue[0..8] != SNAPSHOT_MAGIC {
        return_errno_with_msg!(Errno::ChecksumMismatch, "snapshot magic mismatch");
    }
    let version = u32::from_le_bytes(prologue[8..12].try_into().unwrap());
    if version != SNAPSHOT_VERSION {
        return_errno_with_msg!(Errno::VersionUnsupported, "snapshot format too new");
    }
    while let Some(record) = Record::read_from(&mut reader)? {
        match record {
            Record::Put { key, value } => {
                table.insert(key, value);
            }
            Record::Delete { key } => {
                table.remove(&key);
            }
        }
    }
    Ok(())
}

/// A point-in-time forward cursor, in key order.
///
/// Mirrors the usual embedded-store iterator shape: position it with
/// [`MetaIter::seek_to_first`] or [`MetaIter::seek`], then read
/// `key`/`value` while [`MetaIter::is_valid`] and advance with
/// [`MetaIter::next`].
pub struct MetaIter {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    pos: usize,
}

impl MetaIter {
    pub fn seek_to_first(&mut self) {
        self.pos = 0;
    }

    /// Positions at the first key greater than or equal to `target`.
    pub fn seek(&mut self, target: &[u8]) {
        self.pos = self.entries.partition_point(|(k, _)| k.as_slice() < target);
    }

    pub fn next(&mut self) {
        if self.is_valid() {
            self.pos += 1;
        }
    }

    pub fn is_valid(&self) -> bool {
        self.pos < self.entries.len()
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.entries.get(self.pos).map(|(k, _)| k.as_slice())
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.entries.get(self.pos).map(|(_, v)| v.as_slice())
    }
}
