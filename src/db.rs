/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The sidecar database: a single blob stored at the mirror root on the
//! device, mapping canonical relative paths to the `(mtime, size)` pair
//! observed at the last successful push.
//!
//! The database may describe a subset, but never a superset, of the
//! files on the device. Sizes match the remote file; mtimes match the
//! *local* source file, because the device's own timestamps cannot be
//! trusted on many /sdcard filesystems.

use std::collections::BTreeMap;

use log::debug;

use crate::session::SyncSession;
use crate::{AdbError, Result, UnixPath};

/// Default blob name; kept for compatibility with earlier tooling that
/// stored a pickled mapping under the same name.
pub const DB_NAME: &str = "files.pickle";

const DB_MAGIC: &[u8; 8] = b"ADBMIRDB";
const DB_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbEntry {
    /// Mtime of the local source at the last successful push.
    pub mtime: u32,
    /// Size of the file on the device.
    pub size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Database {
    entries: BTreeMap<String, DbEntry>,
}

impl Database {
    pub fn new() -> Database {
        Database::default()
    }

    pub fn get(&self, key: &str) -> Option<DbEntry> {
        self.entries.get(key).copied()
    }

    pub fn insert(&mut self, key: String, entry: DbEntry) {
        self.entries.insert(key, entry);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, DbEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serializes the mapping: magic, version byte, record count, then
    /// length-prefixed `key || mtime || size` records. Integers are
    /// little-endian.
    pub fn encode(&self) -> Vec<u8> {
        let mut blob = Vec::with_capacity(16 + self.entries.len() * 32);
        blob.extend_from_slice(DB_MAGIC);
        blob.push(DB_VERSION);
        blob.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for (key, entry) in &self.entries {
            blob.extend_from_slice(&(key.len() as u32).to_le_bytes());
            blob.extend_from_slice(key.as_bytes());
            blob.extend_from_slice(&entry.mtime.to_le_bytes());
            blob.extend_from_slice(&entry.size.to_le_bytes());
        }
        blob
    }

    pub fn decode(blob: &[u8]) -> Result<Database> {
        let mut cursor = Cursor { blob, pos: 0 };
        if cursor.take(DB_MAGIC.len())? != DB_MAGIC.as_slice() {
            return Err(AdbError::Protocol("bad database magic".to_owned()));
        }
        let version = cursor.take(1)?[0];
        if version != DB_VERSION {
            return Err(AdbError::Protocol(format!(
                "unsupported database version {}",
                version
            )));
        }
        let count = cursor.u32_le()?;
        let mut entries = BTreeMap::new();
        for _ in 0..count {
            let key_len = cursor.u32_le()? as usize;
            let key = std::str::from_utf8(cursor.take(key_len)?)?.to_owned();
            let mtime = cursor.u32_le()?;
            let size = cursor.u64_le()?;
            entries.insert(key, DbEntry { mtime, size });
        }
        Ok(Database { entries })
    }

    /// Pulls and decodes the blob at `<remote_root>/<name>`. A missing
    /// blob, a failed pull or a corrupt payload all degrade to an empty
    /// database.
    pub async fn load(session: &mut SyncSession, remote_root: &UnixPath, name: &str) -> Database {
        let path = remote_root.join(name);
        let mut blob = Vec::new();
        if let Err(e) = session.pull(&path, &mut blob).await {
            debug!("no usable database at {}: {}", path.display(), e);
            return Database::new();
        }
        match Database::decode(&blob) {
            Ok(db) => db,
            Err(e) => {
                debug!("discarding corrupt database at {}: {}", path.display(), e);
                Database::new()
            }
        }
    }

    /// Encodes and pushes the blob to `<remote_root>/<name>`.
    pub async fn store(
        &self,
        session: &mut SyncSession,
        remote_root: &UnixPath,
        name: &str,
    ) -> Result<()> {
        let path = remote_root.join(name);
        let blob = self.encode();
        session.push(&mut blob.as_slice(), &path, 0o644, 0).await
    }
}

struct Cursor<'a> {
    blob: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.blob.len() - self.pos < n {
            return Err(AdbError::Protocol("truncated database blob".to_owned()));
        }
        let slice = &self.blob[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u32_le(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().expect("4-byte slice")))
    }

    fn u64_le(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().expect("8-byte slice")))
    }
}
