/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! A scoped `sync:` channel to one device.

use std::path::Path;
use std::time::{Duration, SystemTime};

use futures_core::stream::Stream;
use log::{debug, trace};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::wire::{self, DataFrame, RemoteStat, SyncId, SYNC_DATA_MAX};
use crate::{
    local_file_mode, local_file_mtime, AdbDevice, AdbError, DirEntry, Result, UnixPath,
    UnixPathBuf,
};

/// One tier of a depth-first directory walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkTier {
    pub dir: UnixPathBuf,
    pub dirs: Vec<DirEntry>,
    pub files: Vec<DirEntry>,
}

/// An open `sync:` channel.
///
/// The session owns its connection; operations may not interleave.
/// Call [`SyncSession::finish`] when done — it delivers a best-effort
/// QUIT so the device side can tear down cleanly.
#[derive(Debug)]
pub struct SyncSession {
    stream: TcpStream,
}

impl SyncSession {
    /// Opens a device-attached connection and switches it into the
    /// `sync:` subprotocol.
    pub async fn open(device: &AdbDevice) -> Result<SyncSession> {
        let mut stream = device.connect().await?;
        stream
            .write_all(crate::encode_message("sync:")?.as_bytes())
            .await?;
        crate::read_host_status(&mut stream).await?;
        debug!("sync session opened to {}", device.serial);
        Ok(SyncSession { stream })
    }

    /// Sends QUIT and closes the connection, swallowing teardown
    /// failures: the session may already be poisoned by the error that
    /// ended it.
    pub async fn finish(mut self) {
        if let Err(e) = wire::write_request(&mut self.stream, SyncId::Quit, b"").await {
            debug!("QUIT not delivered during sync teardown: {}", e);
        }
        let _ = self.stream.shutdown().await;
    }

    /// Lists one directory. Listing a nonexistent path yields no
    /// entries rather than an error; the device replies DONE directly.
    pub async fn list(&mut self, path: &UnixPath) -> Result<Vec<DirEntry>> {
        trace!("sync LIST {}", path.display());
        let body = format!("{}", path.display()).into_bytes();
        wire::write_request(&mut self.stream, SyncId::List, &body).await?;
        let mut entries = Vec::new();
        while let Some(entry) = wire::read_dent(&mut self.stream).await? {
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Lists one directory, split into subdirectories and regular
    /// files. `.` and `..` are dropped, as are symlinks, devices and
    /// other specials.
    pub async fn list_dir(&mut self, path: &UnixPath) -> Result<(Vec<DirEntry>, Vec<DirEntry>)> {
        let mut dirs = Vec::new();
        let mut files = Vec::new();
        for entry in self.list(path).await? {
            if entry.is_dir() {
                if entry.name != "." && entry.name != ".." {
                    dirs.push(entry);
                }
            } else if entry.is_regular_file() {
                files.push(entry);
            }
        }
        Ok((dirs, files))
    }

    pub async fn stat(&mut self, path: &UnixPath) -> Result<RemoteStat> {
        trace!("sync STAT {}", path.display());
        let body = format!("{}", path.display()).into_bytes();
        wire::write_request(&mut self.stream, SyncId::Stat, &body).await?;
        wire::read_stat(&mut self.stream).await
    }

    /// Streams *source* to *dest* in chunks of at most 64 KiB,
    /// finishing with a DONE frame that carries *mtime*.
    ///
    /// Callers pushing from a plain byte source should pass mode
    /// `0o644` and mtime `0`; [`SyncSession::push_file`] fills both in
    /// from the local file.
    pub async fn push<R: AsyncRead + Unpin>(
        &mut self,
        source: &mut R,
        dest: &UnixPath,
        mode: u32,
        mtime: u32,
    ) -> Result<()> {
        let existing = self.stat(dest).await?;
        if existing.exists() && existing.is_dir() {
            return Err(AdbError::Remote(format!(
                "cannot push onto {}: is a directory",
                dest.display()
            )));
        }

        trace!("sync SEND {} mode {:o}", dest.display(), mode);
        let body = format!("{},{}", dest.display(), mode).into_bytes();
        wire::write_request(&mut self.stream, SyncId::Send, &body).await?;

        let mut buf = vec![0u8; SYNC_DATA_MAX];
        loop {
            let len = source.read(&mut buf).await?;
            if len == 0 {
                break;
            }
            wire::write_data_chunk(&mut self.stream, &buf[..len]).await?;
        }
        wire::write_data_done(&mut self.stream, mtime).await?;
        wire::read_status(&mut self.stream).await
    }

    /// Pushes a local regular file, carrying its mode and mtime onto
    /// the wire. Failures to read the file before the transfer starts
    /// are reported as local I/O errors and leave the session usable.
    pub async fn push_file(&mut self, source: &Path, dest: &UnixPath) -> Result<()> {
        let meta = tokio::fs::metadata(source)
            .await
            .map_err(|e| local_io(source, e))?;
        if !meta.is_file() {
            return Err(local_io(
                source,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a regular file"),
            ));
        }
        let file = tokio::fs::File::open(source)
            .await
            .map_err(|e| local_io(source, e))?;
        let mut reader = BufReader::new(file);
        self.push(
            &mut reader,
            dest,
            local_file_mode(&meta),
            local_file_mtime(&meta),
        )
        .await
    }

    /// Reads *src* into *sink* until the DONE frame.
    pub async fn pull<W: AsyncWrite + Unpin>(&mut self, src: &UnixPath, sink: &mut W) -> Result<()> {
        trace!("sync RECV {}", src.display());
        let body = format!("{}", src.display()).into_bytes();
        wire::write_request(&mut self.stream, SyncId::Recv, &body).await?;
        loop {
            match wire::read_data(&mut self.stream).await? {
                DataFrame::Chunk(payload) => sink.write_all(&payload).await?,
                DataFrame::Done(_) => return Ok(()),
            }
        }
    }

    /// Pulls *src* to the local path *dest*, copying the remote mtime
    /// but not permissions. Data lands in `<dest>.part` first and is
    /// renamed over the target only once the transfer completed; the
    /// partial file is removed on any failure.
    pub async fn pull_to_file(&mut self, src: &UnixPath, dest: &Path) -> Result<()> {
        let stat = self.stat(src).await?;
        if !stat.exists() {
            return Err(AdbError::Remote(format!(
                "cannot pull {}: no such file",
                src.display()
            )));
        }
        if !stat.is_regular_file() {
            return Err(AdbError::Remote(format!(
                "cannot pull {}: not a regular file",
                src.display()
            )));
        }

        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut part = dest.as_os_str().to_os_string();
        part.push(".part");
        let part = std::path::PathBuf::from(part);

        let result = async {
            let mut out = tokio::fs::File::create(&part).await?;
            self.pull(src, &mut out).await?;
            out.flush().await?;
            drop(out);
            let _ = std::fs::remove_file(dest);
            std::fs::rename(&part, dest)?;
            let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(stat.mtime as u64);
            std::fs::File::options()
                .write(true)
                .open(dest)?
                .set_modified(mtime)?;
            Ok(())
        }
        .await;

        if result.is_err() {
            let _ = std::fs::remove_file(&part);
        }
        result
    }

    /// Walks the remote tree depth-first, yielding one [`WalkTier`]
    /// per directory. Subdirectories are visited in listed order.
    pub fn walk<'a>(&'a mut self, root: &UnixPath) -> impl Stream<Item = Result<WalkTier>> + 'a {
        let root = root.to_path_buf();
        async_stream::try_stream! {
            let mut pending = vec![root];
            while let Some(dir) = pending.pop() {
                let (dirs, files) = self.list_dir(&dir).await?;
                for sub in dirs.iter().rev() {
                    pending.push(dir.join(&sub.name));
                }
                yield WalkTier { dir, dirs, files };
            }
        }
    }
}

fn local_io(path: &Path, source: std::io::Error) -> AdbError {
    AdbError::LocalIo {
        path: path.to_path_buf(),
        source,
    }
}
