/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Frame codecs for the binary `sync:` subprotocol.
//!
//! Every frame starts with a 4-byte ASCII tag; all integers are
//! little-endian u32. The message shapes mirror `union syncmsg` in the
//! platform's file sync service: req, stat, dent, data and status.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{AdbError, DirEntry, Result};

/// Maximum payload of a single DATA frame, hardcoded in the device's
/// file sync service.
pub const SYNC_DATA_MAX: usize = 64 * 1024;

pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncId {
    List,
    Stat,
    Send,
    Recv,
    Quit,
    Dent,
    Done,
    Data,
    Okay,
    Fail,
}

impl SyncId {
    pub fn code(self) -> &'static [u8; 4] {
        match self {
            SyncId::List => b"LIST",
            SyncId::Stat => b"STAT",
            SyncId::Send => b"SEND",
            SyncId::Recv => b"RECV",
            SyncId::Quit => b"QUIT",
            SyncId::Dent => b"DENT",
            SyncId::Done => b"DONE",
            SyncId::Data => b"DATA",
            SyncId::Okay => b"OKAY",
            SyncId::Fail => b"FAIL",
        }
    }

    fn from_code(code: [u8; 4]) -> Result<SyncId> {
        match &code {
            b"LIST" => Ok(SyncId::List),
            b"STAT" => Ok(SyncId::Stat),
            b"SEND" => Ok(SyncId::Send),
            b"RECV" => Ok(SyncId::Recv),
            b"QUIT" => Ok(SyncId::Quit),
            b"DENT" => Ok(SyncId::Dent),
            b"DONE" => Ok(SyncId::Done),
            b"DATA" => Ok(SyncId::Data),
            b"OKAY" => Ok(SyncId::Okay),
            b"FAIL" => Ok(SyncId::Fail),
            _ => Err(AdbError::Protocol(format!(
                "unknown frame tag {:?}",
                bstr::BStr::new(&code)
            ))),
        }
    }
}

/// The mode/size/mtime triple returned by STAT. `mode == 0` means the
/// path does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteStat {
    pub mode: u32,
    pub size: u32,
    pub mtime: u32,
}

impl RemoteStat {
    pub fn exists(&self) -> bool {
        self.mode != 0
    }

    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_regular_file(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }
}

/// Payload of a data frame: a content chunk, or the DONE marker whose
/// length field carries an mtime instead of a payload size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataFrame {
    Chunk(Vec<u8>),
    Done(u32),
}

pub async fn read_u32_le<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u32> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes).await?;
    Ok(u32::from_le_bytes(bytes))
}

pub async fn write_u32_le<W: AsyncWrite + Unpin>(writer: &mut W, n: u32) -> Result<()> {
    writer.write_all(&n.to_le_bytes()).await?;
    Ok(())
}

pub async fn read_id<R: AsyncRead + Unpin>(reader: &mut R) -> Result<SyncId> {
    let mut code = [0u8; 4];
    reader.read_exact(&mut code).await?;
    SyncId::from_code(code)
}

/// Reads the little-endian length and message of a FAIL frame.
async fn read_failure<R: AsyncRead + Unpin>(reader: &mut R) -> Result<AdbError> {
    let len = read_u32_le(reader).await? as usize;
    if len > SYNC_DATA_MAX {
        return Err(AdbError::Protocol(format!(
            "oversized failure message ({} bytes)",
            len
        )));
    }
    let mut message = vec![0u8; len];
    reader.read_exact(&mut message).await?;
    Ok(AdbError::Remote(
        String::from_utf8_lossy(&message).into_owned(),
    ))
}

/// Writes a request frame: `id || len || body`.
pub async fn write_request<W: AsyncWrite + Unpin>(
    writer: &mut W,
    id: SyncId,
    body: &[u8],
) -> Result<()> {
    writer.write_all(id.code()).await?;
    write_u32_le(writer, u32::try_from(body.len())?).await?;
    if !body.is_empty() {
        writer.write_all(body).await?;
    }
    Ok(())
}

pub async fn read_request<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(SyncId, Vec<u8>)> {
    let id = read_id(reader).await?;
    let len = read_u32_le(reader).await? as usize;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok((id, body))
}

pub async fn write_stat<W: AsyncWrite + Unpin>(writer: &mut W, stat: &RemoteStat) -> Result<()> {
    writer.write_all(SyncId::Stat.code()).await?;
    write_u32_le(writer, stat.mode).await?;
    write_u32_le(writer, stat.size).await?;
    write_u32_le(writer, stat.mtime).await?;
    Ok(())
}

pub async fn read_stat<R: AsyncRead + Unpin>(reader: &mut R) -> Result<RemoteStat> {
    let id = read_id(reader).await?;
    if id != SyncId::Stat {
        return Err(AdbError::Protocol(format!(
            "expected STAT, got {:?}",
            bstr::BStr::new(id.code())
        )));
    }
    let mode = read_u32_le(reader).await?;
    let size = read_u32_le(reader).await?;
    let mtime = read_u32_le(reader).await?;
    Ok(RemoteStat { mode, size, mtime })
}

pub async fn write_dent<W: AsyncWrite + Unpin>(writer: &mut W, entry: &DirEntry) -> Result<()> {
    writer.write_all(SyncId::Dent.code()).await?;
    write_u32_le(writer, entry.mode).await?;
    write_u32_le(writer, u32::try_from(entry.size)?).await?;
    write_u32_le(writer, entry.mtime).await?;
    let name = entry.name.as_bytes();
    write_u32_le(writer, u32::try_from(name.len())?).await?;
    writer.write_all(name).await?;
    Ok(())
}

/// Marks the end of a directory listing; all other fields are zero.
pub async fn write_dent_done<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<()> {
    writer.write_all(SyncId::Done.code()).await?;
    writer.write_all(&[0u8; 16]).await?;
    Ok(())
}

/// Reads one directory entry, or `None` on the DONE marker.
pub async fn read_dent<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<DirEntry>> {
    let id = read_id(reader).await?;
    match id {
        SyncId::Dent => {}
        SyncId::Done => {
            // DONE still carries the four zeroed integer fields.
            let mut rest = [0u8; 16];
            reader.read_exact(&mut rest).await?;
            return Ok(None);
        }
        SyncId::Fail => return Err(read_failure(reader).await?),
        other => {
            return Err(AdbError::Protocol(format!(
                "expected DENT or DONE, got {:?}",
                bstr::BStr::new(other.code())
            )))
        }
    }
    let mode = read_u32_le(reader).await?;
    let size = read_u32_le(reader).await?;
    let mtime = read_u32_le(reader).await?;
    let name_len = read_u32_le(reader).await? as usize;
    if name_len > SYNC_DATA_MAX {
        return Err(AdbError::Protocol(format!(
            "oversized entry name ({} bytes)",
            name_len
        )));
    }
    let mut name = vec![0u8; name_len];
    reader.read_exact(&mut name).await?;
    let name = std::str::from_utf8(&name)?.to_owned();
    Ok(Some(DirEntry {
        mode,
        size: size as u64,
        mtime,
        name,
    }))
}

pub async fn write_data_chunk<W: AsyncWrite + Unpin>(writer: &mut W, chunk: &[u8]) -> Result<()> {
    if chunk.len() > SYNC_DATA_MAX {
        return Err(AdbError::Protocol(format!(
            "data chunk exceeds the 64 KiB frame limit ({} bytes)",
            chunk.len()
        )));
    }
    writer.write_all(SyncId::Data.code()).await?;
    write_u32_le(writer, chunk.len() as u32).await?;
    writer.write_all(chunk).await?;
    Ok(())
}

/// Terminates a SEND stream; the length field carries the mtime the
/// device should stamp on the file.
pub async fn write_data_done<W: AsyncWrite + Unpin>(writer: &mut W, mtime: u32) -> Result<()> {
    writer.write_all(SyncId::Done.code()).await?;
    write_u32_le(writer, mtime).await?;
    Ok(())
}

pub async fn read_data<R: AsyncRead + Unpin>(reader: &mut R) -> Result<DataFrame> {
    let id = read_id(reader).await?;
    match id {
        SyncId::Data => {
            let len = read_u32_le(reader).await? as usize;
            if len > SYNC_DATA_MAX {
                return Err(AdbError::Protocol(format!(
                    "oversized data frame ({} bytes)",
                    len
                )));
            }
            let mut payload = vec![0u8; len];
            reader.read_exact(&mut payload).await?;
            Ok(DataFrame::Chunk(payload))
        }
        SyncId::Done => Ok(DataFrame::Done(read_u32_le(reader).await?)),
        SyncId::Fail => Err(read_failure(reader).await?),
        other => Err(AdbError::Protocol(format!(
            "expected DATA or DONE, got {:?}",
            bstr::BStr::new(other.code())
        ))),
    }
}

pub async fn write_status<W: AsyncWrite + Unpin>(
    writer: &mut W,
    ok: bool,
    message: &str,
) -> Result<()> {
    let id = if ok { SyncId::Okay } else { SyncId::Fail };
    writer.write_all(id.code()).await?;
    write_u32_le(writer, u32::try_from(message.len())?).await?;
    writer.write_all(message.as_bytes()).await?;
    Ok(())
}

/// Reads the status frame that terminates a SEND; FAIL carries a
/// human-readable message from the device.
pub async fn read_status<R: AsyncRead + Unpin>(reader: &mut R) -> Result<()> {
    let id = read_id(reader).await?;
    match id {
        SyncId::Okay => {
            let len = read_u32_le(reader).await? as usize;
            if len > 0 {
                let mut ignored = vec![0u8; len.min(SYNC_DATA_MAX)];
                reader.read_exact(&mut ignored).await?;
            }
            Ok(())
        }
        SyncId::Fail => Err(read_failure(reader).await?),
        other => Err(AdbError::Protocol(format!(
            "expected OKAY or FAIL, got {:?}",
            bstr::BStr::new(other.code())
        ))),
    }
}
