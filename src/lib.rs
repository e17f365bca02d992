/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! One-way mirroring of a local directory tree onto an Android device,
//! speaking the adb host protocol and its binary `sync:` subprotocol
//! directly. See [`rsync::sync`] for the reconciliation entry point.

pub mod db;
pub mod progress;
pub mod rsync;
pub mod session;
pub mod shell;
pub mod wire;


use std::collections::BTreeMap;
use std::io;
use std::num::{ParseIntError, TryFromIntError};
use std::path::PathBuf;
use std::str::Utf8Error;
use std::time::SystemTime;

use log::{debug, trace};
use once_cell::sync::OnceCell;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::Command;

pub use db::{Database, DbEntry, DB_NAME};
pub use progress::Progress;
pub use rsync::{sync, walk_local, LocalTier, SyncOptions, SyncSummary, TimeEstimator};
pub use session::{SyncSession, WalkTier};
pub use unix_path::{Path as UnixPath, PathBuf as UnixPathBuf};
pub use wire::{RemoteStat, SyncId, SYNC_DATA_MAX};

pub type Result<T> = std::result::Result<T, AdbError>;

#[derive(Debug, Error)]
pub enum AdbError {
    /// Nothing answered on the server port.
    #[error("cannot contact the adb server (try 'adb start-server'): {0}")]
    ServerUnreachable(#[source] io::Error),
    /// The server predates the host services this crate relies on.
    #[error("this adb server is too old; update your Android SDK")]
    OldServer,
    /// The server replied FAIL to a host command.
    #[error("adb server error: {0}")]
    Server(String),
    /// The device side of a `sync:` exchange replied FAIL.
    #[error("adb device error: {0}")]
    Remote(String),
    /// An unexpected tag, a truncated frame or an oversized field.
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    /// A local file could not be read; reconciliation skips these.
    #[error("unreadable {}: {}", path.display(), source)]
    LocalIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    FromInt(#[from] TryFromIntError),
    #[error(transparent)]
    ParseInt(#[from] ParseIntError),
    #[error(transparent)]
    Utf8(#[from] Utf8Error),
}

/// One directory entry as transported by the `sync:` subprotocol.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub struct DirEntry {
    /// POSIX mode bits, file type included.
    pub mode: u32,
    pub size: u64,
    /// Seconds since the epoch.
    pub mtime: u32,
    /// Final path component.
    pub name: String,
}

impl DirEntry {
    pub fn is_dir(&self) -> bool {
        self.mode & wire::S_IFMT == wire::S_IFDIR
    }

    pub fn is_regular_file(&self) -> bool {
        self.mode & wire::S_IFMT == wire::S_IFREG
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub enum DeviceState {
    Device,
    Bootloader,
    Offline,
    Host,
    Recovery,
    Unauthorized,
    NoPermissions,
    Sideload,
    Unknown,
}

impl From<&str> for DeviceState {
    fn from(s: &str) -> Self {
        match s {
            "device" => DeviceState::Device,
            "bootloader" => DeviceState::Bootloader,
            "offline" => DeviceState::Offline,
            "host" => DeviceState::Host,
            "recovery" => DeviceState::Recovery,
            "unauthorized" => DeviceState::Unauthorized,
            "noperm" => DeviceState::NoPermissions,
            "sideload" => DeviceState::Sideload,
            _ => DeviceState::Unknown,
        }
    }
}

/// Connection classes accepted by `host:wait-for-<kind>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceKind {
    #[default]
    Any,
    Usb,
    Local,
}

impl DeviceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceKind::Any => "any",
            DeviceKind::Usb => "usb",
            DeviceKind::Local => "local",
        }
    }
}

/// Wraps *payload* in the host protocol envelope: four lowercase hex
/// digits of length, then the payload itself.
pub(crate) fn encode_message(payload: &str) -> Result<String> {
    let length = u16::try_from(payload.len()).map(|len| format!("{:04x}", len))?;
    Ok(format!("{}{}", length, payload))
}

/// Reads the four-hex-digit length that prefixes host replies.
pub(crate) async fn read_length<R: AsyncRead + Unpin>(stream: &mut R) -> Result<usize> {
    let mut bytes = [0u8; 4];
    stream.read_exact(&mut bytes).await?;
    let text = std::str::from_utf8(&bytes)?;
    Ok(usize::from_str_radix(text, 16)?)
}

/// Reads a host status tag; FAIL carries a length-prefixed message.
pub(crate) async fn read_host_status<R: AsyncRead + Unpin>(stream: &mut R) -> Result<()> {
    let mut tag = [0u8; 4];
    stream.read_exact(&mut tag).await?;
    match &tag {
        b"OKAY" => Ok(()),
        b"FAIL" => {
            let len = read_length(stream).await?;
            let mut message = vec![0u8; len];
            stream.read_exact(&mut message).await?;
            let message = std::str::from_utf8(&message)?.to_owned();
            if message == "unknown host service" {
                Err(AdbError::OldServer)
            } else {
                Err(AdbError::Server(message))
            }
        }
        _ => Err(AdbError::Protocol(format!(
            "bad host status tag {:?}",
            bstr::BStr::new(&tag)
        ))),
    }
}

/// A connection point for the local adb server, which multiplexes all
/// attached devices.
#[derive(Debug, Clone, PartialEq)]
pub struct Host {
    /// The TCP host to connect to. Defaults to `"localhost"`.
    pub host: Option<String>,
    /// The TCP port to connect to. Defaults to `5037`.
    pub port: Option<u16>,
}

impl Default for Host {
    fn default() -> Host {
        Host {
            host: Some("localhost".to_string()),
            port: Some(5037),
        }
    }
}

impl Host {
    pub async fn connect(&self) -> Result<TcpStream> {
        let addr = format!(
            "{}:{}",
            self.host.clone().unwrap_or_else(|| "localhost".to_owned()),
            self.port.unwrap_or(5037)
        );
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(AdbError::ServerUnreachable)?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Sends one enveloped command and consumes its status; the stream
    /// is returned for commands that keep talking afterwards.
    async fn send(&self, command: &str) -> Result<TcpStream> {
        let mut stream = self.connect().await?;
        trace!("host: >> {:?}", command);
        stream
            .write_all(encode_message(command)?.as_bytes())
            .await?;
        read_host_status(&mut stream).await?;
        Ok(stream)
    }

    /// Sends one command and reads its hex4-length-prefixed reply body.
    async fn request(&self, command: &str) -> Result<Vec<u8>> {
        let mut stream = self.send(command).await?;
        let len = read_length(&mut stream).await?;
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await?;
        trace!("host: << {:?}", bstr::BStr::new(&body));
        Ok(body)
    }

    /// Reports the server's protocol version.
    pub async fn version(&self) -> Result<u32> {
        let body = self.request("host:version").await?;
        let text = std::str::from_utf8(&body)?;
        Ok(u32::from_str_radix(text, 16)?)
    }

    /// Enumerates known devices, one per non-empty reply line.
    pub async fn devices(&self) -> Result<Vec<AdbDevice>> {
        let body = self.request("host:devices-l").await?;
        let text = std::str::from_utf8(&body)?;
        Ok(text
            .lines()
            .filter(|line| !line.is_empty())
            .filter_map(|line| parse_device_line(self, line))
            .collect())
    }

    /// Terminates the local adb server.
    pub async fn kill(&self) -> Result<()> {
        self.send("host:kill").await?;
        Ok(())
    }

    /// Blocks until a device of the given kind is ready. The server
    /// acknowledges the command at once and sends a second OKAY when a
    /// device shows up.
    pub async fn wait_for_device(&self, kind: DeviceKind) -> Result<()> {
        let mut stream = self
            .send(&format!("host:wait-for-{}", kind.as_str()))
            .await?;
        read_host_status(&mut stream).await
    }

    /// Switches a fresh connection into device-attached mode; every
    /// byte written afterwards goes to the device.
    pub async fn transport(&self, id: &str) -> Result<TcpStream> {
        self.send(&format!("host:transport:{}", id)).await
    }

    /// Spawns the adb binary to get a server running. The protocol has
    /// no way to do this: there is nothing listening yet.
    pub async fn start_server(&self, adb_path: Option<&str>) -> Result<()> {
        let adb_path = adb_path.unwrap_or("adb");
        let mut command = Command::new(adb_path);
        command
            .arg("-H")
            .arg(self.host.clone().unwrap_or("localhost".to_owned()));
        command.arg("-P").arg(self.port.unwrap_or(5037).to_string());
        command.arg("start-server");
        if command.status().await?.success() {
            Ok(())
        } else {
            Err(AdbError::Server("failed to start adb server".to_owned()))
        }
    }
}

fn parse_device_line(host: &Host, line: &str) -> Option<AdbDevice> {
    // Turn "serial state [devpath] [notes...]" into an `AdbDevice`.
    let mut fields = line.split_whitespace();
    let serial = fields.next()?;
    let state = fields.next()?;
    let devpath = fields.next().unwrap_or("");
    let notes = fields.collect::<Vec<_>>().join(" ");
    Some(AdbDevice {
        host: host.clone(),
        serial: serial.to_owned(),
        state: state.into(),
        devpath: devpath.to_owned(),
        notes,
        mtime_works: OnceCell::new(),
    })
}

const MTIME_PROBE: &str = "df_test_mtime() {
  if touch -t 01010101 /sdcard/_test_mtime; then echo OKAY; else echo FAIL; fi
  rm -f /sdcard/_test_mtime
}
df_test_mtime";

/// A client for one specific device.
#[derive(Debug, Clone)]
pub struct AdbDevice {
    /// The server that owns this device's transport.
    pub host: Host,
    pub serial: String,
    pub state: DeviceState,
    /// Transport qualifier; may be empty.
    pub devpath: String,
    /// Free-form trailer from the device listing.
    pub notes: String,
    mtime_works: OnceCell<bool>,
}

impl AdbDevice {
    /// The identifier used to pick this device's transport. The
    /// devpath is the more specific of the two when present.
    pub fn transport_id(&self) -> &str {
        if self.devpath.is_empty() {
            &self.serial
        } else {
            &self.devpath
        }
    }

    pub(crate) async fn connect(&self) -> Result<TcpStream> {
        self.host.transport(self.transport_id()).await
    }

    async fn send(&self, command: &str) -> Result<TcpStream> {
        let mut stream = self.connect().await?;
        trace!("device {}: >> {:?}", self.serial, command);
        stream
            .write_all(encode_message(command)?.as_bytes())
            .await?;
        read_host_status(&mut stream).await?;
        Ok(stream)
    }

    /// Runs *command* in a shell on the device, streaming combined
    /// stdout and stderr into *sink* until the command exits.
    pub async fn shell<W: AsyncWrite + Unpin>(&self, command: &str, sink: &mut W) -> Result<()> {
        debug!("shell: {}", command);
        let mut stream = self.send(&format!("shell:{}", command)).await?;
        tokio::io::copy(&mut stream, sink).await?;
        Ok(())
    }

    /// Buffered [`AdbDevice::shell`].
    pub async fn simple_shell(&self, command: &str) -> Result<Vec<u8>> {
        let mut output = Vec::new();
        self.shell(command, &mut output).await?;
        trace!("shell: << {:?}", bstr::BStr::new(&output));
        Ok(output)
    }

    /// Refreshes and returns the cached connection state.
    pub async fn get_state(&mut self) -> Result<DeviceState> {
        let body = self
            .host
            .request(&format!("host-serial:{}:get-state", self.serial))
            .await?;
        self.state = DeviceState::from(std::str::from_utf8(&body)?.trim());
        Ok(self.state)
    }

    /// Blocks until this device is in the running state.
    pub async fn wait_until_running(&mut self) -> Result<()> {
        let mut stream = self
            .host
            .send(&format!("host-serial:{}:wait-for-device", self.serial))
            .await?;
        // A second OKAY arrives once the device is ready.
        read_host_status(&mut stream).await?;
        self.state = DeviceState::Device;
        Ok(())
    }

    /// Whether this Android build honors mtimes on /sdcard. Many
    /// builds silently discard `utimes` there, which is why the mirror
    /// database tracks local mtimes instead. The probe runs once per
    /// device and is cached.
    pub async fn does_mtime_work(&self) -> Result<bool> {
        if let Some(cached) = self.mtime_works.get() {
            return Ok(*cached);
        }
        let output = self.simple_shell(MTIME_PROBE).await?;
        // Only the presence of the marker matters.
        let works = output.windows(4).any(|w| w == b"OKAY");
        let _ = self.mtime_works.set(works);
        Ok(works)
    }

    /// Returns /system/build.prop as a map. Malformed lines are
    /// ignored.
    pub async fn build_props(&self) -> Result<BTreeMap<String, String>> {
        let output = self.simple_shell("cat /system/build.prop").await?;
        Ok(parse_build_props(&String::from_utf8_lossy(&output)))
    }

    /// Streams the device log into *sink*, filtered by *tags* (the
    /// ANDROID_LOG_TAGS syntax; empty for everything).
    pub async fn logcat<W: AsyncWrite + Unpin>(&self, sink: &mut W, tags: &str) -> Result<()> {
        self.shell(
            &format!("export ANDROID_LOG_TAGS=\"{}\" ; exec logcat", tags),
            sink,
        )
        .await
    }
}

fn parse_build_props(text: &str) -> BTreeMap<String, String> {
    let mut props = BTreeMap::new();
    for line in text.lines() {
        if let Some((key, value)) = line.trim().split_once('=') {
            props.insert(key.to_owned(), value.to_owned());
        }
    }
    props
}

/// Enumerates the devices known to the default local server.
pub async fn list_devices() -> Result<Vec<AdbDevice>> {
    Host::default().devices().await
}

/// Blocks until the default local server reports a ready device.
pub async fn wait_for_device(kind: DeviceKind) -> Result<()> {
    Host::default().wait_for_device(kind).await
}

#[cfg(unix)]
pub(crate) fn local_file_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    meta.mode()
}

#[cfg(not(unix))]
pub(crate) fn local_file_mode(meta: &std::fs::Metadata) -> u32 {
    if meta.is_dir() {
        wire::S_IFDIR | 0o755
    } else {
        wire::S_IFREG | 0o644
    }
}

pub(crate) fn local_file_mtime(meta: &std::fs::Metadata) -> u32 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| (d.as_secs() & 0xFFFF_FFFF) as u32)
        .unwrap_or(0)
}
