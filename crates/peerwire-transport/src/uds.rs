use std::io;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::stream::PeerStream;

/// `sockaddr_un.sun_path` capacity, terminating NUL included.
#[cfg(target_os = "linux")]
const SUN_PATH_CAPACITY: usize = 108;
#[cfg(not(target_os = "linux"))]
const SUN_PATH_CAPACITY: usize = 104;

/// Device and inode of the socket file a listener created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SocketIdentity {
    dev: u64,
    ino: u64,
}

impl SocketIdentity {
    fn of(metadata: &std::fs::Metadata) -> Self {
        Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        }
    }
}

/// Unix domain socket listener.
///
/// Binds a filesystem-path socket, replacing a stale socket file if one is
/// left over, and removes the path again on `Drop` as long as it still refers
/// to the socket this listener created.
///
/// Must be created from within a tokio runtime.
pub struct UnixDomainSocket {
    listener: UnixListener,
    path: PathBuf,
    identity: SocketIdentity,
}

impl UnixDomainSocket {
    /// Owner read/write only.
    pub const DEFAULT_SOCKET_MODE: u32 = 0o600;

    /// Bind with [`Self::DEFAULT_SOCKET_MODE`].
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        Self::bind_with_mode(path, Self::DEFAULT_SOCKET_MODE)
    }

    /// Bind and listen with an explicit permission mode.
    pub fn bind_with_mode(path: impl AsRef<Path>, mode: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let len = path.as_os_str().len();
        if len >= SUN_PATH_CAPACITY {
            return Err(TransportError::PathTooLong {
                path,
                len,
                max: SUN_PATH_CAPACITY - 1,
            });
        }

        let bound = clear_stale_socket(&path)
            .and_then(|()| UnixListener::bind(&path))
            .and_then(|listener| {
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))?;
                let identity = SocketIdentity::of(&std::fs::symlink_metadata(&path)?);
                Ok((listener, identity))
            });

        let (listener, identity) = bound.map_err(|source| TransportError::Bind {
            addr: path.display().to_string(),
            source,
        })?;

        info!(?path, mode = format_args!("{mode:o}"), "listening on unix domain socket");
        Ok(Self {
            listener,
            path,
            identity,
        })
    }

    /// Accept an incoming connection.
    pub async fn accept(&self) -> Result<PeerStream> {
        let (stream, _addr) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::Accept)?;
        debug!(path = ?self.path, "accepted unix connection");
        Ok(PeerStream::from_unix(stream))
    }

    /// Connect to a listening Unix domain socket.
    pub async fn connect(path: impl AsRef<Path>) -> Result<PeerStream> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path)
            .await
            .map_err(|source| TransportError::Connect {
                addr: path.display().to_string(),
                source,
            })?;
        debug!(?path, "connected to unix domain socket");
        Ok(PeerStream::from_unix(stream))
    }

    /// The path this socket is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Remove a socket file left behind by an earlier listener. Any other kind of
/// file at `path` is an error and is left untouched.
fn clear_stale_socket(path: &Path) -> io::Result<()> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };

    if !metadata.file_type().is_socket() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "existing path is not a unix socket",
        ));
    }
    debug!(?path, "removing stale socket");
    std::fs::remove_file(path)
}

impl Drop for UnixDomainSocket {
    fn drop(&mut self) {
        let Ok(metadata) = std::fs::symlink_metadata(&self.path) else {
            return;
        };
        if metadata.file_type().is_socket() && SocketIdentity::of(&metadata) == self.identity {
            debug!(path = ?self.path, "removing socket file");
            let _ = std::fs::remove_file(&self.path);
        } else {
            debug!(path = ?self.path, "socket path was replaced; leaving it in place");
        }
    }
}
