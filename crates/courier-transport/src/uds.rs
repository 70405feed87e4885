use std::io::ErrorKind;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::traits::IpcStream;

/// Unix domain socket endpoint.
///
/// The daemon side binds a filesystem path and accepts connections; clients
/// connect to the same path. The socket file is removed on `Drop` as long as
/// it is still the one this listener created.
pub struct UnixDomainSocket {
    listener: UnixListener,
    path: PathBuf,
    created_inode: Option<(u64, u64)>,
}

impl UnixDomainSocket {
    /// Default permission mode for created socket paths.
    pub const DEFAULT_SOCKET_MODE: u32 = 0o600;
    /// Maximum socket path length.
    /// Unix `sockaddr_un.sun_path` is typically 108 bytes on Linux, 104 on macOS.
    #[cfg(target_os = "linux")]
    const MAX_PATH_LEN: usize = 108;
    #[cfg(target_os = "macos")]
    const MAX_PATH_LEN: usize = 104;
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    const MAX_PATH_LEN: usize = 104;

    /// Bind and listen on a filesystem-path Unix domain socket.
    ///
    /// A stale socket file left behind by a dead daemon is removed first. If a
    /// live daemon still answers on the path, binding fails with
    /// [`TransportError::AddressInUse`].
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        Self::bind_with_mode(path, Self::DEFAULT_SOCKET_MODE)
    }

    /// Bind and listen on a filesystem-path Unix domain socket with explicit mode.
    pub fn bind_with_mode(path: impl AsRef<Path>, mode: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let path_bytes = path.as_os_str().len();
        if path_bytes >= Self::MAX_PATH_LEN {
            return Err(TransportError::PathTooLong {
                path,
                len: path_bytes,
                max: Self::MAX_PATH_LEN,
            });
        }

        // Never remove non-socket files, and never steal a live daemon's path.
        if let Ok(metadata) = std::fs::symlink_metadata(&path) {
            if !metadata.file_type().is_socket() {
                return Err(TransportError::Bind {
                    path: path.clone(),
                    source: std::io::Error::new(
                        ErrorKind::AlreadyExists,
                        "existing path is not a unix socket",
                    ),
                });
            }
            if UnixStream::connect(&path).is_ok() {
                return Err(TransportError::AddressInUse { path });
            }
            debug!(?path, "removing stale socket");
            std::fs::remove_file(&path).map_err(|e| TransportError::Bind {
                path: path.clone(),
                source: e,
            })?;
        }

        let listener = UnixListener::bind(&path).map_err(|e| {
            if e.kind() == ErrorKind::AddrInUse {
                TransportError::AddressInUse { path: path.clone() }
            } else {
                TransportError::Bind {
                    path: path.clone(),
                    source: e,
                }
            }
        })?;

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).map_err(|e| {
            TransportError::Bind {
                path: path.clone(),
                source: e,
            }
        })?;
        let created_metadata =
            std::fs::symlink_metadata(&path).map_err(|e| TransportError::Bind {
                path: path.clone(),
                source: e,
            })?;
        let created_inode = Some((created_metadata.dev(), created_metadata.ino()));

        info!(?path, "listening on unix domain socket");

        Ok(Self {
            listener,
            path,
            created_inode,
        })
    }

    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> Result<IpcStream> {
        let (stream, _addr) = self.listener.accept().map_err(TransportError::Accept)?;
        debug!("accepted connection");
        Ok(IpcStream::from_unix(stream))
    }

    /// Connect to a listening Unix domain socket (blocking).
    pub fn connect(path: impl AsRef<Path>) -> Result<IpcStream> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).map_err(|e| TransportError::Connect {
            path: path.to_path_buf(),
            source: e,
        })?;
        debug!(?path, "connected to unix domain socket");
        Ok(IpcStream::from_unix(stream))
    }

    /// The path this socket is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for UnixDomainSocket {
    fn drop(&mut self) {
        if let Some((expected_dev, expected_ino)) = self.created_inode {
            if let Ok(metadata) = std::fs::symlink_metadata(&self.path) {
                if metadata.file_type().is_socket()
                    && metadata.dev() == expected_dev
                    && metadata.ino() == expected_ino
                {
                    debug!(path = ?self.path, "cleaning up socket file");
                    let _ = std::fs::remove_file(&self.path);
                } else {
                    debug!(
                        path = ?self.path,
                        "socket path identity changed; skipping cleanup"
                    );
                }
            }
        }
    }
}
