use std::io::{Read, Write};
use std::net::Shutdown;
use std::time::Duration;

use crate::error::Result;

/// A connected IPC stream: implements Read + Write.
///
/// This is the fundamental I/O type returned by transport operations.
/// On Unix, this wraps a Unix domain socket stream.
pub struct IpcStream {
    inner: IpcStreamInner,
}

enum IpcStreamInner {
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
}

impl Read for IpcStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for IpcStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.flush(),
        }
    }
}

impl IpcStream {
    /// Create an IpcStream from a Unix domain socket stream.
    #[cfg(unix)]
    pub(crate) fn from_unix(stream: std::os::unix::net::UnixStream) -> Self {
        Self {
            inner: IpcStreamInner::Unix(stream),
        }
    }

    /// Create a connected pair of anonymous streams.
    #[cfg(unix)]
    pub fn pair() -> Result<(Self, Self)> {
        let (left, right) = std::os::unix::net::UnixStream::pair()?;
        Ok((Self::from_unix(left), Self::from_unix(right)))
    }

    /// Set read timeout on the underlying stream.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.set_read_timeout(timeout).map_err(Into::into),
        }
    }

    /// Set write timeout on the underlying stream.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.set_write_timeout(timeout).map_err(Into::into),
        }
    }

    /// Shut down one or both halves of the stream.
    ///
    /// Every clone of the stream observes the shutdown, which is how a blocked
    /// reader on another thread is woken up. Shutting down an already
    /// disconnected stream is not an error.
    pub fn shutdown(&self, how: Shutdown) -> Result<()> {
        let result = match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.shutdown(how),
        };
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Try to clone this stream (creates a new file descriptor).
    pub fn try_clone(&self) -> Result<Self> {
        match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => {
                let cloned = stream.try_clone()?;
                Ok(Self::from_unix(cloned))
            }
        }
    }

    /// Get the credentials of the connected peer (Linux only).
    ///
    /// Returns `(uid, gid, pid)` via `SO_PEERCRED`, or `None` if unavailable.
    #[cfg(target_os = "linux")]
    pub fn peer_credentials(&self) -> Option<(u32, u32, u32)> {
        use std::os::fd::AsRawFd;

        let fd = match &self.inner {
            IpcStreamInner::Unix(stream) => stream.as_raw_fd(),
        };

        let mut cred = libc::ucred {
            pid: 0,
            uid: 0,
            gid: 0,
        };
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

        // SAFETY: `cred` and `len` are valid writable pointers for the provided sizes,
        // and `fd` is an open Unix socket descriptor owned by this process.
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                (&mut cred as *mut libc::ucred).cast::<libc::c_void>(),
                &mut len,
            )
        };

        if rc == 0 && len as usize == std::mem::size_of::<libc::ucred>() {
            Some((cred.uid, cred.gid, cred.pid as u32))
        } else {
            None
        }
    }

    /// Get the credentials of the connected peer.
    ///
    /// Returns `None` on platforms that do not expose peer credentials.
    #[cfg(not(target_os = "linux"))]
    pub fn peer_credentials(&self) -> Option<(u32, u32, u32)> {
        None
    }
}

impl std::fmt::Debug for IpcStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(_) => f.debug_struct("IpcStream").field("type", &"unix").finish(),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn shutdown_wakes_blocked_reader_clone() {
        let (left, _right) = IpcStream::pair().unwrap();
        let mut reader = left.try_clone().unwrap();

        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 8];
            reader.read(&mut buf).unwrap()
        });

        std::thread::sleep(Duration::from_millis(20));
        left.shutdown(Shutdown::Both).unwrap();

        assert_eq!(handle.join().unwrap(), 0);
    }

    #[test]
    fn shutdown_twice_is_not_an_error() {
        let (left, right) = IpcStream::pair().unwrap();
        drop(right);
        left.shutdown(Shutdown::Both).unwrap();
        left.shutdown(Shutdown::Both).unwrap();
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn peer_credentials_report_own_process() {
        let (left, _right) = IpcStream::pair().unwrap();
        let (_, _, pid) = left.peer_credentials().expect("credentials on linux");
        assert_eq!(pid, std::process::id());
    }
}
