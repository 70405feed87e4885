use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use courier_frame::{FrameReader, FrameWriter};
use courier_transport::{IpcStream, UnixDomainSocket};

use crate::handshake::handshake_server;

/// A socket path in a fresh directory, removed on drop.
pub(crate) struct TempSocket {
    dir: PathBuf,
    path: PathBuf,
}

impl TempSocket {
    pub(crate) fn new(tag: &str) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos();
        let dir = PathBuf::from(format!("/tmp/courier-{tag}-{}-{nanos}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
        let path = dir.join("d.sock");
        Self { dir, path }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempSocket {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

/// Accept one client and complete the daemon half of the handshake.
pub(crate) fn accept_handshaken(
    listener: &UnixDomainSocket,
    connection_id: u64,
) -> (FrameReader<IpcStream>, FrameWriter<IpcStream>) {
    let stream = listener.accept().expect("accept should succeed");
    let mut reader = FrameReader::new(stream.try_clone().expect("stream should clone"));
    let mut writer = FrameWriter::new(stream);
    handshake_server(&mut reader, &mut writer, connection_id).expect("handshake should succeed");
    (reader, writer)
}
