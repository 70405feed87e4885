//! Protocol-version exchange performed once per connection.
//!
//! The first frame in each direction carries JSON rather than an envelope:
//! the client sends a [`HandshakeRequest`], the daemon answers with a
//! [`HandshakeResponse`]. A daemon that cannot serve the client still answers
//! (with `accepted: false`) before closing, so the client reports
//! [`CourierError::IncompatibleProtocol`] rather than a bare disconnect.

use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use courier_frame::{FrameConfig, FrameError, FrameReader, FrameWriter};
use courier_transport::IpcStream;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CourierError, Result};

const MAX_PROTOCOL_LEN: usize = 32;
const MAX_VERSION_LEN: usize = 16;

/// Client handshake request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// Protocol name. `courier` by default.
    pub protocol: String,
    /// Protocol version as `<major>.<minor>`.
    pub version: String,
}

/// Daemon handshake response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub protocol: String,
    pub version: String,
    /// Daemon-assigned identifier, for correlating logs on both sides.
    pub connection_id: u64,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Result of a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResult {
    pub connection_id: u64,
    /// Version announced by the other side.
    pub peer_version: String,
}

/// Configuration for handshake negotiation.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Timeout for each blocking handshake operation.
    pub timeout: Duration,
    /// Expected protocol name.
    pub protocol_name: String,
    /// Local protocol version.
    pub protocol_version: String,
    /// Maximum handshake frame payload size in bytes.
    pub max_handshake_payload: usize,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            protocol_name: "courier".to_string(),
            protocol_version: "1.0".to_string(),
            max_handshake_payload: 16 * 1024,
        }
    }
}

impl HandshakeConfig {
    /// Frame limits in force until the handshake completes.
    pub fn frame_config(&self) -> FrameConfig {
        FrameConfig {
            max_payload_size: self.max_handshake_payload,
            read_timeout: Some(self.timeout),
            write_timeout: Some(self.timeout),
        }
    }

    fn label(&self) -> String {
        format!("{}/{}", self.protocol_name, self.protocol_version)
    }
}

/// Perform client-side handshake using default configuration.
pub fn handshake_client<R: Read, W: Write>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
) -> Result<HandshakeResult> {
    handshake_client_with_config(reader, writer, &HandshakeConfig::default())
}

/// Perform client-side handshake using explicit configuration.
pub fn handshake_client_with_config<R: Read, W: Write>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    config: &HandshakeConfig,
) -> Result<HandshakeResult> {
    validate_protocol_name(&config.protocol_name)?;
    validate_version(&config.protocol_version)?;

    let req = HandshakeRequest {
        protocol: config.protocol_name.clone(),
        version: config.protocol_version.clone(),
    };
    send_json(writer, &req)?;

    let payload = recv_payload(reader, config)?;
    let resp: HandshakeResponse = serde_json::from_slice(&payload)?;

    validate_protocol_name(&resp.protocol)?;
    validate_version(&resp.version)?;
    let remote = format!("{}/{}", resp.protocol, resp.version);

    if !resp.accepted {
        debug!(
            remote = %remote,
            reason = resp.reason.as_deref().unwrap_or(""),
            "daemon rejected handshake"
        );
        return Err(CourierError::IncompatibleProtocol {
            local: config.label(),
            remote,
        });
    }

    if resp.protocol != config.protocol_name
        || !is_version_compatible(&config.protocol_version, &resp.version)?
    {
        return Err(CourierError::IncompatibleProtocol {
            local: config.label(),
            remote,
        });
    }

    Ok(HandshakeResult {
        connection_id: resp.connection_id,
        peer_version: resp.version,
    })
}

/// Perform server-side handshake using default configuration.
pub fn handshake_server<R: Read, W: Write>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    connection_id: u64,
) -> Result<HandshakeResult> {
    handshake_server_with_config(reader, writer, connection_id, &HandshakeConfig::default())
}

/// Perform server-side handshake using explicit configuration.
pub fn handshake_server_with_config<R: Read, W: Write>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    connection_id: u64,
    config: &HandshakeConfig,
) -> Result<HandshakeResult> {
    validate_protocol_name(&config.protocol_name)?;
    validate_version(&config.protocol_version)?;

    let payload = recv_payload(reader, config)?;
    let req: HandshakeRequest = serde_json::from_slice(&payload)?;

    validate_protocol_name(&req.protocol)?;
    validate_version(&req.version)?;
    let remote = format!("{}/{}", req.protocol, req.version);

    let rejection = if req.protocol != config.protocol_name {
        Some(format!(
            "unknown protocol '{}' (expected '{}')",
            req.protocol, config.protocol_name
        ))
    } else if !is_version_compatible(&req.version, &config.protocol_version)? {
        Some(format!(
            "incompatible version '{}' (server '{}')",
            req.version, config.protocol_version
        ))
    } else {
        None
    };

    let resp = HandshakeResponse {
        protocol: config.protocol_name.clone(),
        version: config.protocol_version.clone(),
        connection_id,
        accepted: rejection.is_none(),
        reason: rejection.clone(),
    };
    send_json(writer, &resp)?;

    if let Some(reason) = rejection {
        debug!(connection_id, remote = %remote, reason = %reason, "rejected handshake");
        return Err(CourierError::IncompatibleProtocol {
            local: config.label(),
            remote,
        });
    }

    Ok(HandshakeResult {
        connection_id,
        peer_version: req.version,
    })
}

/// Frame `stream` under handshake limits, run `exchange`, then switch both
/// halves to `runtime`.
pub(crate) fn framed_handshake<F>(
    stream: IpcStream,
    config: &HandshakeConfig,
    runtime: &FrameConfig,
    exchange: F,
) -> Result<(FrameReader<IpcStream>, FrameWriter<IpcStream>, HandshakeResult)>
where
    F: FnOnce(&mut FrameReader<IpcStream>, &mut FrameWriter<IpcStream>) -> Result<HandshakeResult>,
{
    let reader_stream = stream.try_clone()?;
    let mut reader = FrameReader::with_config_ipc(reader_stream, config.frame_config())?;
    let mut writer = FrameWriter::with_config_ipc(stream, config.frame_config())?;

    let result = exchange(&mut reader, &mut writer)?;

    reader.set_max_payload_size(runtime.max_payload_size);
    reader.set_read_timeout(runtime.read_timeout)?;
    writer.set_max_payload_size(runtime.max_payload_size);
    writer.set_write_timeout(runtime.write_timeout)?;
    Ok((reader, writer, result))
}

fn send_json<T: Serialize, W: Write>(writer: &mut FrameWriter<W>, value: &T) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    writer.send(&payload)?;
    Ok(())
}

fn recv_payload<R: Read>(reader: &mut FrameReader<R>, config: &HandshakeConfig) -> Result<Vec<u8>> {
    let deadline = Instant::now() + config.timeout;
    loop {
        if Instant::now() >= deadline {
            return Err(CourierError::Timeout(config.timeout));
        }

        match reader.read_frame() {
            Ok(frame) => {
                if frame.payload.len() > config.max_handshake_payload {
                    return Err(CourierError::HandshakeFailed(format!(
                        "handshake payload too large: {} (max {})",
                        frame.payload.len(),
                        config.max_handshake_payload
                    )));
                }
                return Ok(frame.payload.to_vec());
            }
            Err(FrameError::Io(err))
                if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(FrameError::ConnectionClosed) => {
                return Err(CourierError::HandshakeFailed(
                    "connection closed during handshake".to_string(),
                ));
            }
            Err(FrameError::FrameTooLarge { size, max }) => {
                return Err(CourierError::HandshakeFailed(format!(
                    "handshake payload too large: {size} (max {max})"
                )));
            }
            Err(err) => return Err(CourierError::Frame(err)),
        }
    }
}

fn validate_protocol_name(protocol: &str) -> Result<()> {
    if protocol.is_empty() || protocol.len() > MAX_PROTOCOL_LEN {
        return Err(CourierError::HandshakeFailed(format!(
            "invalid protocol name length: {}",
            protocol.len()
        )));
    }
    Ok(())
}

fn validate_version(version: &str) -> Result<()> {
    if version.is_empty() || version.len() > MAX_VERSION_LEN {
        return Err(CourierError::HandshakeFailed(format!(
            "invalid protocol version length: {}",
            version.len()
        )));
    }
    let _ = parse_version(version)?;
    Ok(())
}

/// Same major, and the client is at least as new as the daemon's minor.
fn is_version_compatible(client_version: &str, server_version: &str) -> Result<bool> {
    let (client_major, client_minor) = parse_version(client_version)?;
    let (server_major, server_minor) = parse_version(server_version)?;

    Ok(client_major == server_major && client_minor >= server_minor)
}

fn parse_version(version: &str) -> Result<(u16, u16)> {
    let invalid = |what: &str| {
        CourierError::HandshakeFailed(format!("invalid version '{version}': {what}"))
    };

    let (major, minor) = version
        .split_once('.')
        .ok_or_else(|| invalid("expected '<major>.<minor>'"))?;
    if minor.contains('.') {
        return Err(invalid("expected '<major>.<minor>'"));
    }

    let major = major.parse::<u16>().map_err(|_| invalid("non-numeric major"))?;
    let minor = minor.parse::<u16>().map_err(|_| invalid("non-numeric minor"))?;
    Ok((major, minor))
}
