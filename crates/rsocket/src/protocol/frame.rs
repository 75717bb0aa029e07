//! RSocket frame model and binary encoding.

use crate::error::ProtocolError;

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Protocol major version spoken by this crate.
pub const MAJOR_VERSION: u16 = 1;

/// Protocol minor version spoken by this crate.
pub const MINOR_VERSION: u16 = 0;

/// Stream id (4 bytes) plus frame type and flags (2 bytes).
pub const FRAME_HEADER_SIZE: usize = 6;

/// Largest metadata block expressible with a 24-bit length.
pub const MAX_METADATA_SIZE: usize = 0xFF_FFFF;

const STREAM_ID_MASK: u32 = 0x7FFF_FFFF;
const FLAGS_MASK: u16 = 0x03FF;
const FRAME_TYPE_SHIFT: u16 = 10;

/// Frame header flags.
pub mod flag {
    /// Frame may be ignored if not understood.
    pub const IGNORE: u16 = 0x200;
    /// Frame carries metadata.
    pub const METADATA: u16 = 0x100;
    /// More fragments follow this one.
    pub const FOLLOWS: u16 = 0x80;
    /// KEEPALIVE asks the peer to answer.
    pub const RESPOND: u16 = 0x80;
    /// SETUP carries a resume token.
    pub const RESUME_ENABLE: u16 = 0x80;
    /// SETUP asks for lease semantics.
    pub const LEASE: u16 = 0x40;
}

/// Type of frame being sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Connection setup.
    Setup = 0x01,
    /// Lease grant.
    Lease = 0x02,
    /// Connection liveness probe.
    KeepAlive = 0x03,
    /// Single request, single response.
    RequestResponse = 0x04,
    /// Single request, no response.
    RequestFnf = 0x05,
    /// Single request, stream of responses.
    RequestStream = 0x06,
    /// Bidirectional stream.
    RequestChannel = 0x07,
    /// Flow-control credit.
    RequestN = 0x08,
    /// Stream cancellation.
    Cancel = 0x09,
    /// Stream payload.
    Payload = 0x0A,
    /// Connection or stream error.
    Error = 0x0B,
    /// Connection-level metadata.
    MetadataPush = 0x0C,
    /// Session resumption.
    Resume = 0x0D,
    /// Session resumption accepted.
    ResumeOk = 0x0E,
    /// Extension frame.
    Ext = 0x3F,
}

impl TryFrom<u8> for FrameType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x01 => Ok(Self::Setup),
            0x02 => Ok(Self::Lease),
            0x03 => Ok(Self::KeepAlive),
            0x04 => Ok(Self::RequestResponse),
            0x05 => Ok(Self::RequestFnf),
            0x06 => Ok(Self::RequestStream),
            0x07 => Ok(Self::RequestChannel),
            0x08 => Ok(Self::RequestN),
            0x09 => Ok(Self::Cancel),
            0x0A => Ok(Self::Payload),
            0x0B => Ok(Self::Error),
            0x0C => Ok(Self::MetadataPush),
            0x0D => Ok(Self::Resume),
            0x0E => Ok(Self::ResumeOk),
            0x3F => Ok(Self::Ext),
            _ => Err(ProtocolError::UnknownFrameType(value)),
        }
    }
}

/// Error codes carried by ERROR frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    /// SETUP frame was malformed.
    pub const INVALID_SETUP: Self = Self(0x0000_0001);
    /// SETUP asked for something the server does not support.
    pub const UNSUPPORTED_SETUP: Self = Self(0x0000_0002);
    /// Server refused the SETUP, typically on authentication.
    pub const REJECTED_SETUP: Self = Self(0x0000_0003);
    /// Server refused a resume attempt.
    pub const REJECTED_RESUME: Self = Self(0x0000_0004);
    /// Connection is being terminated because of a protocol error.
    pub const CONNECTION_ERROR: Self = Self(0x0000_0101);
    /// Connection is being closed gracefully.
    pub const CONNECTION_CLOSE: Self = Self(0x0000_0102);
    /// Application layer failure on a stream.
    pub const APPLICATION_ERROR: Self = Self(0x0000_0201);
    /// Request was rejected before processing.
    pub const REJECTED: Self = Self(0x0000_0202);
    /// Request was cancelled.
    pub const CANCELED: Self = Self(0x0000_0203);
    /// Request was invalid.
    pub const INVALID: Self = Self(0x0000_0204);

    /// Whether the code terminates the whole connection rather than one stream.
    #[must_use]
    pub const fn is_connection_error(self) -> bool {
        self.0 < 0x0000_0200
    }
}

/// Metadata and data of a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    /// Optional metadata block, usually composite metadata.
    pub metadata: Option<Bytes>,
    /// Application data.
    pub data: Bytes,
}

impl Payload {
    /// Create a payload.
    #[must_use]
    pub const fn new(metadata: Option<Bytes>, data: Bytes) -> Self {
        Self { metadata, data }
    }
}

/// Contents of a SETUP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Setup {
    /// Protocol major version.
    pub major_version: u16,
    /// Protocol minor version.
    pub minor_version: u16,
    /// Interval between client KEEPALIVE frames.
    pub keepalive_interval: Duration,
    /// Time without KEEPALIVE after which the server may drop the client.
    pub max_lifetime: Duration,
    /// Resume token, if the client supports resumption.
    pub resume_token: Option<Bytes>,
    /// Whether the client honors leases.
    pub lease: bool,
    /// MIME type of payload metadata on this connection.
    pub metadata_mime: String,
    /// MIME type of payload data on this connection.
    pub data_mime: String,
    /// Setup payload, carrying authentication metadata.
    pub payload: Payload,
}

impl Setup {
    /// Create a SETUP for the current protocol version.
    #[must_use]
    pub fn new(
        metadata_mime: impl Into<String>,
        data_mime: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            major_version: MAJOR_VERSION,
            minor_version: MINOR_VERSION,
            keepalive_interval: Duration::from_secs(20),
            max_lifetime: Duration::from_secs(90),
            resume_token: None,
            lease: false,
            metadata_mime: metadata_mime.into(),
            data_mime: data_mime.into(),
            payload,
        }
    }

    /// Set the keepalive interval and max lifetime.
    #[must_use]
    pub const fn with_keepalive(mut self, interval: Duration, max_lifetime: Duration) -> Self {
        self.keepalive_interval = interval;
        self.max_lifetime = max_lifetime;
        self
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Connection setup, always the first frame from a client.
    Setup(Setup),

    /// Liveness probe.
    KeepAlive {
        /// Whether the receiver must answer.
        respond: bool,
        /// Resume position of the sender.
        last_received_position: u64,
        /// Opaque data echoed back in the answer.
        data: Bytes,
    },

    /// Fire-and-forget request.
    RequestFnf {
        /// Stream id chosen by the requester.
        stream_id: u32,
        /// Request payload.
        payload: Payload,
    },

    /// Connection or stream error.
    Error {
        /// Stream id, zero for connection errors.
        stream_id: u32,
        /// Error code.
        code: ErrorCode,
        /// Human readable reason.
        message: String,
    },

    /// A frame this transport recognizes but does not act on, or an unknown
    /// frame flagged as ignorable.
    Unsupported {
        /// Stream id of the frame.
        stream_id: u32,
        /// Raw frame type.
        frame_type: u8,
    },
}

impl Frame {
    /// Build a connection-level ERROR frame.
    #[must_use]
    pub fn connection_error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            stream_id: 0,
            code,
            message: message.into(),
        }
    }

    /// Encode the frame, without the transport length prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if a field does not fit its wire representation.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.body_size_hint());

        match self {
            Self::Setup(setup) => {
                let mut flags = 0;
                if setup.payload.metadata.is_some() {
                    flags |= flag::METADATA;
                }
                if setup.resume_token.is_some() {
                    flags |= flag::RESUME_ENABLE;
                }
                if setup.lease {
                    flags |= flag::LEASE;
                }

                put_header(&mut buf, 0, FrameType::Setup, flags);
                buf.put_u16(setup.major_version);
                buf.put_u16(setup.minor_version);
                buf.put_u32(millis(setup.keepalive_interval));
                buf.put_u32(millis(setup.max_lifetime));

                if let Some(token) = &setup.resume_token {
                    let len = u16::try_from(token.len()).map_err(|_| {
                        ProtocolError::InvalidFrame("resume token too long".to_string())
                    })?;
                    buf.put_u16(len);
                    buf.put_slice(token);
                }

                put_mime(&mut buf, &setup.metadata_mime)?;
                put_mime(&mut buf, &setup.data_mime)?;
                put_payload(&mut buf, &setup.payload)?;
            }
            Self::KeepAlive {
                respond,
                last_received_position,
                data,
            } => {
                let flags = if *respond { flag::RESPOND } else { 0 };
                put_header(&mut buf, 0, FrameType::KeepAlive, flags);
                buf.put_u64(last_received_position & 0x7FFF_FFFF_FFFF_FFFF);
                buf.put_slice(data);
            }
            Self::RequestFnf { stream_id, payload } => {
                if *stream_id == 0 {
                    return Err(ProtocolError::InvalidFrame(
                        "REQUEST_FNF on stream 0".to_string(),
                    ));
                }

                let flags = if payload.metadata.is_some() {
                    flag::METADATA
                } else {
                    0
                };
                put_header(&mut buf, *stream_id, FrameType::RequestFnf, flags);
                put_payload(&mut buf, payload)?;
            }
            Self::Error {
                stream_id,
                code,
                message,
            } => {
                put_header(&mut buf, *stream_id, FrameType::Error, 0);
                buf.put_u32(code.0);
                buf.put_slice(message.as_bytes());
            }
            Self::Unsupported {
                stream_id,
                frame_type,
            } => {
                return Err(ProtocolError::InvalidFrame(format!(
                    "cannot encode frame type {frame_type:#04x} on stream {stream_id}"
                )));
            }
        }

        Ok(buf.freeze())
    }

    /// Decode a frame, without the transport length prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is truncated, malformed, of an unknown
    /// non-ignorable type, or of an unsupported protocol version.
    #[allow(clippy::cast_possible_truncation)]
    pub fn decode(mut buf: Bytes) -> Result<Self, ProtocolError> {
        need(&buf, FRAME_HEADER_SIZE, "frame header")?;

        let stream_id = buf.get_u32() & STREAM_ID_MASK;
        let type_and_flags = buf.get_u16();
        let raw_type = (type_and_flags >> FRAME_TYPE_SHIFT) as u8;
        let flags = type_and_flags & FLAGS_MASK;

        let frame_type = match FrameType::try_from(raw_type) {
            Ok(frame_type) => frame_type,
            Err(_) if flags & flag::IGNORE != 0 => {
                return Ok(Self::Unsupported {
                    stream_id,
                    frame_type: raw_type,
                });
            }
            Err(e) => return Err(e),
        };

        match frame_type {
            FrameType::Setup => decode_setup(stream_id, flags, buf),
            FrameType::KeepAlive => {
                if stream_id != 0 {
                    return Err(ProtocolError::InvalidFrame(format!(
                        "KEEPALIVE on stream {stream_id}"
                    )));
                }
                need(&buf, 8, "KEEPALIVE position")?;

                Ok(Self::KeepAlive {
                    respond: flags & flag::RESPOND != 0,
                    last_received_position: buf.get_u64() & 0x7FFF_FFFF_FFFF_FFFF,
                    data: buf,
                })
            }
            FrameType::RequestFnf => {
                if stream_id == 0 {
                    return Err(ProtocolError::InvalidFrame(
                        "REQUEST_FNF on stream 0".to_string(),
                    ));
                }
                if flags & flag::FOLLOWS != 0 {
                    return Err(ProtocolError::InvalidFrame(
                        "fragmented payloads are not supported".to_string(),
                    ));
                }

                Ok(Self::RequestFnf {
                    stream_id,
                    payload: get_payload(buf, flags)?,
                })
            }
            FrameType::Error => {
                need(&buf, 4, "ERROR code")?;
                let code = ErrorCode(buf.get_u32());

                Ok(Self::Error {
                    stream_id,
                    code,
                    message: String::from_utf8_lossy(&buf).into_owned(),
                })
            }
            other => Ok(Self::Unsupported {
                stream_id,
                frame_type: other as u8,
            }),
        }
    }

    fn body_size_hint(&self) -> usize {
        match self {
            Self::Setup(setup) => {
                12 + 2
                    + setup.metadata_mime.len()
                    + setup.data_mime.len()
                    + payload_size(&setup.payload)
            }
            Self::KeepAlive { data, .. } => 8 + data.len(),
            Self::RequestFnf { payload, .. } => payload_size(payload),
            Self::Error { message, .. } => 4 + message.len(),
            Self::Unsupported { .. } => 0,
        }
    }
}

fn decode_setup(stream_id: u32, flags: u16, mut buf: Bytes) -> Result<Frame, ProtocolError> {
    if stream_id != 0 {
        return Err(ProtocolError::InvalidFrame(format!(
            "SETUP on stream {stream_id}"
        )));
    }
    need(&buf, 12, "SETUP header")?;

    let major_version = buf.get_u16();
    let minor_version = buf.get_u16();
    if major_version != MAJOR_VERSION {
        return Err(ProtocolError::UnsupportedVersion {
            major: major_version,
            minor: minor_version,
        });
    }

    let keepalive_interval = Duration::from_millis(u64::from(buf.get_u32() & STREAM_ID_MASK));
    let max_lifetime = Duration::from_millis(u64::from(buf.get_u32() & STREAM_ID_MASK));

    let resume_token = if flags & flag::RESUME_ENABLE == 0 {
        None
    } else {
        need(&buf, 2, "resume token length")?;
        let len = usize::from(buf.get_u16());
        need(&buf, len, "resume token")?;
        Some(buf.split_to(len))
    };

    let metadata_mime = get_mime(&mut buf)?;
    let data_mime = get_mime(&mut buf)?;

    Ok(Frame::Setup(Setup {
        major_version,
        minor_version,
        keepalive_interval,
        max_lifetime,
        resume_token,
        lease: flags & flag::LEASE != 0,
        metadata_mime,
        data_mime,
        payload: get_payload(buf, flags)?,
    }))
}

fn need(buf: &Bytes, len: usize, what: &str) -> Result<(), ProtocolError> {
    if buf.remaining() < len {
        return Err(ProtocolError::InvalidFrame(format!(
            "truncated {what}: need {len} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

fn put_header(buf: &mut BytesMut, stream_id: u32, frame_type: FrameType, flags: u16) {
    buf.put_u32(stream_id & STREAM_ID_MASK);
    buf.put_u16((u16::from(frame_type as u8) << FRAME_TYPE_SHIFT) | (flags & FLAGS_MASK));
}

fn put_mime(buf: &mut BytesMut, mime: &str) -> Result<(), ProtocolError> {
    let len = u8::try_from(mime.len())
        .map_err(|_| ProtocolError::InvalidFrame(format!("MIME type too long: {mime}")))?;
    buf.put_u8(len);
    buf.put_slice(mime.as_bytes());
    Ok(())
}

fn get_mime(buf: &mut Bytes) -> Result<String, ProtocolError> {
    need(buf, 1, "MIME length")?;
    let len = usize::from(buf.get_u8());
    need(buf, len, "MIME type")?;

    String::from_utf8(buf.split_to(len).to_vec())
        .map_err(|_| ProtocolError::InvalidFrame("MIME type is not UTF-8".to_string()))
}

fn put_payload(buf: &mut BytesMut, payload: &Payload) -> Result<(), ProtocolError> {
    if let Some(metadata) = &payload.metadata {
        if metadata.len() > MAX_METADATA_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: metadata.len(),
                max: MAX_METADATA_SIZE,
            });
        }
        buf.put_uint(metadata.len() as u64, 3);
        buf.put_slice(metadata);
    }
    buf.put_slice(&payload.data);
    Ok(())
}

#[allow(clippy::cast_possible_truncation)]
fn get_payload(mut buf: Bytes, flags: u16) -> Result<Payload, ProtocolError> {
    let metadata = if flags & flag::METADATA == 0 {
        None
    } else {
        need(&buf, 3, "metadata length")?;
        let len = buf.get_uint(3) as usize;
        need(&buf, len, "metadata")?;
        Some(buf.split_to(len))
    };

    Ok(Payload {
        metadata,
        data: buf,
    })
}

fn payload_size(payload: &Payload) -> usize {
    payload.metadata.as_ref().map_or(0, |m| 3 + m.len()) + payload.data.len()
}

#[allow(clippy::cast_possible_truncation)]
fn millis(duration: Duration) -> u32 {
    duration.as_millis().min(u128::from(STREAM_ID_MASK)) as u32
}
