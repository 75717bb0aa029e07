//! Composite metadata with the routing and authentication extensions.

use crate::error::ProtocolError;

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// MIME type of composite metadata.
pub const COMPOSITE_METADATA_MIME: &str = "message/x.rsocket.composite-metadata.v0";

/// MIME type of routing metadata.
pub const ROUTING_MIME: &str = "message/x.rsocket.routing.v0";

/// MIME type of authentication metadata.
pub const AUTHENTICATION_MIME: &str = "message/x.rsocket.authentication.v0";

/// Data MIME type used for channel payloads.
pub const OCTET_STREAM_MIME: &str = "application/octet-stream";

/// Well-known id of [`ROUTING_MIME`].
pub const ROUTING_MIME_ID: u8 = 0x7E;

/// Well-known id of [`AUTHENTICATION_MIME`].
pub const AUTHENTICATION_MIME_ID: u8 = 0x7C;

/// Well-known id of the bearer authentication type.
pub const BEARER_AUTH_ID: u8 = 0x01;

const WELL_KNOWN_FLAG: u8 = 0x80;
const MAX_TAG_LEN: usize = 255;
const MAX_ENTRY_LEN: usize = 0xFF_FFFF;

/// MIME type of a composite metadata entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MimeType {
    /// Compact well-known id.
    WellKnown(u8),
    /// Explicit MIME string.
    Custom(String),
}

impl MimeType {
    fn is(&self, id: u8, name: &str) -> bool {
        match self {
            Self::WellKnown(known) => *known == id,
            Self::Custom(custom) => custom == name,
        }
    }
}

/// One entry of composite metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataEntry {
    /// Entry MIME type.
    pub mime: MimeType,
    /// Entry content.
    pub content: Bytes,
}

/// Sequence of typed metadata entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompositeMetadata {
    entries: Vec<MetadataEntry>,
}

impl CompositeMetadata {
    /// Empty metadata.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Append an entry.
    #[must_use]
    pub fn with_entry(mut self, mime: MimeType, content: Bytes) -> Self {
        self.entries.push(MetadataEntry { mime, content });
        self
    }

    /// Append a routing entry naming `route`.
    #[must_use]
    pub fn with_route(self, route: &str) -> Self {
        self.with_entry(MimeType::WellKnown(ROUTING_MIME_ID), encode_route_tags(route))
    }

    /// Append an authentication entry.
    ///
    /// # Errors
    ///
    /// Returns an error if a custom authentication type name is empty or too long.
    pub fn with_authentication(self, auth: &Authentication) -> Result<Self, ProtocolError> {
        Ok(self.with_entry(
            MimeType::WellKnown(AUTHENTICATION_MIME_ID),
            auth.encode()?,
        ))
    }

    /// All entries in wire order.
    #[must_use]
    pub fn entries(&self) -> &[MetadataEntry] {
        &self.entries
    }

    /// The route carried by the first routing entry, with its tags joined.
    ///
    /// # Errors
    ///
    /// Returns an error if the routing entry is malformed.
    pub fn route(&self) -> Result<Option<String>, ProtocolError> {
        self.find(ROUTING_MIME_ID, ROUTING_MIME)
            .map(|entry| decode_route_tags(entry.content.clone()).map(|tags| tags.concat()))
            .transpose()
    }

    /// The credentials carried by the first authentication entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the authentication entry is malformed.
    pub fn authentication(&self) -> Result<Option<Authentication>, ProtocolError> {
        self.find(AUTHENTICATION_MIME_ID, AUTHENTICATION_MIME)
            .map(|entry| Authentication::decode(entry.content.clone()))
            .transpose()
    }

    fn find(&self, id: u8, name: &str) -> Option<&MetadataEntry> {
        self.entries.iter().find(|entry| entry.mime.is(id, name))
    }

    /// Encode the entries.
    ///
    /// # Errors
    ///
    /// Returns an error if a MIME string or entry does not fit its length field.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();

        for entry in &self.entries {
            match &entry.mime {
                MimeType::WellKnown(id) => {
                    if *id >= WELL_KNOWN_FLAG {
                        return Err(ProtocolError::InvalidMetadata(format!(
                            "well-known MIME id out of range: {id:#04x}"
                        )));
                    }
                    buf.put_u8(WELL_KNOWN_FLAG | id);
                }
                MimeType::Custom(mime) => {
                    let len = mime
                        .len()
                        .checked_sub(1)
                        .and_then(|len| u8::try_from(len).ok())
                        .filter(|len| *len < WELL_KNOWN_FLAG)
                        .ok_or_else(|| {
                            ProtocolError::InvalidMetadata(format!("bad MIME type length: {mime}"))
                        })?;
                    buf.put_u8(len);
                    buf.put_slice(mime.as_bytes());
                }
            }

            if entry.content.len() > MAX_ENTRY_LEN {
                return Err(ProtocolError::FrameTooLarge {
                    size: entry.content.len(),
                    max: MAX_ENTRY_LEN,
                });
            }
            buf.put_uint(entry.content.len() as u64, 3);
            buf.put_slice(&entry.content);
        }

        Ok(buf.freeze())
    }

    /// Decode entries from a metadata block.
    ///
    /// # Errors
    ///
    /// Returns an error if the block is truncated or a MIME string is not UTF-8.
    #[allow(clippy::cast_possible_truncation)]
    pub fn decode(mut buf: Bytes) -> Result<Self, ProtocolError> {
        let mut entries = Vec::new();

        while buf.has_remaining() {
            let head = buf.get_u8();
            let mime = if head & WELL_KNOWN_FLAG == 0 {
                let len = usize::from(head) + 1;
                need(&buf, len, "MIME type")?;
                let raw = buf.split_to(len);
                MimeType::Custom(String::from_utf8(raw.to_vec()).map_err(|_| {
                    ProtocolError::InvalidMetadata("MIME type is not UTF-8".to_string())
                })?)
            } else {
                MimeType::WellKnown(head & !WELL_KNOWN_FLAG)
            };

            need(&buf, 3, "entry length")?;
            let len = buf.get_uint(3) as usize;
            need(&buf, len, "entry content")?;

            entries.push(MetadataEntry {
                mime,
                content: buf.split_to(len),
            });
        }

        Ok(Self { entries })
    }
}

/// Credentials carried in authentication metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authentication {
    /// Bearer token.
    Bearer(String),
    /// Any other well-known or custom scheme.
    Other {
        /// Scheme identifier.
        auth_type: MimeType,
        /// Raw credentials.
        credentials: Bytes,
    },
}

impl Authentication {
    fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();

        match self {
            Self::Bearer(token) => {
                buf.put_u8(WELL_KNOWN_FLAG | BEARER_AUTH_ID);
                buf.put_slice(token.as_bytes());
            }
            Self::Other {
                auth_type,
                credentials,
            } => {
                match auth_type {
                    MimeType::WellKnown(id) => buf.put_u8(WELL_KNOWN_FLAG | (id & !WELL_KNOWN_FLAG)),
                    MimeType::Custom(name) => {
                        let len = u8::try_from(name.len())
                            .ok()
                            .filter(|len| (1..WELL_KNOWN_FLAG).contains(len))
                            .ok_or_else(|| {
                                ProtocolError::InvalidMetadata(format!(
                                    "bad authentication type length: {name}"
                                ))
                            })?;
                        buf.put_u8(len);
                        buf.put_slice(name.as_bytes());
                    }
                }
                buf.put_slice(credentials);
            }
        }

        Ok(buf.freeze())
    }

    fn decode(mut buf: Bytes) -> Result<Self, ProtocolError> {
        need(&buf, 1, "authentication type")?;
        let head = buf.get_u8();

        if head & WELL_KNOWN_FLAG != 0 {
            let id = head & !WELL_KNOWN_FLAG;
            if id == BEARER_AUTH_ID {
                let token = String::from_utf8(buf.to_vec()).map_err(|_| {
                    ProtocolError::InvalidMetadata("bearer token is not UTF-8".to_string())
                })?;
                return Ok(Self::Bearer(token));
            }
            return Ok(Self::Other {
                auth_type: MimeType::WellKnown(id),
                credentials: buf,
            });
        }

        let len = usize::from(head);
        if len == 0 {
            return Err(ProtocolError::InvalidMetadata(
                "empty authentication type".to_string(),
            ));
        }
        need(&buf, len, "authentication type")?;
        let name = String::from_utf8(buf.split_to(len).to_vec()).map_err(|_| {
            ProtocolError::InvalidMetadata("authentication type is not UTF-8".to_string())
        })?;

        Ok(Self::Other {
            auth_type: MimeType::Custom(name),
            credentials: buf,
        })
    }
}

/// Routing metadata for `route`, ready to attach to a request.
///
/// # Errors
///
/// Returns an error if the route is too long to encode.
pub fn route_metadata(route: &str) -> Result<Bytes, ProtocolError> {
    CompositeMetadata::new().with_route(route).encode()
}

/// Bearer authentication metadata for a SETUP frame.
///
/// # Errors
///
/// Returns an error if the token is too long to encode.
pub fn bearer_metadata(token: &str) -> Result<Bytes, ProtocolError> {
    CompositeMetadata::new()
        .with_authentication(&Authentication::Bearer(token.to_string()))?
        .encode()
}

/// Extracts the route from request metadata, if any.
///
/// # Errors
///
/// Returns an error if the metadata is malformed.
pub fn route_of(metadata: &Bytes) -> Result<Option<String>, ProtocolError> {
    CompositeMetadata::decode(metadata.clone())?.route()
}

/// Splits a route into tags of at most 255 bytes without cutting a character.
#[allow(clippy::cast_possible_truncation)]
fn encode_route_tags(route: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(route.len() + route.len() / MAX_TAG_LEN + 1);
    let mut rest = route;

    while !rest.is_empty() {
        let mut end = rest.len().min(MAX_TAG_LEN);
        while !rest.is_char_boundary(end) {
            end -= 1;
        }

        let (tag, tail) = rest.split_at(end);
        buf.put_u8(tag.len() as u8);
        buf.put_slice(tag.as_bytes());
        rest = tail;
    }

    buf.freeze()
}

fn decode_route_tags(mut buf: Bytes) -> Result<Vec<String>, ProtocolError> {
    let mut tags = Vec::new();

    while buf.has_remaining() {
        let len = usize::from(buf.get_u8());
        need(&buf, len, "routing tag")?;
        let tag = String::from_utf8(buf.split_to(len).to_vec())
            .map_err(|_| ProtocolError::InvalidMetadata("routing tag is not UTF-8".to_string()))?;
        tags.push(tag);
    }

    Ok(tags)
}

fn need(buf: &Bytes, len: usize, what: &str) -> Result<(), ProtocolError> {
    if buf.remaining() < len {
        return Err(ProtocolError::InvalidMetadata(format!(
            "truncated {what}: need {len} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_wire_layout() {
        let encoded = route_metadata("orders").unwrap();

        assert_eq!(
            &encoded[..],
            &[0xFE, 0, 0, 7, 6, b'o', b'r', b'd', b'e', b'r', b's']
        );
        assert_eq!(route_of(&encoded).unwrap().as_deref(), Some("orders"));
    }

    #[test]
    fn test_long_route_is_split_on_char_boundaries() {
        // 254 ASCII bytes followed by multi-byte characters forces a short first tag.
        let route = format!("{}{}", "a".repeat(254), "é".repeat(200));
        let metadata = CompositeMetadata::decode(route_metadata(&route).unwrap()).unwrap();

        let tags = decode_route_tags(metadata.entries()[0].content.clone()).unwrap();
        assert!(tags.len() > 1);
        assert!(tags.iter().all(|tag| tag.len() <= MAX_TAG_LEN));
        assert_eq!(tags[0].len(), 254);
        assert_eq!(tags.concat(), route);
        assert_eq!(metadata.route().unwrap(), Some(route));
    }

    #[test]
    fn test_empty_route() {
        assert_eq!(route_of(&route_metadata("").unwrap()).unwrap().as_deref(), Some(""));
    }

    #[test]
    fn test_bearer_layout() {
        let encoded = bearer_metadata("secret").unwrap();

        assert_eq!(&encoded[..5], &[0xFC, 0, 0, 7, 0x81]);
        assert_eq!(
            CompositeMetadata::decode(encoded).unwrap().authentication().unwrap(),
            Some(Authentication::Bearer("secret".to_string()))
        );
    }

    #[test]
    fn test_custom_entries_are_skipped_when_looking_up() {
        let metadata = CompositeMetadata::new()
            .with_entry(
                MimeType::Custom("application/x.trace".to_string()),
                Bytes::from_static(b"trace-id"),
            )
            .with_route("inventory");

        let decoded = CompositeMetadata::decode(metadata.encode().unwrap()).unwrap();
        assert_eq!(decoded, metadata);
        assert_eq!(decoded.route().unwrap().as_deref(), Some("inventory"));
        assert_eq!(decoded.authentication().unwrap(), None);
    }

    #[test]
    fn test_custom_auth_type() {
        let auth = Authentication::Other {
            auth_type: MimeType::Custom("hmac".to_string()),
            credentials: Bytes::from_static(b"sig"),
        };

        assert_eq!(Authentication::decode(auth.encode().unwrap()).unwrap(), auth);
    }

    #[test]
    fn test_malformed_metadata() {
        // Entry claims ten bytes, carries two.
        let truncated = Bytes::from_static(&[0xFE, 0, 0, 10, 1, b'a']);
        assert!(matches!(
            route_of(&truncated),
            Err(ProtocolError::InvalidMetadata(_))
        ));

        // Routing tag claims five bytes, entry holds two.
        let bad_tag = Bytes::from_static(&[0xFE, 0, 0, 2, 5, b'a']);
        assert!(route_of(&bad_tag).is_err());

        // No routing entry at all.
        assert_eq!(route_of(&bearer_metadata("t").unwrap()).unwrap(), None);
    }
}
