//! RSocket wire protocol: frames, composite metadata and stream framing.

pub mod codec;
pub mod frame;
pub mod metadata;

pub use codec::FrameCodec;
pub use frame::{ErrorCode, Frame, FrameType, Payload, Setup};
pub use metadata::{Authentication, CompositeMetadata, MimeType};
