use std::convert::Infallible;
use std::error::Error;

use bytes::Bytes;

/// Turns a value into the bytes placed on the wire.
///
/// Implemented for every `Fn(&T) -> Result<Bytes, E>`, so closures and plain
/// functions can be passed directly.
pub trait Serializer<T>: Send + Sync + 'static {
    /// Failure raised when a value cannot be encoded.
    type Error: Error + Send + Sync + 'static;

    /// Encodes a value.
    ///
    /// # Errors
    ///
    /// Returns the codec's error if the value cannot be encoded.
    fn serialize(&self, value: &T) -> Result<Bytes, Self::Error>;
}

impl<T, F, E> Serializer<T> for F
where
    F: Fn(&T) -> Result<Bytes, E> + Send + Sync + 'static,
    E: Error + Send + Sync + 'static,
{
    type Error = E;

    fn serialize(&self, value: &T) -> Result<Bytes, E> {
        self(value)
    }
}

/// Turns received bytes back into a value.
///
/// Implemented for every `Fn(Bytes) -> Result<T, E>`.
pub trait Deserializer<T>: Send + Sync + 'static {
    /// Failure raised when bytes cannot be decoded.
    type Error: Error + Send + Sync + 'static;

    /// Decodes a value.
    ///
    /// # Errors
    ///
    /// Returns the codec's error if the bytes do not hold a valid value.
    fn deserialize(&self, bytes: Bytes) -> Result<T, Self::Error>;
}

impl<T, F, E> Deserializer<T> for F
where
    F: Fn(Bytes) -> Result<T, E> + Send + Sync + 'static,
    E: Error + Send + Sync + 'static,
{
    type Error = E;

    fn deserialize(&self, bytes: Bytes) -> Result<T, E> {
        self(bytes)
    }
}

/// Serializer for types that already know how to become bytes.
///
/// Pass as `try_into_bytes::<T, E>` to
/// [`Transport::send_to_with`](crate::Transport::send_to_with).
///
/// # Errors
///
/// Propagates the type's own conversion error.
pub fn try_into_bytes<T, E>(value: &T) -> Result<Bytes, E>
where
    T: Clone + TryInto<Bytes, Error = E>,
{
    value.clone().try_into()
}

/// Deserializer for types that already know how to be built from bytes.
///
/// # Errors
///
/// Propagates the type's own conversion error.
pub fn try_from_bytes<T, E>(bytes: Bytes) -> Result<T, E>
where
    T: TryFrom<Bytes, Error = E>,
{
    T::try_from(bytes)
}

/// Serializer for UTF-8 strings.
///
/// # Errors
///
/// Never fails.
#[allow(clippy::ptr_arg)]
pub fn string_to_bytes(value: &String) -> Result<Bytes, Infallible> {
    Ok(Bytes::copy_from_slice(value.as_bytes()))
}

/// Deserializer for UTF-8 strings.
///
/// # Errors
///
/// Returns an error if the bytes are not valid UTF-8.
pub fn string_from_bytes(bytes: Bytes) -> Result<String, std::string::FromUtf8Error> {
    String::from_utf8(bytes.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq, Eq)]
    struct Celsius(i16);

    #[derive(Debug, thiserror::Error)]
    #[error("expected two bytes")]
    struct BadLength;

    impl TryFrom<Bytes> for Celsius {
        type Error = BadLength;

        fn try_from(bytes: Bytes) -> Result<Self, BadLength> {
            let raw: [u8; 2] = bytes.as_ref().try_into().map_err(|_| BadLength)?;
            Ok(Self(i16::from_be_bytes(raw)))
        }
    }

    impl TryFrom<Celsius> for Bytes {
        type Error = BadLength;

        fn try_from(value: Celsius) -> Result<Self, BadLength> {
            Ok(Self::copy_from_slice(&value.0.to_be_bytes()))
        }
    }

    fn encode<T, S: Serializer<T>>(serializer: &S, value: &T) -> Result<Bytes, S::Error> {
        serializer.serialize(value)
    }

    fn decode<T, D: Deserializer<T>>(deserializer: &D, bytes: Bytes) -> Result<T, D::Error> {
        deserializer.deserialize(bytes)
    }

    #[test]
    fn test_conversion_adapters() {
        let bytes = encode(&try_into_bytes::<Celsius, BadLength>, &Celsius(-40)).unwrap();
        assert_eq!(bytes.len(), 2);

        let back: Celsius = decode(&try_from_bytes::<Celsius, BadLength>, bytes).unwrap();
        assert_eq!(back, Celsius(-40));

        assert!(decode(&try_from_bytes::<Celsius, BadLength>, Bytes::from_static(b"x")).is_err());
    }

    #[test]
    fn test_closures_are_codecs() {
        let upper = |value: &String| -> Result<Bytes, Infallible> {
            Ok(Bytes::from(value.to_uppercase()))
        };

        assert_eq!(
            encode(&upper, &"abc".to_string()).unwrap(),
            Bytes::from_static(b"ABC")
        );
        assert!(decode(&string_from_bytes, Bytes::from_static(&[0xff, 0xfe])).is_err());
    }
}
