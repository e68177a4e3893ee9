//! Content-type negotiated encoding for broker payloads.
//!
//! [`Serializer`] is object-safe: values go in as `&dyn erased_serde::Serialize`
//! and come out through a visitor that receives an erased deserializer. The
//! typed [`encode`] and [`decode`] helpers hide that from callers.
//!
//! [`WireCodec`] is the per-route half: it knows the concrete message and
//! result types of one descriptor and uses whatever serializer the delivery
//! negotiated.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::core::AnyMessage;
use crate::error::{BusError, SerializationError};

/// Content type of the reference codec.
pub const JSON: &str = "application/json";

/// Visitor handed an erased deserializer for one payload.
pub type DeserializeVisitor<'v> =
    dyn FnMut(&mut dyn erased_serde::Deserializer<'_>) -> Result<(), erased_serde::Error> + 'v;

/// An encoding for one content type.
pub trait Serializer: Send + Sync {
    /// MIME type this serializer handles.
    fn content_type(&self) -> &str;

    /// Encode a value.
    fn serialize(&self, value: &dyn erased_serde::Serialize) -> Result<Bytes, SerializationError>;

    /// Decode `bytes`, handing the erased deserializer to `visit`.
    fn deserialize(
        &self,
        bytes: &[u8],
        visit: &mut DeserializeVisitor<'_>,
    ) -> Result<(), SerializationError>;
}

/// Encode a typed value.
pub fn encode<T: Serialize>(
    serializer: &dyn Serializer,
    value: &T,
) -> Result<Bytes, SerializationError> {
    serializer.serialize(value)
}

/// Decode a typed value.
pub fn decode<T: DeserializeOwned>(
    serializer: &dyn Serializer,
    bytes: &[u8],
) -> Result<T, SerializationError> {
    let mut out = None;
    serializer.deserialize(bytes, &mut |de| {
        out = Some(erased_serde::deserialize::<T>(de)?);
        Ok(())
    })?;
    out.ok_or_else(|| SerializationError::Decode {
        content_type: serializer.content_type().to_owned(),
        source: "deserializer produced no value".into(),
    })
}

/// Reference JSON codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn content_type(&self) -> &str {
        JSON
    }

    fn serialize(&self, value: &dyn erased_serde::Serialize) -> Result<Bytes, SerializationError> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| SerializationError::Encode {
                content_type: JSON.to_owned(),
                source: Box::new(e),
            })
    }

    fn deserialize(
        &self,
        bytes: &[u8],
        visit: &mut DeserializeVisitor<'_>,
    ) -> Result<(), SerializationError> {
        let decode_error = |source: Box<dyn std::error::Error + Send + Sync>| {
            SerializationError::Decode {
                content_type: JSON.to_owned(),
                source,
            }
        };

        let mut json = serde_json::Deserializer::from_slice(bytes);
        {
            let mut erased = <dyn erased_serde::Deserializer>::erase(&mut json);
            visit(&mut erased).map_err(|e| decode_error(Box::new(e)))?;
        }
        json.end().map_err(|e| decode_error(Box::new(e)))
    }
}

/// Serializers by content type, with a default for messages that name none.
#[derive(Clone)]
pub struct SerializerRegistry {
    serializers: Vec<Arc<dyn Serializer>>,
    default: usize,
}

impl SerializerRegistry {
    /// Registry whose only (and default) serializer is `serializer`.
    pub fn new(serializer: Arc<dyn Serializer>) -> Self {
        Self {
            serializers: vec![serializer],
            default: 0,
        }
    }

    /// Add a serializer. Replaces any existing one for the same content type.
    pub fn register(&mut self, serializer: Arc<dyn Serializer>) -> &mut Self {
        match self.position(serializer.content_type()) {
            Some(i) => self.serializers[i] = serializer,
            None => self.serializers.push(serializer),
        }
        self
    }

    /// Make a registered content type the default.
    pub fn set_default(&mut self, content_type: &str) -> Result<(), SerializationError> {
        self.default = self.position(content_type).ok_or_else(|| {
            SerializationError::UnsupportedContentType {
                content_type: content_type.to_owned(),
            }
        })?;
        Ok(())
    }

    /// The default serializer.
    pub fn default_serializer(&self) -> Arc<dyn Serializer> {
        self.serializers[self.default].clone()
    }

    /// The serializer for `requested`, or the default when nothing is requested.
    pub fn negotiate(&self, requested: Option<&str>) -> Result<Arc<dyn Serializer>, SerializationError> {
        match requested {
            None => Ok(self.default_serializer()),
            Some(ct) => self
                .position(ct)
                .map(|i| self.serializers[i].clone())
                .ok_or_else(|| SerializationError::UnsupportedContentType {
                    content_type: ct.to_owned(),
                }),
        }
    }

    fn position(&self, content_type: &str) -> Option<usize> {
        let wanted = essence(content_type);
        self.serializers
            .iter()
            .position(|s| essence(s.content_type()).eq_ignore_ascii_case(wanted))
    }
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        Self::new(Arc::new(JsonSerializer))
    }
}

/// `application/json; charset=utf-8` -> `application/json`
fn essence(content_type: &str) -> &str {
    content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
}

// =============================================================================
// Wire codecs
// =============================================================================

/// Typed decode/encode for one route, used when a broker delivers to it.
pub trait WireCodec: Send + Sync {
    /// Decode a request payload into the route's message type.
    fn decode_message(
        &self,
        serializer: &dyn Serializer,
        body: &[u8],
    ) -> Result<AnyMessage, SerializationError>;

    /// Encode a consumer result produced for this route.
    fn encode_result(
        &self,
        serializer: &dyn Serializer,
        result: &(dyn Any + Send + Sync),
    ) -> Result<Bytes, BusError>;
}

/// [`WireCodec`] for message `M` with result `R`.
pub struct TypedCodec<M, R> {
    _types: PhantomData<fn() -> (M, R)>,
}

impl<M, R> TypedCodec<M, R> {
    pub fn new() -> Self {
        Self {
            _types: PhantomData,
        }
    }
}

impl<M, R> Default for TypedCodec<M, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M, R> WireCodec for TypedCodec<M, R>
where
    M: DeserializeOwned + Send + Sync + 'static,
    R: Serialize + 'static,
{
    fn decode_message(
        &self,
        serializer: &dyn Serializer,
        body: &[u8],
    ) -> Result<AnyMessage, SerializationError> {
        decode::<M>(serializer, body).map(|m| Box::new(m) as AnyMessage)
    }

    fn encode_result(
        &self,
        serializer: &dyn Serializer,
        result: &(dyn Any + Send + Sync),
    ) -> Result<Bytes, BusError> {
        let value = result
            .downcast_ref::<R>()
            .ok_or(BusError::ResultTypeMismatch {
                expected: std::any::type_name::<R>(),
                actual: "<erased consumer output>",
            })?;
        Ok(encode(serializer, value)?)
    }
}
