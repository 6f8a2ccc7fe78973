//! Object codecs for persisted envelopes and the HTTP wire format

use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("failed to encode object as {codec}: {message}")]
    Encode { codec: &'static str, message: String },

    #[error("failed to decode {codec} payload: {message}")]
    Decode { codec: &'static str, message: String },

    #[error("unknown codec {0:?}")]
    Unknown(String),
}

pub trait Codec: Send + Sync {
    fn name(&self) -> &'static str;

    fn content_type(&self) -> &'static str;

    fn encode(&self, object: &Value) -> Result<Bytes, CodecError>;

    fn decode(&self, data: &[u8]) -> Result<Value, CodecError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn encode(&self, object: &Value) -> Result<Bytes, CodecError> {
        serde_json::to_vec(object)
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode {
                codec: self.name(),
                message: e.to_string(),
            })
    }

    fn decode(&self, data: &[u8]) -> Result<Value, CodecError> {
        serde_json::from_slice(data).map_err(|e| CodecError::Decode {
            codec: self.name(),
            message: e.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct YamlCodec;

impl Codec for YamlCodec {
    fn name(&self) -> &'static str {
        "yaml"
    }

    fn content_type(&self) -> &'static str {
        "application/yaml"
    }

    fn encode(&self, object: &Value) -> Result<Bytes, CodecError> {
        serde_yaml::to_string(object)
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode {
                codec: self.name(),
                message: e.to_string(),
            })
    }

    fn decode(&self, data: &[u8]) -> Result<Value, CodecError> {
        serde_yaml::from_slice(data).map_err(|e| CodecError::Decode {
            codec: self.name(),
            message: e.to_string(),
        })
    }
}

/// Resolve a codec by its configuration name
pub fn codec_for_name(name: &str) -> Result<Arc<dyn Codec>, CodecError> {
    match name {
        "json" => Ok(Arc::new(JsonCodec)),
        "yaml" => Ok(Arc::new(YamlCodec)),
        other => Err(CodecError::Unknown(other.to_string())),
    }
}
