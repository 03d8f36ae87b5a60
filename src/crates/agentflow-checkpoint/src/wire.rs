//! Checkpoint wire format: `$type`-tagged JSON with converter plugins
//!
//! Checkpoints cross the store boundary as JSON documents. Polymorphic
//! nodes inside the payload (chat messages, message lists, tabular records,
//! domain identifiers) carry an explicit `$type` discriminator so a store
//! that knows nothing about the engine can still round-trip them, and so
//! the engine can validate them on the way back in.
//!
//! The [`WireMarshaller`] walks the payload tree and applies a registered
//! [`ValueConverter`] to every `$type`-tagged node. Converters are plugins:
//! the defaults validate the engine's domain values (executor identity,
//! edge id, scope key, checkpoint id, chat message, message list, table),
//! and embedders may register their own for application types.
//!
//! Two tolerances are configurable:
//!
//! - **Out-of-order metadata** (default: accepted). Some stores reorder
//!   JSON keys; in tolerant mode the marshaller matches keys by name only.
//!   In strict mode the top-level document must lead with `schema_version`.
//! - **Schema version**: a top-level `schema_version` different from
//!   [`RunCheckpoint::SCHEMA_VERSION`] is always rejected.
//!
//! Byte-oriented stores use [`marshal_bytes`](WireMarshaller::marshal_bytes)
//! / [`unmarshal_bytes`](WireMarshaller::unmarshal_bytes): the marshaller
//! renders the canonical document (metadata first) and frames it per its
//! [`WireEncoding`], either as UTF-8 text or as a bincode-framed blob.

use crate::checkpoint::RunCheckpoint;
use crate::error::{CheckpointError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Key carrying the polymorphic discriminator on wire nodes
pub const TYPE_KEY: &str = "$type";

/// How a marshalled checkpoint document is framed as bytes
///
/// Tagged payload values need a self-describing representation, so the
/// document itself is always JSON; the encoding decides how it travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireEncoding {
    /// UTF-8 JSON text (default)
    #[default]
    Json,
    /// The JSON document framed as a length-prefixed bincode blob, for
    /// stores that expect opaque binary values
    Binary,
}

/// Converter plugin for one `$type` tag
///
/// `encode` runs on marshal (engine → store), `decode` on unmarshal
/// (store → engine). Both receive the full tagged object and return the
/// value to put in its place; decode is the natural place to validate
/// shape.
pub trait ValueConverter: Send + Sync {
    /// The `$type` tag this converter handles
    fn tag(&self) -> &str;

    /// Transform a tagged node on the way out
    fn encode(&self, value: &Value) -> Result<Value> {
        Ok(value.clone())
    }

    /// Transform and validate a tagged node on the way back in
    fn decode(&self, value: &Value) -> Result<Value> {
        Ok(value.clone())
    }
}

/// Identity converter that validates a single required string field
struct IdConverter {
    tag: &'static str,
    field: &'static str,
}

impl ValueConverter for IdConverter {
    fn tag(&self) -> &str {
        self.tag
    }

    fn decode(&self, value: &Value) -> Result<Value> {
        match value.get(self.field).and_then(Value::as_str) {
            Some(_) => Ok(value.clone()),
            None => Err(CheckpointError::Corrupt(format!(
                "node tagged '{}' is missing string field '{}'",
                self.tag, self.field
            ))),
        }
    }
}

/// Converter validating engine-recognized structured values by shape
struct StructuredConverter {
    tag: &'static str,
    required: &'static [&'static str],
}

impl ValueConverter for StructuredConverter {
    fn tag(&self) -> &str {
        self.tag
    }

    fn decode(&self, value: &Value) -> Result<Value> {
        for field in self.required {
            if value.get(field).is_none() {
                return Err(CheckpointError::Corrupt(format!(
                    "node tagged '{}' is missing field '{}'",
                    self.tag, field
                )));
            }
        }
        Ok(value.clone())
    }
}

/// Marshals checkpoints to and from the wire representation
#[derive(Clone)]
pub struct WireMarshaller {
    converters: HashMap<String, Arc<dyn ValueConverter>>,
    accept_unordered_metadata: bool,
    encoding: WireEncoding,
}

impl WireMarshaller {
    /// Marshaller with the engine's default converters registered,
    /// out-of-order metadata accepted and JSON text framing
    pub fn new() -> Self {
        let mut marshaller = Self {
            converters: HashMap::new(),
            accept_unordered_metadata: true,
            encoding: WireEncoding::default(),
        };
        for converter in default_converters() {
            marshaller.register(converter);
        }
        marshaller
    }

    /// Require metadata keys in canonical order (`schema_version` first)
    pub fn strict_metadata_order(mut self) -> Self {
        self.accept_unordered_metadata = false;
        self
    }

    /// Frame byte documents with the given encoding
    pub fn with_encoding(mut self, encoding: WireEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Register a converter plugin, replacing any existing one for its tag
    pub fn register(&mut self, converter: Arc<dyn ValueConverter>) {
        self.converters
            .insert(converter.tag().to_string(), converter);
    }

    /// Marshal a checkpoint to its wire value
    pub fn marshal(&self, checkpoint: &RunCheckpoint) -> Result<Value> {
        let value = serde_json::to_value(checkpoint)?;
        self.walk(value, ConvertDirection::Encode)
    }

    /// Marshal a checkpoint all the way to framed bytes
    ///
    /// The document is rendered canonically (`schema_version` leads), so
    /// the output always passes a strict-ordering unmarshal.
    pub fn marshal_bytes(&self, checkpoint: &RunCheckpoint) -> Result<Vec<u8>> {
        let wire = self.marshal(checkpoint)?;
        let text = render_document(&wire)?;
        match self.encoding {
            WireEncoding::Json => Ok(text.into_bytes()),
            WireEncoding::Binary => Ok(bincode::serialize(&text)?),
        }
    }

    /// Unmarshal a wire value, rejecting schema version mismatches
    pub fn unmarshal(&self, value: Value) -> Result<RunCheckpoint> {
        let found = value
            .get("schema_version")
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                CheckpointError::Corrupt("missing top-level schema_version".to_string())
            })? as u32;
        if found != RunCheckpoint::SCHEMA_VERSION {
            return Err(CheckpointError::SchemaVersion {
                expected: RunCheckpoint::SCHEMA_VERSION,
                found,
            });
        }

        let converted = self.walk(value, ConvertDirection::Decode)?;
        Ok(serde_json::from_value(converted)?)
    }

    /// Unmarshal from checkpoint text; in strict mode the document must
    /// lead with `schema_version`
    pub fn unmarshal_str(&self, text: &str) -> Result<RunCheckpoint> {
        if !self.accept_unordered_metadata {
            let head: String = text.chars().filter(|c| !c.is_whitespace()).take(20).collect();
            if !head.starts_with("{\"schema_version\"") {
                return Err(CheckpointError::Corrupt(
                    "metadata out of order: schema_version must come first".to_string(),
                ));
            }
        }
        self.unmarshal(serde_json::from_str(text)?)
    }

    /// Unmarshal from framed bytes in this marshaller's encoding
    pub fn unmarshal_bytes(&self, bytes: &[u8]) -> Result<RunCheckpoint> {
        let text = match self.encoding {
            WireEncoding::Json => std::str::from_utf8(bytes)
                .map_err(|e| {
                    CheckpointError::Corrupt(format!("checkpoint text is not UTF-8: {}", e))
                })?
                .to_string(),
            WireEncoding::Binary => bincode::deserialize(bytes)?,
        };
        self.unmarshal_str(&text)
    }

    fn walk(&self, value: Value, direction: ConvertDirection) -> Result<Value> {
        match value {
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (key, child) in map {
                    out.insert(key, self.walk(child, direction)?);
                }
                let rebuilt = Value::Object(out);
                if let Some(tag) = rebuilt.get(TYPE_KEY).and_then(Value::as_str) {
                    if let Some(converter) = self.converters.get(tag) {
                        return match direction {
                            ConvertDirection::Encode => converter.encode(&rebuilt),
                            ConvertDirection::Decode => converter.decode(&rebuilt),
                        };
                    }
                }
                Ok(rebuilt)
            }
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.walk(item, direction)?);
                }
                Ok(Value::Array(out))
            }
            other => Ok(other),
        }
    }
}

impl Default for WireMarshaller {
    fn default() -> Self {
        Self::new()
    }
}

/// Render a wire document with `schema_version` as the leading key
fn render_document(wire: &Value) -> Result<String> {
    let map = wire.as_object().ok_or_else(|| {
        CheckpointError::Corrupt("checkpoint document must be an object".to_string())
    })?;
    let mut parts = Vec::with_capacity(map.len());
    if let Some(version) = map.get("schema_version") {
        parts.push(format!("\"schema_version\":{}", version));
    }
    for (key, value) in map {
        if key == "schema_version" {
            continue;
        }
        parts.push(format!(
            "{}:{}",
            serde_json::to_string(key)?,
            serde_json::to_string(value)?
        ));
    }
    Ok(format!("{{{}}}", parts.join(",")))
}

#[derive(Clone, Copy)]
enum ConvertDirection {
    Encode,
    Decode,
}

fn default_converters() -> Vec<Arc<dyn ValueConverter>> {
    vec![
        Arc::new(IdConverter {
            tag: "executor_id",
            field: "id",
        }),
        Arc::new(IdConverter {
            tag: "edge_id",
            field: "id",
        }),
        Arc::new(IdConverter {
            tag: "scope_key",
            field: "key",
        }),
        Arc::new(IdConverter {
            tag: "checkpoint_id",
            field: "id",
        }),
        Arc::new(StructuredConverter {
            tag: "chat_message",
            required: &["role", "content"],
        }),
        Arc::new(StructuredConverter {
            tag: "message_list",
            required: &["messages"],
        }),
        Arc::new(StructuredConverter {
            tag: "table",
            required: &["rows"],
        }),
    ]
}
