//! Serialization modes for task input and output.
//!
//! The handshake names one mode for the input frames and one for the output
//! frames. Each mode fixes how a frame's bytes map to an [`Item`].

use crate::error::{Result, WorkerError};
use crate::protocol::codec::{Frame, ReadExt, SpecialLength};
use serde_pickle::{DeOptions, SerOptions};
use std::fmt;
use std::io::Read;
use std::str::FromStr;

/// How frames are converted to and from items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SerializedMode {
    /// Raw bytes, passed through untouched.
    None,
    /// Generic serialized object (JSON).
    #[default]
    Byte,
    /// UTF-8 text.
    String,
    /// Two consecutive frames, key then value.
    Pair,
    /// Pickled structured records; one frame may hold several rows.
    Row,
}

impl FromStr for SerializedMode {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "None" => Ok(Self::None),
            "Byte" => Ok(Self::Byte),
            "String" => Ok(Self::String),
            "Pair" => Ok(Self::Pair),
            "Row" => Ok(Self::Row),
            other => Err(WorkerError::protocol(format!(
                "unknown serialization mode '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for SerializedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "None",
            Self::Byte => "Byte",
            Self::String => "String",
            Self::Pair => "Pair",
            Self::Row => "Row",
        };
        f.write_str(name)
    }
}

/// A value flowing into or out of a task function.
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    /// Explicit null. Never written on output.
    Null,
    /// Raw bytes (`None` mode).
    Bytes(Vec<u8>),
    /// Text (`String` mode).
    Text(String),
    /// Key/value pair (`Pair` mode); either side may be null.
    Pair {
        key: Option<Vec<u8>>,
        value: Option<Vec<u8>>,
    },
    /// One structured record (`Row` mode).
    Row(serde_pickle::Value),
    /// Generic object (`Byte` mode).
    Object(serde_json::Value),
}

impl Item {
    /// Name of the item's runtime type, used in error reports.
    pub fn type_name(&self) -> &'static str {
        match self {
            Item::Null => "Null",
            Item::Bytes(_) => "Bytes",
            Item::Text(_) => "Text",
            Item::Pair { .. } => "Pair",
            Item::Row(_) => "Row",
            Item::Object(_) => "Object",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Item::Null)
    }

    /// Text content, if this is a text item.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Item::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// Decode one input unit.
///
/// `first` is the payload of the frame whose length has already been read
/// (`None` for a `NULL` length). `Pair` mode reads the value frame from
/// `reader`; every other mode decodes `first` alone.
pub fn decode_frame<R: Read + ?Sized>(
    mode: SerializedMode,
    first: Option<Vec<u8>>,
    reader: &mut R,
) -> Result<Vec<Item>> {
    let item = match mode {
        SerializedMode::None => first.map(Item::Bytes).unwrap_or(Item::Null),
        SerializedMode::String => match first {
            Some(payload) => Item::Text(String::from_utf8(payload)?),
            None => Item::Null,
        },
        SerializedMode::Byte => match first {
            Some(payload) => Item::Object(serde_json::from_slice(&payload)?),
            None => Item::Null,
        },
        SerializedMode::Pair => {
            let value = match reader.read_frame()? {
                Frame::Data(payload) => Some(payload),
                Frame::Control(SpecialLength::Null) => None,
                Frame::Control(other) => {
                    return Err(WorkerError::protocol(format!(
                        "unexpected pair value length: {}",
                        other.code()
                    )));
                }
            };
            Item::Pair { key: first, value }
        }
        SerializedMode::Row => {
            let payload = first
                .ok_or_else(|| WorkerError::protocol("null frame in Row mode".to_string()))?;
            return decode_rows(&payload);
        }
    };
    Ok(vec![item])
}

/// Unpickle a row frame. A top-level list or tuple expands to one item per
/// element.
fn decode_rows(payload: &[u8]) -> Result<Vec<Item>> {
    let value = serde_pickle::value_from_slice(
        payload,
        DeOptions::new().replace_unresolved_globals(),
    )?;
    let rows = match value {
        serde_pickle::Value::List(rows) | serde_pickle::Value::Tuple(rows) => rows,
        single => vec![single],
    };
    Ok(rows.into_iter().map(Item::Row).collect())
}

/// Encode one output item as the payload of a single frame.
pub fn encode_item(mode: SerializedMode, item: &Item) -> Result<Vec<u8>> {
    match (mode, item) {
        (SerializedMode::None, Item::Bytes(bytes)) => Ok(bytes.clone()),
        (SerializedMode::String, Item::Text(text)) => Ok(text.as_bytes().to_vec()),
        (SerializedMode::Row, Item::Row(row)) => Ok(serde_pickle::value_to_vec(
            &serde_pickle::Value::List(vec![row.clone()]),
            SerOptions::new(),
        )?),
        (SerializedMode::None | SerializedMode::String | SerializedMode::Row, other) => {
            Err(mismatch(mode, other))
        }
        (SerializedMode::Byte | SerializedMode::Pair, other) => encode_object(other),
    }
}

/// Generic object encoding, used for `Byte` output and accumulator updates.
fn encode_object(item: &Item) -> Result<Vec<u8>> {
    let encoded = match item {
        Item::Null => serde_json::to_vec(&serde_json::Value::Null),
        Item::Bytes(bytes) => serde_json::to_vec(bytes),
        Item::Text(text) => serde_json::to_vec(text),
        Item::Pair { key, value } => serde_json::to_vec(&(key, value)),
        Item::Object(value) => serde_json::to_vec(value),
        Item::Row(_) => {
            return Err(WorkerError::Serialization {
                type_name: item.type_name().to_string(),
                message: "structured rows have no generic object encoding".to_string(),
            });
        }
    };
    encoded.map_err(|e| WorkerError::Serialization {
        type_name: item.type_name().to_string(),
        message: e.to_string(),
    })
}

fn mismatch(mode: SerializedMode, item: &Item) -> WorkerError {
    WorkerError::Serialization {
        type_name: item.type_name().to_string(),
        message: format!("output mode {} cannot encode this item", mode),
    }
}
