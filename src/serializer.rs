//! # Payload Serialization Module
//!
//! Payloads travel in one of three encodings, chosen by payload shape at
//! send time:
//!
//! - **Dense numeric arrays** bypass the general encoder entirely: the raw
//!   contiguous element bytes are framed behind a small
//!   `(element_type, shape)` sidecar.
//! - **Byte strings** are identity-encoded.
//! - **Everything else** goes through bincode as a general object graph.
//!
//! Decoding dispatches on the `command` word of the envelope, so a receiver
//! never guesses. Interior tree nodes that merely forward a payload re-emit
//! the received bytes unchanged and never re-encode (see the collective
//! algorithms); only the final consumer decodes.

use crate::error::MpiError;
use crate::wire::Command;
use serde::{Deserialize, Serialize};

/// Element type of a dense numeric array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ElementType {
    U8 = 0,
    I16 = 1,
    I32 = 2,
    I64 = 3,
    F32 = 4,
    F64 = 5,
}

impl ElementType {
    /// Width of one element in bytes.
    pub fn width(self) -> usize {
        match self {
            ElementType::U8 => 1,
            ElementType::I16 => 2,
            ElementType::I32 => 4,
            ElementType::I64 => 8,
            ElementType::F32 => 4,
            ElementType::F64 => 8,
        }
    }

    fn from_u8(raw: u8) -> Result<Self, MpiError> {
        match raw {
            0 => Ok(ElementType::U8),
            1 => Ok(ElementType::I16),
            2 => Ok(ElementType::I32),
            3 => Ok(ElementType::I64),
            4 => Ok(ElementType::F32),
            5 => Ok(ElementType::F64),
            other => Err(MpiError::Serialization(format!(
                "unknown array element type {other}"
            ))),
        }
    }
}

/// Homogeneous fixed-width element buffer with a shape sidecar. The element
/// bytes are kept in native layout so transit nodes can forward them without
/// touching the contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseArray {
    pub element_type: ElementType,
    pub shape: Vec<u64>,
    pub data: Vec<u8>,
}

impl DenseArray {
    /// Build a one-dimensional `i64` array.
    pub fn from_i64(values: &[i64]) -> Self {
        let mut data = Vec::with_capacity(values.len() * 8);
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        DenseArray {
            element_type: ElementType::I64,
            shape: vec![values.len() as u64],
            data,
        }
    }

    /// Build a one-dimensional `f64` array.
    pub fn from_f64(values: &[f64]) -> Self {
        let mut data = Vec::with_capacity(values.len() * 8);
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        DenseArray {
            element_type: ElementType::F64,
            shape: vec![values.len() as u64],
            data,
        }
    }

    /// Total number of elements implied by the shape.
    pub fn element_count(&self) -> u64 {
        self.shape.iter().product()
    }

    /// Reinterpret the buffer as `i64` values.
    pub fn to_i64(&self) -> Result<Vec<i64>, MpiError> {
        if self.element_type != ElementType::I64 {
            return Err(MpiError::Serialization(
                "array does not hold i64 elements".into(),
            ));
        }
        Ok(self
            .data
            .chunks_exact(8)
            .map(|c| i64::from_le_bytes(c.try_into().unwrap()))
            .collect())
    }
}

/// Dynamically typed payload carried by the engine.
///
/// The runtime matches messages at runtime (wildcard sources and tags), so
/// the payload type cannot be pinned at the receive site; a closed dynamic
/// value type mirrors that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Array(DenseArray),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn into_list(self) -> Option<Vec<Value>> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

/// Encode a payload, returning the command word a frame carrying it must
/// use and the encoded bytes.
pub fn encode(value: &Value) -> Result<(Command, Vec<u8>), MpiError> {
    match value {
        Value::Bytes(bytes) => Ok((Command::ByteString, bytes.clone())),
        Value::Array(array) => {
            let ndim = array.shape.len();
            if ndim > u8::MAX as usize {
                return Err(MpiError::Serialization(format!(
                    "array rank {ndim} exceeds the wire limit"
                )));
            }
            let expected = array.element_count() as usize * array.element_type.width();
            if expected != array.data.len() {
                return Err(MpiError::Serialization(format!(
                    "array shape implies {expected} bytes but buffer holds {}",
                    array.data.len()
                )));
            }
            let mut buf = Vec::with_capacity(2 + ndim * 8 + array.data.len());
            buf.push(array.element_type as u8);
            buf.push(ndim as u8);
            for dim in &array.shape {
                buf.extend_from_slice(&dim.to_le_bytes());
            }
            buf.extend_from_slice(&array.data);
            Ok((Command::RawArray, buf))
        }
        other => Ok((Command::ObjectGraph, bincode::serialize(other)?)),
    }
}

/// Decode a payload, dispatching on the frame's command word.
pub fn decode(command: Command, bytes: &[u8]) -> Result<Value, MpiError> {
    match command {
        Command::ByteString => Ok(Value::Bytes(bytes.to_vec())),
        Command::RawArray => {
            if bytes.len() < 2 {
                return Err(MpiError::Serialization(
                    "truncated array sidecar".into(),
                ));
            }
            let element_type = ElementType::from_u8(bytes[0])?;
            let ndim = bytes[1] as usize;
            let body = 2 + ndim * 8;
            if bytes.len() < body {
                return Err(MpiError::Serialization(
                    "truncated array shape".into(),
                ));
            }
            let shape: Vec<u64> = bytes[2..body]
                .chunks_exact(8)
                .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
                .collect();
            let expected = shape.iter().product::<u64>() as usize * element_type.width();
            let data = bytes[body..].to_vec();
            if data.len() != expected {
                return Err(MpiError::Serialization(format!(
                    "array shape implies {expected} bytes but frame carries {}",
                    data.len()
                )));
            }
            Ok(Value::Array(DenseArray {
                element_type,
                shape,
                data,
            }))
        }
        Command::ObjectGraph => Ok(bincode::deserialize(bytes)?),
        Command::Ack | Command::Shutdown => Err(MpiError::Serialization(format!(
            "command {command:?} carries no payload"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_string_identity() {
        let value = Value::Bytes(vec![0, 1, 2, 255]);
        let (cmd, bytes) = encode(&value).unwrap();
        assert_eq!(cmd, Command::ByteString);
        assert_eq!(bytes, vec![0, 1, 2, 255]);
        assert_eq!(decode(cmd, &bytes).unwrap(), value);
    }

    #[test]
    fn test_object_graph_round_trip() {
        for value in [
            Value::None,
            Value::Int(-1),
            Value::Float(3.5),
            Value::Text("hello".into()),
            Value::Text(String::new()),
            Value::List(vec![Value::Int(1), Value::Text("x".into()), Value::None]),
        ] {
            let (cmd, bytes) = encode(&value).unwrap();
            assert_eq!(cmd, Command::ObjectGraph);
            assert_eq!(decode(cmd, &bytes).unwrap(), value);
        }
    }

    #[test]
    fn test_dense_array_round_trip() {
        let array = DenseArray::from_i64(&[-3, 0, 7, i64::MAX]);
        let value = Value::Array(array.clone());
        let (cmd, bytes) = encode(&value).unwrap();
        assert_eq!(cmd, Command::RawArray);
        // Sidecar: element type + ndim + one u64 dimension.
        assert_eq!(bytes.len(), 2 + 8 + array.data.len());

        match decode(cmd, &bytes).unwrap() {
            Value::Array(decoded) => {
                assert_eq!(decoded, array);
                assert_eq!(decoded.to_i64().unwrap(), vec![-3, 0, 7, i64::MAX]);
            }
            other => panic!("expected array, got {other:?}"),
        }
    }

    #[test]
    fn test_array_shape_mismatch_rejected() {
        let array = DenseArray {
            element_type: ElementType::I64,
            shape: vec![3],
            data: vec![0; 8], // one element, shape says three
        };
        assert!(encode(&Value::Array(array)).is_err());
    }

    #[test]
    fn test_bad_element_type_rejected() {
        let array = DenseArray::from_i64(&[1]);
        let (cmd, mut bytes) = encode(&Value::Array(array)).unwrap();
        bytes[0] = 99;
        assert!(decode(cmd, &bytes).is_err());
    }
}
