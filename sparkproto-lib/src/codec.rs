//! Scalar value encoding used in message payloads and function arguments.
//!
//! Every integer type is big-endian on the wire. `Double` is the exception:
//! the device firmware stores doubles little-endian and sends them as-is, so
//! they are decoded and encoded little-endian here too.

use crate::error::ProtocolError;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use strum_macros::Display;

/// Argument separator inside a query-string style argument list.
pub const ARGUMENT_SEPARATOR: u8 = b'&';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ValueType {
    #[strum(to_string = "bool")]
    Bool = 1,
    #[strum(to_string = "int32")]
    Int32 = 2,
    #[strum(to_string = "byte")]
    Byte = 3,
    #[strum(to_string = "string")]
    String = 4,
    #[strum(to_string = "uint16")]
    Uint16 = 5,
    #[strum(to_string = "uint32")]
    Uint32 = 6,
    #[strum(to_string = "crc")]
    Crc = 7,
    #[strum(to_string = "float")]
    Float = 8,
    #[strum(to_string = "double")]
    Double = 9,
    #[strum(to_string = "buffer")]
    Buffer = 10,
}

impl ValueType {
    /// Parse a type name as it appears in introspection data.
    pub fn from_name(name: &str) -> Option<Self> {
        let ty = match name.to_ascii_lowercase().as_str() {
            "bool" | "boolean" => ValueType::Bool,
            "int" | "int32" | "number" => ValueType::Int32,
            "byte" | "uint8" => ValueType::Byte,
            "string" | "str" => ValueType::String,
            "uint16" => ValueType::Uint16,
            "uint32" => ValueType::Uint32,
            "crc" => ValueType::Crc,
            "float" => ValueType::Float,
            "double" => ValueType::Double,
            "buffer" => ValueType::Buffer,
            _ => return None,
        };
        Some(ty)
    }

    /// Resolve a type from introspection JSON, which carries either the
    /// numeric firmware type code or the type name.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => n
                .as_u64()
                .and_then(|code| u8::try_from(code).ok())
                .and_then(|code| ValueType::try_from(code).ok()),
            serde_json::Value::String(s) => ValueType::from_name(s),
            _ => None,
        }
    }

    /// Encoded width in bytes, `None` for variable-length types.
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            ValueType::Bool | ValueType::Byte => Some(1),
            ValueType::Uint16 => Some(2),
            ValueType::Int32 | ValueType::Uint32 | ValueType::Crc | ValueType::Float => Some(4),
            ValueType::Double => Some(8),
            ValueType::String | ValueType::Buffer => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Byte(u8),
    Uint16(u16),
    Uint32(u32),
    Int32(i32),
    Crc(u32),
    Float(f32),
    Double(f64),
    String(String),
    Buffer(Bytes),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Bool(_) => ValueType::Bool,
            Value::Byte(_) => ValueType::Byte,
            Value::Uint16(_) => ValueType::Uint16,
            Value::Uint32(_) => ValueType::Uint32,
            Value::Int32(_) => ValueType::Int32,
            Value::Crc(_) => ValueType::Crc,
            Value::Float(_) => ValueType::Float,
            Value::Double(_) => ValueType::Double,
            Value::String(_) => ValueType::String,
            Value::Buffer(_) => ValueType::Buffer,
        }
    }

    /// Parse a caller-supplied textual argument into a value of `ty`.
    pub fn parse(ty: ValueType, text: &str) -> Result<Self, ProtocolError> {
        let invalid = || ProtocolError::InvalidValue {
            value_type: ty.to_string(),
            value: text.to_string(),
        };
        let value = match ty {
            ValueType::Bool => match text.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Value::Bool(true),
                "false" | "0" => Value::Bool(false),
                _ => return Err(invalid()),
            },
            ValueType::Byte => Value::Byte(text.trim().parse().map_err(|_| invalid())?),
            ValueType::Uint16 => Value::Uint16(text.trim().parse().map_err(|_| invalid())?),
            ValueType::Uint32 => Value::Uint32(text.trim().parse().map_err(|_| invalid())?),
            ValueType::Crc => Value::Crc(text.trim().parse().map_err(|_| invalid())?),
            ValueType::Int32 => Value::Int32(text.trim().parse().map_err(|_| invalid())?),
            ValueType::Float => Value::Float(text.trim().parse().map_err(|_| invalid())?),
            ValueType::Double => Value::Double(text.trim().parse().map_err(|_| invalid())?),
            ValueType::String => Value::String(text.to_string()),
            ValueType::Buffer => Value::Buffer(Bytes::copy_from_slice(text.as_bytes())),
        };
        Ok(value)
    }

    /// Render the value as JSON for API consumers.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Byte(v) => (*v).into(),
            Value::Uint16(v) => (*v).into(),
            Value::Uint32(v) | Value::Crc(v) => (*v).into(),
            Value::Int32(v) => (*v).into(),
            Value::Float(v) => serde_json::Value::from(f64::from(*v)),
            Value::Double(v) => serde_json::Value::from(*v),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Buffer(b) => serde_json::Value::String(hex::encode(b)),
        }
    }
}

/// Encode a single value into its wire form.
pub fn encode(value: &Value) -> Vec<u8> {
    match value {
        Value::Bool(b) => vec![u8::from(*b)],
        Value::Byte(v) => vec![*v],
        Value::Uint16(v) => {
            let mut buf = vec![0u8; 2];
            BigEndian::write_u16(&mut buf, *v);
            buf
        }
        Value::Uint32(v) | Value::Crc(v) => {
            let mut buf = vec![0u8; 4];
            BigEndian::write_u32(&mut buf, *v);
            buf
        }
        Value::Int32(v) => {
            let mut buf = vec![0u8; 4];
            BigEndian::write_i32(&mut buf, *v);
            buf
        }
        Value::Float(v) => {
            let mut buf = vec![0u8; 4];
            BigEndian::write_f32(&mut buf, *v);
            buf
        }
        Value::Double(v) => {
            let mut buf = vec![0u8; 8];
            LittleEndian::write_f64(&mut buf, *v);
            buf
        }
        Value::String(s) => s.as_bytes().to_vec(),
        Value::Buffer(b) => b.to_vec(),
    }
}

/// Decode a value of type `ty` from the start of `data`.
///
/// `String` and `Buffer` consume the whole slice; there is no length prefix.
pub fn decode(ty: ValueType, data: &[u8]) -> Result<Value, ProtocolError> {
    if let Some(size) = ty.fixed_size() {
        if data.len() < size {
            return Err(ProtocolError::InsufficientData {
                expected: size,
                actual: data.len(),
            });
        }
    }
    let value = match ty {
        ValueType::Bool => Value::Bool(data[0] != 0),
        ValueType::Byte => Value::Byte(data[0]),
        ValueType::Uint16 => Value::Uint16(BigEndian::read_u16(data)),
        ValueType::Uint32 => Value::Uint32(BigEndian::read_u32(data)),
        ValueType::Crc => Value::Crc(BigEndian::read_u32(data)),
        ValueType::Int32 => Value::Int32(BigEndian::read_i32(data)),
        ValueType::Float => Value::Float(BigEndian::read_f32(data)),
        ValueType::Double => Value::Double(LittleEndian::read_f64(data)),
        ValueType::String => Value::String(String::from_utf8_lossy(data).into_owned()),
        ValueType::Buffer => Value::Buffer(Bytes::copy_from_slice(data)),
    };
    Ok(value)
}

/// Declared shape of one function argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgSpec {
    pub name: Option<String>,
    pub value_type: ValueType,
}

impl ArgSpec {
    pub fn new(name: Option<&str>, value_type: ValueType) -> Self {
        Self {
            name: name.map(str::to_string),
            value_type,
        }
    }
}

/// Encode arguments in declared order, separated by `&`.
pub fn build_arguments(values: &[&str], specs: &[ArgSpec]) -> Result<Vec<u8>, ProtocolError> {
    if values.len() > specs.len() {
        return Err(ProtocolError::InvalidValue {
            value_type: "arguments".to_string(),
            value: format!("expected at most {} arguments, got {}", specs.len(), values.len()),
        });
    }

    let mut out = Vec::new();
    for (i, spec) in specs.iter().enumerate() {
        if i > 0 {
            out.push(ARGUMENT_SEPARATOR);
        }
        // Missing trailing arguments are sent as empty strings.
        let text = values.get(i).copied().unwrap_or("");
        if text.is_empty() && spec.value_type == ValueType::String {
            continue;
        }
        let value = Value::parse(spec.value_type, text)?;
        out.extend_from_slice(&encode(&value));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: Value) {
        let ty = value.value_type();
        let decoded = decode(ty, &encode(&value)).unwrap();
        assert_eq!(decoded, value, "round trip failed for {ty}");
    }

    #[test]
    fn scalar_roundtrips() {
        roundtrip(Value::Bool(true));
        roundtrip(Value::Bool(false));
        roundtrip(Value::Byte(0xAB));
        roundtrip(Value::Uint16(0));
        roundtrip(Value::Uint16(u16::MAX));
        roundtrip(Value::Uint32(0));
        roundtrip(Value::Uint32(u32::MAX));
        roundtrip(Value::Crc(0xDEADBEEF));
        roundtrip(Value::Int32(-1));
        roundtrip(Value::Int32(i32::MIN));
        roundtrip(Value::Float(3.5));
        roundtrip(Value::Double(-1234.5678));
        roundtrip(Value::Double(f64::MAX));
        roundtrip(Value::String("hello world".to_string()));
        roundtrip(Value::String(String::new()));
        roundtrip(Value::Buffer(Bytes::from_static(&[0, 1, 2, 255])));
    }

    #[test]
    fn integers_are_big_endian() {
        assert_eq!(encode(&Value::Uint32(0x01020304)), vec![1, 2, 3, 4]);
        assert_eq!(encode(&Value::Uint16(0x0102)), vec![1, 2]);
        assert_eq!(encode(&Value::Int32(-2)), vec![0xFF, 0xFF, 0xFF, 0xFE]);
        assert_eq!(encode(&Value::Crc(0xAABBCCDD)), vec![0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn double_is_little_endian() {
        let encoded = encode(&Value::Double(1.0));
        assert_eq!(encoded, 1.0f64.to_le_bytes().to_vec());
        assert_ne!(encoded, 1.0f64.to_be_bytes().to_vec());
        assert_eq!(
            decode(ValueType::Double, &2.5f64.to_le_bytes()).unwrap(),
            Value::Double(2.5)
        );
    }

    #[test]
    fn short_input_is_rejected() {
        let err = decode(ValueType::Uint32, &[1, 2]).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::InsufficientData { expected: 4, actual: 2 }
        ));
    }

    #[test]
    fn string_consumes_whole_buffer() {
        let value = decode(ValueType::String, b"abc&def").unwrap();
        assert_eq!(value, Value::String("abc&def".to_string()));
    }

    #[test]
    fn arguments_are_joined_with_ampersand() {
        let specs = vec![
            ArgSpec::new(Some("a"), ValueType::Int32),
            ArgSpec::new(Some("b"), ValueType::String),
            ArgSpec::new(Some("c"), ValueType::Bool),
        ];
        let built = build_arguments(&["1", "on", "true"], &specs).unwrap();
        assert_eq!(built, vec![0, 0, 0, 1, b'&', b'o', b'n', b'&', 1]);
    }

    #[test]
    fn single_string_argument_has_no_separator() {
        let specs = vec![ArgSpec::new(None, ValueType::String)];
        assert_eq!(build_arguments(&["led,on"], &specs).unwrap(), b"led,on".to_vec());
    }

    #[test]
    fn too_many_arguments_are_rejected() {
        let specs = vec![ArgSpec::new(None, ValueType::String)];
        assert!(build_arguments(&["a", "b"], &specs).is_err());
    }

    #[test]
    fn type_names_and_codes_resolve() {
        assert_eq!(ValueType::from_name("INT32"), Some(ValueType::Int32));
        assert_eq!(ValueType::from_json(&serde_json::json!(9)), Some(ValueType::Double));
        assert_eq!(ValueType::from_json(&serde_json::json!("string")), Some(ValueType::String));
        assert_eq!(ValueType::from_json(&serde_json::json!(200)), None);
    }
}
