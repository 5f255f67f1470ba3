//! Value encoding/decoding for bus parameters.
//!
//! Every parameter value travels as a little-endian scalar, a single
//! zero-or-not byte, or a NUL-terminated UTF-8 string, selected by the
//! type code carried in the parameter's metadata. Floats are quantized to
//! two decimals on decode so the cache holds identical values across
//! polls.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Parameter data types as they appear on the wire.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum DataType {
    Int8 = 1,
    Int16 = 2,
    Int32 = 3,
    Uint8 = 4,
    Uint16 = 5,
    Uint32 = 6,
    Float = 7,
    Double = 9,
    Bool = 10,
    String = 12,
    Int64 = 13,
    Uint64 = 14,
}

impl DataType {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => Self::Int8,
            2 => Self::Int16,
            3 => Self::Int32,
            4 => Self::Uint8,
            5 => Self::Uint16,
            6 => Self::Uint32,
            7 => Self::Float,
            9 => Self::Double,
            10 => Self::Bool,
            12 => Self::String,
            13 => Self::Int64,
            14 => Self::Uint64,
            _ => return None,
        })
    }

    /// Fixed wire width in bytes; `None` for strings (NUL-terminated).
    pub fn wire_size(self) -> Option<usize> {
        Some(match self {
            Self::Int8 | Self::Uint8 | Self::Bool => 1,
            Self::Int16 | Self::Uint16 => 2,
            Self::Int32 | Self::Uint32 | Self::Float => 4,
            Self::Double | Self::Int64 | Self::Uint64 => 8,
            Self::String => return None,
        })
    }

    /// Whether literal range halves for this type decode as unsigned.
    pub fn is_unsigned(self) -> bool {
        matches!(self, Self::Uint8 | Self::Uint16 | Self::Uint32 | Self::Uint64)
    }
}

/// A runtime-typed parameter value. Only this module inspects the tag;
/// everything else treats it as opaque.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    Str(String),
}

impl Value {
    /// Numeric view for range checks; strings have none.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Int(v) => Some(*v as f64),
            Value::Uint(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Str(_) => None,
        }
    }

    fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Int(v) => Some(*v),
            Value::Uint(v) => i64::try_from(*v).ok(),
            Value::Float(v) => Some(*v as i64),
            Value::Str(_) => None,
        }
    }

    fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Bool(b) => Some(u64::from(*b)),
            Value::Int(v) => u64::try_from(*v).ok(),
            Value::Uint(v) => Some(*v),
            Value::Float(v) if *v >= 0.0 => Some(*v as u64),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unsupported type code {0}")]
    UnknownType(u8),
    #[error("insufficient data for {0:?}")]
    Truncated(DataType),
    #[error("value not representable as {0:?}")]
    ValueMismatch(DataType),
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn take<const N: usize>(data: &[u8], ty: DataType) -> Result<[u8; N], CodecError> {
    if data.len() < N {
        return Err(CodecError::Truncated(ty));
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&data[..N]);
    Ok(out)
}

/// Decode a wire value of the given type code.
pub fn decode_value(data: &[u8], type_code: u8) -> Result<Value, CodecError> {
    let ty = DataType::from_code(type_code).ok_or(CodecError::UnknownType(type_code))?;
    Ok(match ty {
        DataType::Int8 => Value::Int(i8::from_le_bytes(take::<1>(data, ty)?) as i64),
        DataType::Int16 => Value::Int(i16::from_le_bytes(take::<2>(data, ty)?) as i64),
        DataType::Int32 => Value::Int(i32::from_le_bytes(take::<4>(data, ty)?) as i64),
        DataType::Int64 => Value::Int(i64::from_le_bytes(take::<8>(data, ty)?)),
        DataType::Uint8 => Value::Uint(u8::from_le_bytes(take::<1>(data, ty)?) as u64),
        DataType::Uint16 => Value::Uint(u16::from_le_bytes(take::<2>(data, ty)?) as u64),
        DataType::Uint32 => Value::Uint(u32::from_le_bytes(take::<4>(data, ty)?) as u64),
        DataType::Uint64 => Value::Uint(u64::from_le_bytes(take::<8>(data, ty)?)),
        DataType::Float => {
            Value::Float(round2(f32::from_le_bytes(take::<4>(data, ty)?) as f64))
        }
        DataType::Double => Value::Float(round2(f64::from_le_bytes(take::<8>(data, ty)?))),
        DataType::Bool => Value::Bool(take::<1>(data, ty)?[0] != 0),
        DataType::String => {
            let text = match data.iter().position(|&b| b == 0) {
                Some(nul) => &data[..nul],
                None => data,
            };
            Value::Str(String::from_utf8_lossy(text).into_owned())
        }
    })
}

/// Encode a value for transmission as the given type code. Rejects
/// unknown type codes and values the type cannot carry.
pub fn encode_value(value: &Value, type_code: u8) -> Result<Vec<u8>, CodecError> {
    let ty = DataType::from_code(type_code).ok_or(CodecError::UnknownType(type_code))?;
    let mismatch = || CodecError::ValueMismatch(ty);

    Ok(match ty {
        DataType::Int8 => {
            let v = i8::try_from(value.as_i64().ok_or_else(mismatch)?).map_err(|_| mismatch())?;
            v.to_le_bytes().to_vec()
        }
        DataType::Int16 => {
            let v = i16::try_from(value.as_i64().ok_or_else(mismatch)?).map_err(|_| mismatch())?;
            v.to_le_bytes().to_vec()
        }
        DataType::Int32 => {
            let v = i32::try_from(value.as_i64().ok_or_else(mismatch)?).map_err(|_| mismatch())?;
            v.to_le_bytes().to_vec()
        }
        DataType::Int64 => value.as_i64().ok_or_else(mismatch)?.to_le_bytes().to_vec(),
        DataType::Uint8 => {
            let v = u8::try_from(value.as_u64().ok_or_else(mismatch)?).map_err(|_| mismatch())?;
            v.to_le_bytes().to_vec()
        }
        DataType::Uint16 => {
            let v = u16::try_from(value.as_u64().ok_or_else(mismatch)?).map_err(|_| mismatch())?;
            v.to_le_bytes().to_vec()
        }
        DataType::Uint32 => {
            let v = u32::try_from(value.as_u64().ok_or_else(mismatch)?).map_err(|_| mismatch())?;
            v.to_le_bytes().to_vec()
        }
        DataType::Uint64 => value.as_u64().ok_or_else(mismatch)?.to_le_bytes().to_vec(),
        DataType::Float => {
            let v = value.as_f64().ok_or_else(mismatch)?;
            (v as f32).to_le_bytes().to_vec()
        }
        DataType::Double => value.as_f64().ok_or_else(mismatch)?.to_le_bytes().to_vec(),
        DataType::Bool => {
            let truthy = match value {
                Value::Bool(b) => *b,
                Value::Int(v) => *v != 0,
                Value::Uint(v) => *v != 0,
                Value::Float(v) => *v != 0.0,
                Value::Str(_) => return Err(mismatch()),
            };
            vec![u8::from(truthy)]
        }
        DataType::String => {
            let Value::Str(text) = value else {
                return Err(mismatch());
            };
            let mut out = text.clone().into_bytes();
            out.push(0);
            out
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_scalars_are_little_endian() {
        assert_eq!(encode_value(&Value::Int(45), 2).unwrap(), vec![0x2D, 0x00]);
        assert_eq!(decode_value(&[0x2D, 0x00], 2).unwrap(), Value::Int(45));
        assert_eq!(decode_value(&[0xFF, 0xFF], 2).unwrap(), Value::Int(-1));
        assert_eq!(
            encode_value(&Value::Int(-2), 3).unwrap(),
            vec![0xFE, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn unsigned_scalars_do_not_sign_extend() {
        assert_eq!(decode_value(&[0xFF, 0xFF], 5).unwrap(), Value::Uint(65535));
        assert_eq!(decode_value(&[0x80], 4).unwrap(), Value::Uint(128));
    }

    #[test]
    fn floats_round_to_two_decimals() {
        let bytes = 21.987_f32.to_le_bytes();
        assert_eq!(decode_value(&bytes, 7).unwrap(), Value::Float(21.99));

        let bytes = 3.14159_f64.to_le_bytes();
        assert_eq!(decode_value(&bytes, 9).unwrap(), Value::Float(3.14));
    }

    #[test]
    fn bool_is_any_nonzero_byte() {
        assert_eq!(decode_value(&[0x00], 10).unwrap(), Value::Bool(false));
        assert_eq!(decode_value(&[0x01], 10).unwrap(), Value::Bool(true));
        assert_eq!(decode_value(&[0x7A], 10).unwrap(), Value::Bool(true));
        assert_eq!(encode_value(&Value::Bool(true), 10).unwrap(), vec![1]);
    }

    #[test]
    fn strings_are_nul_terminated_and_lossy() {
        assert_eq!(
            encode_value(&Value::Str("On".into()), 12).unwrap(),
            vec![b'O', b'n', 0]
        );
        assert_eq!(
            decode_value(&[b'O', b'n', 0, b'x'], 12).unwrap(),
            Value::Str("On".into())
        );
        // Malformed UTF-8 decodes lossily instead of failing the poll.
        let decoded = decode_value(&[0xFF, 0xFE, 0], 12).unwrap();
        assert!(matches!(decoded, Value::Str(s) if !s.is_empty()));
        // Missing terminator: take everything.
        assert_eq!(
            decode_value(&[b'H', b'i'], 12).unwrap(),
            Value::Str("Hi".into())
        );
    }

    #[test]
    fn encode_rejects_unknown_and_unrepresentable() {
        assert_eq!(
            encode_value(&Value::Int(1), 8),
            Err(CodecError::UnknownType(8))
        );
        assert_eq!(
            encode_value(&Value::Int(300), 1),
            Err(CodecError::ValueMismatch(DataType::Int8))
        );
        assert_eq!(
            encode_value(&Value::Int(-1), 4),
            Err(CodecError::ValueMismatch(DataType::Uint8))
        );
        assert_eq!(
            encode_value(&Value::Str("x".into()), 2),
            Err(CodecError::ValueMismatch(DataType::Int16))
        );
    }

    #[test]
    fn decode_rejects_short_buffers() {
        assert_eq!(
            decode_value(&[0x01], 3),
            Err(CodecError::Truncated(DataType::Int32))
        );
        assert_eq!(decode_value(&[], 10), Err(CodecError::Truncated(DataType::Bool)));
    }

    #[test]
    fn wire_sizes_match_type_table() {
        let expected = [
            (1u8, 1usize),
            (2, 2),
            (3, 4),
            (4, 1),
            (5, 2),
            (6, 4),
            (7, 4),
            (9, 8),
            (10, 1),
            (13, 8),
            (14, 8),
        ];
        for (code, size) in expected {
            assert_eq!(DataType::from_code(code).unwrap().wire_size(), Some(size));
        }
        assert_eq!(DataType::String.wire_size(), None);
    }
}
