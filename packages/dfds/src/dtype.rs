use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DfdsError;

/// Width-tagged element type of a field.
///
/// Serialized as the short metadata code (`"f32"`, `"u8"`, `"bytes"`, ...),
/// so a descriptor read from disk and written back keeps its codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    #[serde(rename = "f16")]
    F16,
    #[serde(rename = "f32")]
    F32,
    #[serde(rename = "f64")]
    F64,
    #[serde(rename = "i8")]
    I8,
    #[serde(rename = "i16")]
    I16,
    #[serde(rename = "i32")]
    I32,
    #[serde(rename = "u8")]
    U8,
    #[serde(rename = "u16")]
    U16,
    #[serde(rename = "u32")]
    U32,
    #[serde(rename = "bytes")]
    Bytes,
}

impl DType {
    pub const ALL: [DType; 10] = [
        DType::F16,
        DType::F32,
        DType::F64,
        DType::I8,
        DType::I16,
        DType::I32,
        DType::U8,
        DType::U16,
        DType::U32,
        DType::Bytes,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            DType::F16 => "f16",
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::I8 => "i8",
            DType::I16 => "i16",
            DType::I32 => "i32",
            DType::U8 => "u8",
            DType::U16 => "u16",
            DType::U32 => "u32",
            DType::Bytes => "bytes",
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DType::F16 | DType::F32 | DType::F64)
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            DType::I8 | DType::I16 | DType::I32 | DType::U8 | DType::U16 | DType::U32
        )
    }

    /// Narrowest integer code that holds every value in `min..=max`.
    pub fn for_int_range(min: i64, max: i64) -> DType {
        if min >= 0 {
            if max <= u8::MAX as i64 {
                return DType::U8;
            }
            if max <= u16::MAX as i64 {
                return DType::U16;
            }
            if max <= u32::MAX as i64 {
                return DType::U32;
            }
        } else {
            if min >= i8::MIN as i64 && max <= i8::MAX as i64 {
                return DType::I8;
            }
            if min >= i16::MIN as i64 && max <= i16::MAX as i64 {
                return DType::I16;
            }
            if min >= i32::MIN as i64 && max <= i32::MAX as i64 {
                return DType::I32;
            }
        }
        DType::F64
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for DType {
    type Err = DfdsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DType::ALL
            .iter()
            .copied()
            .find(|d| d.code() == s)
            .ok_or_else(|| DfdsError::Parse(format!("unknown dtype code: {}", s)))
    }
}
