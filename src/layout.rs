//! Slot record layouts.
//!
//! A ring buffer stores fixed-size slots. Each slot holds `channels`
//! items of one layout: either a single numeric element type (a slot is
//! then a flat array of scalars) or a packed record of named numeric
//! fields. Layouts are fixed at buffer creation and validated when they
//! are lowered from the setup file's type strings.

use serde_yaml::Value;

use crate::config_error;
use crate::error::{Result, SluiceError};

/// Closed set of numeric element types a slot can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
}

impl ElementType {
    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::U16 | Self::I16 => 2,
            Self::U32 | Self::I32 | Self::F32 => 4,
            Self::U64 | Self::I64 | Self::F64 => 8,
        }
    }

    /// Canonical name used in setup files and diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            Self::U8 => "uint8",
            Self::U16 => "uint16",
            Self::U32 => "uint32",
            Self::U64 => "uint64",
            Self::I8 => "int8",
            Self::I16 => "int16",
            Self::I32 => "int32",
            Self::I64 => "int64",
            Self::F32 => "float32",
            Self::F64 => "float64",
        }
    }

    /// Parse a canonical type name. Accepts the short aliases the
    /// original numpy-style setup files use (`float`, `int`, `uint`,
    /// `double`).
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "uint8" => Some(Self::U8),
            "uint16" => Some(Self::U16),
            "uint32" => Some(Self::U32),
            "uint64" | "uint" => Some(Self::U64),
            "int8" => Some(Self::I8),
            "int16" => Some(Self::I16),
            "int32" => Some(Self::I32),
            "int64" | "int" => Some(Self::I64),
            "float32" => Some(Self::F32),
            "float64" | "float" | "double" => Some(Self::F64),
            _ => None,
        }
    }
}

impl std::fmt::Display for ElementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

mod sealed {
    pub trait Sealed {}
}

/// Rust scalar types that can view slot storage directly.
pub trait Element: Copy + Default + sealed::Sealed + 'static {
    /// The layout element type this Rust type corresponds to.
    const TYPE: ElementType;
}

macro_rules! impl_element {
    ($($rust:ty => $variant:ident),* $(,)?) => {
        $(
            impl sealed::Sealed for $rust {}
            impl Element for $rust {
                const TYPE: ElementType = ElementType::$variant;
            }
        )*
    };
}

impl_element! {
    u8 => U8, u16 => U16, u32 => U32, u64 => U64,
    i8 => I8, i16 => I16, i32 => I32, i64 => I64,
    f32 => F32, f64 => F64,
}

/// One named field of a record layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    /// Field name, unique within the record.
    pub name: String,
    /// Element type of the field.
    pub ty: ElementType,
}

/// Layout of one slot item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotLayout {
    /// Homogeneous scalars; a slot holds `channels` of them.
    Scalar(ElementType),
    /// Packed record of named fields; a slot holds `channels` records.
    Record(Vec<FieldDef>),
}

impl SlotLayout {
    /// Scalar layout of the given element type.
    pub fn scalar(ty: ElementType) -> Self {
        Self::Scalar(ty)
    }

    /// Record layout; fields must be non-empty with unique names.
    pub fn record(fields: Vec<FieldDef>) -> Result<Self> {
        if fields.is_empty() {
            return Err(SluiceError::config("record layout needs at least one field"));
        }
        for (i, f) in fields.iter().enumerate() {
            if fields[..i].iter().any(|g| g.name == f.name) {
                return Err(config_error!("duplicate record field '{}'", f.name));
            }
        }
        Ok(Self::Record(fields))
    }

    /// Size in bytes of one item (one scalar, or one packed record).
    pub fn item_size(&self) -> usize {
        match self {
            Self::Scalar(ty) => ty.size(),
            Self::Record(fields) => fields.iter().map(|f| f.ty.size()).sum(),
        }
    }

    /// Byte offset and type of a record field, if present.
    pub fn field(&self, name: &str) -> Option<(usize, ElementType)> {
        match self {
            Self::Scalar(_) => None,
            Self::Record(fields) => {
                let mut off = 0;
                for f in fields {
                    if f.name == name {
                        return Some((off, f.ty));
                    }
                    off += f.ty.size();
                }
                None
            }
        }
    }

    /// Lower a setup-file `data_type` value.
    ///
    /// Accepts either a scalar type name (`"float"`, `"uint8"`, ...) or
    /// a mapping whose values are `[field_name, type_name]` pairs; the
    /// mapping order defines the field order.
    pub fn from_spec(value: &Value) -> Result<Self> {
        match value {
            Value::String(name) => ElementType::parse(name)
                .map(Self::Scalar)
                .ok_or_else(|| config_error!("unknown data type '{}'", name)),
            Value::Mapping(entries) => {
                let mut fields = Vec::with_capacity(entries.len());
                for (key, pair) in entries {
                    let items = pair.as_sequence().ok_or_else(|| {
                        config_error!("record entry '{:?}' is not a [name, type] pair", key)
                    })?;
                    let (name, ty_name) = match items.as_slice() {
                        [Value::String(n), Value::String(t)] => (n, t),
                        _ => {
                            return Err(config_error!(
                                "record entry '{:?}' is not a [name, type] pair",
                                key
                            ))
                        }
                    };
                    let ty = ElementType::parse(ty_name)
                        .ok_or_else(|| config_error!("unknown data type '{}'", ty_name))?;
                    fields.push(FieldDef {
                        name: name.clone(),
                        ty,
                    });
                }
                Self::record(fields)
            }
            other => Err(config_error!(
                "data_type must be a type name or a field mapping, got {:?}",
                other
            )),
        }
    }

    /// Human-readable form for the layout display.
    pub fn describe(&self) -> String {
        match self {
            Self::Scalar(ty) => ty.name().to_string(),
            Self::Record(fields) => {
                let parts: Vec<String> = fields
                    .iter()
                    .map(|f| format!("{}:{}", f.name, f.ty))
                    .collect();
                format!("{{{}}}", parts.join(", "))
            }
        }
    }

    /// Column labels of one item, for display workers and text sinks.
    pub fn value_names(&self) -> Vec<String> {
        match self {
            Self::Scalar(_) => vec!["value".to_string()],
            Self::Record(fields) => fields.iter().map(|f| f.name.clone()).collect(),
        }
    }

    /// Read every value of one item as `f64`, from a raw slot payload.
    /// Lossy for 64-bit integers beyond 2^53; meant for display and
    /// histogramming, not for round-tripping data.
    pub fn item_values_f64(&self, payload: &[u8], channel: usize) -> Vec<f64> {
        let base = channel * self.item_size();
        match self {
            Self::Scalar(ty) => vec![read_scalar_f64(payload, base, *ty)],
            Self::Record(fields) => {
                let mut off = base;
                fields
                    .iter()
                    .map(|f| {
                        let v = read_scalar_f64(payload, off, f.ty);
                        off += f.ty.size();
                        v
                    })
                    .collect()
            }
        }
    }

    /// Verify that the slot may be viewed as a slice of `T` scalars.
    pub(crate) fn check_scalar<T: Element>(&self) -> Result<()> {
        match self {
            Self::Scalar(ty) if *ty == T::TYPE => Ok(()),
            Self::Scalar(ty) => Err(SluiceError::misuse(format!(
                "slot holds {} scalars, not {}",
                ty,
                T::TYPE
            ))),
            Self::Record(_) => Err(SluiceError::misuse(
                "slot holds records; use field access".to_string(),
            )),
        }
    }

    /// Verify and locate a record field of type `T`.
    pub(crate) fn check_field<T: Element>(&self, name: &str) -> Result<usize> {
        let (off, ty) = self
            .field(name)
            .ok_or_else(|| SluiceError::misuse(format!("no record field '{name}'")))?;
        if ty != T::TYPE {
            return Err(SluiceError::misuse(format!(
                "field '{name}' holds {ty}, not {}",
                T::TYPE
            )));
        }
        Ok(off)
    }
}

fn read_scalar_f64(payload: &[u8], offset: usize, ty: ElementType) -> f64 {
    assert!(offset + ty.size() <= payload.len(), "value read out of bounds");
    let p = payload[offset..].as_ptr();
    // SAFETY: bounds asserted above; records are packed, hence the
    // unaligned reads.
    unsafe {
        match ty {
            ElementType::U8 => p.cast::<u8>().read_unaligned() as f64,
            ElementType::U16 => p.cast::<u16>().read_unaligned() as f64,
            ElementType::U32 => p.cast::<u32>().read_unaligned() as f64,
            ElementType::U64 => p.cast::<u64>().read_unaligned() as f64,
            ElementType::I8 => p.cast::<i8>().read_unaligned() as f64,
            ElementType::I16 => p.cast::<i16>().read_unaligned() as f64,
            ElementType::I32 => p.cast::<i32>().read_unaligned() as f64,
            ElementType::I64 => p.cast::<i64>().read_unaligned() as f64,
            ElementType::F32 => p.cast::<f32>().read_unaligned() as f64,
            ElementType::F64 => p.cast::<f64>().read_unaligned(),
        }
    }
}
