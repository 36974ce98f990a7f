use kinject_core::Va;
use serde::{Deserialize, Serialize};

/// The declared type of a [`Parameter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParameterKind {
    /// Signed 8-bit integer.
    Int8,
    /// Unsigned 8-bit integer.
    UInt8,
    /// Signed 16-bit integer.
    Int16,
    /// Unsigned 16-bit integer.
    UInt16,
    /// Signed 32-bit integer.
    Int32,
    /// Unsigned 32-bit integer.
    UInt32,
    /// Signed 64-bit integer.
    Int64,
    /// Unsigned 64-bit integer.
    UInt64,
    /// Boolean.
    Bool,
    /// Single precision float.
    Float,
    /// Double precision float.
    Double,
    /// Pointer of the generator's width.
    Pointer,
}

impl ParameterKind {
    /// Size of the value in bytes when stored in a 64-bit stack slot.
    pub fn size(self) -> usize {
        match self {
            Self::Int8 | Self::UInt8 | Self::Bool => 1,
            Self::Int16 | Self::UInt16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float => 4,
            Self::Int64 | Self::UInt64 | Self::Double | Self::Pointer => 8,
        }
    }

    /// Checks if the value occupies two stack slots on a 32-bit stack.
    pub fn is_wide_on_narrow_stack(self) -> bool {
        matches!(self, Self::Int64 | Self::UInt64 | Self::Double)
    }

    /// Checks if the value is passed in a floating point register.
    pub fn is_floating(self) -> bool {
        matches!(self, Self::Float | Self::Double)
    }
}

/// One typed call argument.
///
/// The value is kept in 8 bytes of storage; narrower kinds occupy the low
/// bytes and the rest is zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Parameter {
    /// The declared type.
    pub kind: ParameterKind,

    /// The raw value.
    pub value: u64,
}

impl Parameter {
    /// Creates a parameter of the given kind, masking the value to its size.
    pub fn new(kind: ParameterKind, value: u64) -> Self {
        let value = match kind.size() {
            1 => value & 0xFF,
            2 => value & 0xFFFF,
            4 => value & 0xFFFF_FFFF,
            _ => value,
        };

        Self { kind, value }
    }

    /// Returns the low 8 bits.
    pub fn low8(&self) -> u8 {
        self.value as u8
    }

    /// Returns the low 16 bits.
    pub fn low16(&self) -> u16 {
        self.value as u16
    }

    /// Returns the low 32 bits.
    pub fn low32(&self) -> u32 {
        self.value as u32
    }

    /// Returns the high 32 bits.
    pub fn high32(&self) -> u32 {
        (self.value >> 32) as u32
    }
}

macro_rules! impl_from {
    ($($t:ty => $kind:ident),* $(,)?) => {
        $(
            impl From<$t> for Parameter {
                fn from(value: $t) -> Self {
                    Self::new(ParameterKind::$kind, value as u64)
                }
            }
        )*
    };
}

impl_from!(
    i8 => Int8,
    u8 => UInt8,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    i64 => Int64,
    u64 => UInt64,
);

impl From<bool> for Parameter {
    fn from(value: bool) -> Self {
        Self::new(ParameterKind::Bool, value as u64)
    }
}

impl From<f32> for Parameter {
    fn from(value: f32) -> Self {
        Self::new(ParameterKind::Float, value.to_bits() as u64)
    }
}

impl From<f64> for Parameter {
    fn from(value: f64) -> Self {
        Self::new(ParameterKind::Double, value.to_bits())
    }
}

impl From<Va> for Parameter {
    fn from(value: Va) -> Self {
        Self::new(ParameterKind::Pointer, value.0)
    }
}
