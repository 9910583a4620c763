pub use half::f16;

use crate::error::{Error, Result};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub enum Dtype {
    Half,
    Float,
    Double,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
}

impl core::fmt::Display for Dtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_type", self.c_name().replace(' ', "_"))
    }
}

impl Dtype {
    pub const ALL: [Dtype; 11] = [
        Dtype::Half,
        Dtype::Float,
        Dtype::Double,
        Dtype::Int8,
        Dtype::Int16,
        Dtype::Int32,
        Dtype::Int64,
        Dtype::UInt8,
        Dtype::UInt16,
        Dtype::UInt32,
        Dtype::UInt64,
    ];

    pub fn size(&self) -> usize {
        match self {
            Dtype::Int8 | Dtype::UInt8 => 1,
            Dtype::Half | Dtype::Int16 | Dtype::UInt16 => 2,
            Dtype::Float | Dtype::Int32 | Dtype::UInt32 => 4,
            Dtype::Double | Dtype::Int64 | Dtype::UInt64 => 8,
        }
    }

    /// Name of the element type in C-like kernel source.
    pub fn c_name(&self) -> &'static str {
        match self {
            Dtype::Half => "half",
            Dtype::Float => "float",
            Dtype::Double => "double",
            Dtype::Int8 => "char",
            Dtype::Int16 => "short",
            Dtype::Int32 => "int",
            Dtype::Int64 => "long long",
            Dtype::UInt8 => "unsigned char",
            Dtype::UInt16 => "unsigned short",
            Dtype::UInt32 => "unsigned int",
            Dtype::UInt64 => "unsigned long long",
        }
    }

    /// Python `struct` format character, used by the buffer export view.
    pub fn format(&self) -> Result<&'static str> {
        Ok(match self {
            Dtype::Half => return Err(Error::UnsupportedType("half not supported".into())),
            Dtype::Float => "f",
            Dtype::Double => "d",
            Dtype::Int8 => "b",
            Dtype::Int16 => "h",
            Dtype::Int32 => "i",
            Dtype::Int64 => "q",
            Dtype::UInt8 => "B",
            Dtype::UInt16 => "H",
            Dtype::UInt32 => "I",
            Dtype::UInt64 => "Q",
        })
    }

    pub fn is_float(&self) -> bool {
        matches!(*self, Dtype::Half | Dtype::Float | Dtype::Double)
    }
}

pub trait NumType:
    'static
    + core::fmt::Debug
    + core::fmt::Display
    + Default
    + Copy
    + Send
    + Sync
    + num_traits::FromPrimitive
    + num_traits::ToPrimitive
    + num_traits::NumCast
    + num_traits::Num
    + core::ops::AddAssign
    + core::ops::MulAssign
    + PartialEq
    + PartialOrd
{
    const DTYPE: Dtype;

    fn from_le_bytes(bytes: &[u8]) -> Self;
    fn _to_le_bytes(&self) -> Vec<u8>;
}

macro_rules! NumTypeImpl {
    ($t:tt, $dtype:ident) => {
        impl NumType for $t {
            const DTYPE: Dtype = Dtype::$dtype;

            fn from_le_bytes(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$t>()];
                raw.copy_from_slice(&bytes[..std::mem::size_of::<$t>()]);
                $t::from_le_bytes(raw)
            }
            fn _to_le_bytes(&self) -> Vec<u8> {
                self.to_le_bytes().to_vec()
            }
        }
    };
}

NumTypeImpl!(f16, Half);
NumTypeImpl!(f32, Float);
NumTypeImpl!(f64, Double);
NumTypeImpl!(i8, Int8);
NumTypeImpl!(i16, Int16);
NumTypeImpl!(i32, Int32);
NumTypeImpl!(i64, Int64);
NumTypeImpl!(u8, UInt8);
NumTypeImpl!(u16, UInt16);
NumTypeImpl!(u32, UInt32);
NumTypeImpl!(u64, UInt64);

/// Float element types the numeric kernels are generic over.
pub trait FloatType: NumType + num_traits::Float {}

impl FloatType for f16 {}
impl FloatType for f32 {}
impl FloatType for f64 {}

/// Runs `$body` with `$t` bound to the Rust type of `$dtype`. Every kind is
/// covered, so adding a kind fails to compile here first.
#[macro_export]
macro_rules! visit_dtype {
    ($dtype:expr, $t:ident => $body:expr) => {
        match $dtype {
            $crate::dtype::Dtype::Half => {
                type $t = $crate::dtype::f16;
                $body
            }
            $crate::dtype::Dtype::Float => {
                type $t = f32;
                $body
            }
            $crate::dtype::Dtype::Double => {
                type $t = f64;
                $body
            }
            $crate::dtype::Dtype::Int8 => {
                type $t = i8;
                $body
            }
            $crate::dtype::Dtype::Int16 => {
                type $t = i16;
                $body
            }
            $crate::dtype::Dtype::Int32 => {
                type $t = i32;
                $body
            }
            $crate::dtype::Dtype::Int64 => {
                type $t = i64;
                $body
            }
            $crate::dtype::Dtype::UInt8 => {
                type $t = u8;
                $body
            }
            $crate::dtype::Dtype::UInt16 => {
                type $t = u16;
                $body
            }
            $crate::dtype::Dtype::UInt32 => {
                type $t = u32;
                $body
            }
            $crate::dtype::Dtype::UInt64 => {
                type $t = u64;
                $body
            }
        }
    };
}

/// Like `visit_dtype!` for float kinds; integer kinds evaluate `$other`.
#[macro_export]
macro_rules! visit_float {
    ($dtype:expr, $t:ident => $body:expr, _ => $other:expr) => {
        match $dtype {
            $crate::dtype::Dtype::Half => {
                type $t = $crate::dtype::f16;
                $body
            }
            $crate::dtype::Dtype::Float => {
                type $t = f32;
                $body
            }
            $crate::dtype::Dtype::Double => {
                type $t = f64;
                $body
            }
            _ => $other,
        }
    };
}
