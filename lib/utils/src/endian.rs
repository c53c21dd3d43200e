//! ## Endianness Module
//! This module provides some structs to better resolve the data in specific endianness rules
//!
//! All the types declared here implement [EndianData<T>],
//! which defines [EndianData<T>::value] function to parse the data into the endianness of the current arch.
//! Values are built from raw bytes with `from_bytes`, so a reader never has to
//! assume its source buffer is aligned.

///[u32] in Big Endianness
#[derive(Debug, Clone, Copy)]
pub struct BigEndian32(u32);

///[u64] in Big Endianness
#[derive(Debug, Clone, Copy)]
pub struct BigEndian64(u64);

/// This trait defines a packed data in memory with some specific endianness.
pub trait EndianData<T>: Copy + Clone {
    /// Parse the value into the endianness of the current architecture.
    fn value(&self) -> T;
}

/// Implement an [EndianData<T>] for a specific type, and explain the data in big endianess
macro_rules! impl_converter_big {
    ($type: tt, $tval: tt) => {
        impl $type {
            /// Wrap raw bytes taken from a big-endian stream.
            #[inline(always)]
            pub const fn from_bytes(bytes: [u8; size_of::<$tval>()]) -> $type {
                $type($tval::from_ne_bytes(bytes))
            }
        }

        impl EndianData<$tval> for $type {
            #[inline(always)]
            fn value(&self) -> $tval {
                if cfg!(target_endian = "big") {
                    self.0 // keep
                } else {
                    self.0.to_be() // reverse
                }
            }
        }
    };
}

impl_converter_big!(BigEndian32, u32);
impl_converter_big!(BigEndian64, u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn big_endian_32_decodes_msb_first() {
        let data = BigEndian32::from_bytes([0x12, 0x34, 0x56, 0x78]);
        assert_eq!(data.value(), 0x1234_5678);
    }

    #[test]
    fn big_endian_64_decodes_msb_first() {
        let data = BigEndian64::from_bytes([0, 0, 0, 1, 0, 0, 0, 2]);
        assert_eq!(data.value(), 0x1_0000_0002);
    }
}
