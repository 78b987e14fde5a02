//! The `Serializer<T>` contract.
//!
//! Keys and values stored in a [`crate::btree::BTree`] are opaque to the
//! tree: callers supply a [`Serializer`] that encodes/decodes a fixed
//! number of bytes deterministically. Comparison of decoded keys is left
//! to the caller's own `Ord` impl (or an injected comparator) — the tree
//! never peeks inside the encoded bytes.

use crate::error::Result;

/// Encodes and decodes a fixed-size, deterministic representation of `T`.
///
/// `DATA_SIZE` must be constant for a given serializer instance: every
/// call to `encode` must produce exactly that many bytes, and `decode`
/// must consume exactly that many. Node layout (`BTreeNode`, slot
/// arithmetic) depends on this being true.
pub trait Serializer<T> {
    /// Number of bytes every encoded value occupies.
    fn data_size(&self) -> usize;

    /// Encodes `value` into `out`, which is exactly `data_size()` bytes.
    fn encode(&self, value: &T, out: &mut [u8]) -> Result<()>;

    /// Decodes a value from `bytes`, which is exactly `data_size()` bytes.
    fn decode(&self, bytes: &[u8]) -> Result<T>;
}

/// A `Serializer` for any type whose encoding is a plain fixed-width
/// byte array, built from `to_le_bytes`/`from_le_bytes`-style round trips.
/// Used heavily in tests and by callers whose keys are plain integers.
macro_rules! impl_int_serializer {
    ($name:ident, $ty:ty, $size:expr) => {
        #[derive(Clone, Copy, Debug, Default)]
        pub struct $name;

        impl Serializer<$ty> for $name {
            fn data_size(&self) -> usize {
                $size
            }

            fn encode(&self, value: &$ty, out: &mut [u8]) -> Result<()> {
                out.copy_from_slice(&value.to_le_bytes());
                Ok(())
            }

            fn decode(&self, bytes: &[u8]) -> Result<$ty> {
                let mut buf = [0u8; $size];
                buf.copy_from_slice(bytes);
                Ok(<$ty>::from_le_bytes(buf))
            }
        }
    };
}

impl_int_serializer!(I64Serializer, i64, 8);
impl_int_serializer!(U64Serializer, u64, 8);
impl_int_serializer!(I32Serializer, i32, 4);
impl_int_serializer!(U32Serializer, u32, 4);

/// A serializer for fixed-width byte blobs: encode/decode are a straight
/// copy. Useful for opaque values whose size is known up front (e.g. a
/// pre-serialized user record padded to a fixed width by the caller).
#[derive(Clone, Copy, Debug)]
pub struct FixedBytesSerializer {
    size: usize,
}

impl FixedBytesSerializer {
    pub fn new(size: usize) -> Self {
        FixedBytesSerializer { size }
    }
}

impl Serializer<Vec<u8>> for FixedBytesSerializer {
    fn data_size(&self) -> usize {
        self.size
    }

    fn encode(&self, value: &Vec<u8>, out: &mut [u8]) -> Result<()> {
        debug_assert_eq!(value.len(), self.size);
        out.copy_from_slice(value);
        Ok(())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_serializer_round_trips() {
        let s = I64Serializer;
        let mut buf = [0u8; 8];
        s.encode(&-42i64, &mut buf).unwrap();
        assert_eq!(s.decode(&buf).unwrap(), -42i64);
    }

    #[test]
    fn fixed_bytes_round_trip() {
        let s = FixedBytesSerializer::new(4);
        let mut buf = [0u8; 4];
        s.encode(&vec![1, 2, 3, 4], &mut buf).unwrap();
        assert_eq!(s.decode(&buf).unwrap(), vec![1, 2, 3, 4]);
    }
}
