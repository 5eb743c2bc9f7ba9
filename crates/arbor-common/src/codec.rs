//! Fixed-width encoding of keys and values stored in index pages.

use crate::page::PageId;

/// A type with a fixed-width byte encoding.
///
/// Index pages store keys and values at a fixed stride, so every encodable
/// type declares its encoded length up front. Integers use little-endian
/// encoding; ordering is defined by the decoded value, not the bytes.
pub trait FixedCodec: Copy {
    /// Number of bytes this type occupies in a page slot.
    const ENCODED_LEN: usize;

    /// Writes the encoding into `buf[..ENCODED_LEN]`.
    fn encode_into(&self, buf: &mut [u8]);

    /// Reads a value back from `buf[..ENCODED_LEN]`.
    fn decode_from(buf: &[u8]) -> Self;
}

macro_rules! impl_fixed_codec_int {
    ($($ty:ty),*) => {
        $(
            impl FixedCodec for $ty {
                const ENCODED_LEN: usize = std::mem::size_of::<$ty>();

                #[inline]
                fn encode_into(&self, buf: &mut [u8]) {
                    buf[..Self::ENCODED_LEN].copy_from_slice(&self.to_le_bytes());
                }

                #[inline]
                fn decode_from(buf: &[u8]) -> Self {
                    let mut raw = [0u8; Self::ENCODED_LEN];
                    raw.copy_from_slice(&buf[..Self::ENCODED_LEN]);
                    <$ty>::from_le_bytes(raw)
                }
            }
        )*
    };
}

impl_fixed_codec_int!(u16, u32, u64, i16, i32, i64);

impl FixedCodec for PageId {
    const ENCODED_LEN: usize = 4;

    #[inline]
    fn encode_into(&self, buf: &mut [u8]) {
        buf[..4].copy_from_slice(&self.0.to_le_bytes());
    }

    #[inline]
    fn decode_from(buf: &[u8]) -> Self {
        PageId(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::INVALID_PAGE_ID;

    fn roundtrip<T: FixedCodec + PartialEq + std::fmt::Debug>(value: T) {
        let mut buf = vec![0u8; T::ENCODED_LEN];
        value.encode_into(&mut buf);
        assert_eq!(T::decode_from(&buf), value);
    }

    #[test]
    fn test_integer_roundtrips() {
        roundtrip(0u32);
        roundtrip(u32::MAX);
        roundtrip(-1i32);
        roundtrip(i64::MIN);
        roundtrip(i64::MAX);
        roundtrip(42u64);
        roundtrip(7u16);
        roundtrip(-300i16);
    }

    #[test]
    fn test_page_id_roundtrip() {
        roundtrip(PageId::new(0));
        roundtrip(PageId::new(123456));
        roundtrip(INVALID_PAGE_ID);
    }

    #[test]
    fn test_encoded_lengths() {
        assert_eq!(<i64 as FixedCodec>::ENCODED_LEN, 8);
        assert_eq!(<u32 as FixedCodec>::ENCODED_LEN, 4);
        assert_eq!(<PageId as FixedCodec>::ENCODED_LEN, 4);
    }

    #[test]
    fn test_little_endian_layout() {
        let mut buf = [0u8; 4];
        0x0102_0304u32.encode_into(&mut buf);
        assert_eq!(buf, [0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_encode_into_larger_buffer() {
        // Encoding must only touch the first ENCODED_LEN bytes.
        let mut buf = [0xFFu8; 8];
        7u32.encode_into(&mut buf);
        assert_eq!(&buf[..4], &[7, 0, 0, 0]);
        assert_eq!(&buf[4..], &[0xFF; 4]);
    }
}
