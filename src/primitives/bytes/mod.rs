#![forbid(unsafe_code)]
//! Order-preserving encodings and fixed-width field helpers.

pub mod ord {
    //! Order-preserving encoders for numeric key components.
    //!
    //! Encoded values compare with `memcmp` the same way the decoded values
    //! compare numerically.

    const SIGN_BIT_64: u64 = 1 << 63;
    const SIGN_BIT_32: u32 = 1 << 31;

    /// Big-endian encoding for lexicographic order preservation.
    pub fn put_u64_be(dst: &mut [u8], v: u64) {
        dst[..8].copy_from_slice(&v.to_be_bytes());
    }

    /// Decodes a u64 from big-endian byte order.
    pub fn get_u64_be(src: &[u8]) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&src[..8]);
        u64::from_be_bytes(bytes)
    }

    /// Encodes a signed i64 with order preservation (flip sign bit for sorting).
    pub fn put_i64_be(dst: &mut [u8], v: i64) {
        put_u64_be(dst, (v as u64) ^ SIGN_BIT_64);
    }

    /// Decodes a signed i64 with order preservation.
    pub fn get_i64_be(src: &[u8]) -> i64 {
        (get_u64_be(src) ^ SIGN_BIT_64) as i64
    }

    /// Big-endian u32.
    pub fn put_u32_be(dst: &mut [u8], v: u32) {
        dst[..4].copy_from_slice(&v.to_be_bytes());
    }

    /// Decodes a big-endian u32.
    pub fn get_u32_be(src: &[u8]) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&src[..4]);
        u32::from_be_bytes(bytes)
    }

    /// Encodes a signed i32 with order preservation.
    pub fn put_i32_be(dst: &mut [u8], v: i32) {
        put_u32_be(dst, (v as u32) ^ SIGN_BIT_32);
    }

    /// Decodes an order-preserving i32.
    pub fn get_i32_be(src: &[u8]) -> i32 {
        (get_u32_be(src) ^ SIGN_BIT_32) as i32
    }
}

pub mod field {
    //! Fixed-offset page field accessors.

    /// Reads a big-endian u16 at `off`.
    #[inline]
    pub fn read_u16(buf: &[u8], off: usize) -> u16 {
        u16::from_be_bytes([buf[off], buf[off + 1]])
    }

    /// Writes a big-endian u16 at `off`.
    #[inline]
    pub fn write_u16(buf: &mut [u8], off: usize, v: u16) {
        buf[off..off + 2].copy_from_slice(&v.to_be_bytes());
    }

    /// Reads a big-endian u32 at `off`.
    #[inline]
    pub fn read_u32(buf: &[u8], off: usize) -> u32 {
        super::ord::get_u32_be(&buf[off..])
    }

    /// Writes a big-endian u32 at `off`.
    #[inline]
    pub fn write_u32(buf: &mut [u8], off: usize, v: u32) {
        super::ord::put_u32_be(&mut buf[off..], v);
    }

    /// Reads a big-endian u64 at `off`.
    #[inline]
    pub fn read_u64(buf: &[u8], off: usize) -> u64 {
        super::ord::get_u64_be(&buf[off..])
    }

    /// Writes a big-endian u64 at `off`.
    #[inline]
    pub fn write_u64(buf: &mut [u8], off: usize, v: u64) {
        super::ord::put_u64_be(&mut buf[off..], v);
    }
}
