#![forbid(unsafe_code)]

use super::page::header;

/// Incremental checksum.
pub trait Checksum {
    /// Clears accumulated state.
    fn reset(&mut self);
    /// Feeds bytes into the checksum.
    fn update(&mut self, bytes: &[u8]);
    /// Returns the checksum of everything fed so far.
    fn finalize(&self) -> u32;
}

/// [`Checksum`] backed by `crc32fast`.
pub struct Crc32Fast {
    inner: crc32fast::Hasher,
}

impl Default for Crc32Fast {
    fn default() -> Self {
        Self {
            inner: crc32fast::Hasher::new(),
        }
    }
}

impl Checksum for Crc32Fast {
    fn reset(&mut self) {
        self.inner.reset();
    }

    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(&self) -> u32 {
        self.inner.clone().finalize()
    }
}

/// CRC32 of a full page image, treating the header CRC field as zero.
pub fn page_crc32(page_no: u64, page: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&page_no.to_be_bytes());
    hasher.update(&page[..header::CRC32.start]);
    hasher.update(&[0u8; 4]);
    hasher.update(&page[header::CRC32.end..]);
    hasher.finalize()
}
