#![forbid(unsafe_code)]
//! Identifiers, the crate error type, and the common page header.

use std::fmt;

/// CRC32 helpers for page images.
pub mod checksum;

pub use checksum::{page_crc32, Checksum, Crc32Fast};

/// Index of a page inside one data file.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct PageId(pub u64);

/// Log sequence number assigned to each committed atomic operation.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Lsn(pub u64);

/// Identifier of a data file registered with the pager.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct FileId(pub u32);

/// Errors produced by the storage engine.
#[derive(thiserror::Error, Debug)]
pub enum RidbagError {
    /// Underlying file system failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// On-disk state violates a structural invariant.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied an unusable argument.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Caller supplied an unusable argument (owned message).
    #[error("invalid argument: {0}")]
    InvalidOwned(String),
    /// A named file or component does not exist.
    #[error("not found")]
    NotFound,
    /// Failure raised inside a named component operation.
    #[error("{component}: {operation} failed: {source}")]
    Component {
        /// Name of the component (tree) that failed.
        component: String,
        /// Operation that was running.
        operation: &'static str,
        /// Underlying error.
        #[source]
        source: Box<RidbagError>,
    },
}

impl RidbagError {
    /// Wraps `self` with the component and operation it escaped from.
    pub fn in_component(self, component: &str, operation: &'static str) -> Self {
        RidbagError::Component {
            component: component.to_owned(),
            operation,
            source: Box::new(self),
        }
    }

    /// Returns the innermost error, skipping component context.
    pub fn root_cause(&self) -> &RidbagError {
        match self {
            RidbagError::Component { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, RidbagError>;

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub mod page {
    //! Shared on-disk page metadata used by pager components.

    use core::convert::TryFrom;

    use super::{Lsn, PageId, Result, RidbagError};

    /// Magic bytes at the start of every formatted page.
    pub const PAGE_MAGIC: [u8; 4] = *b"RDBG";
    /// Current page format version.
    pub const PAGE_FORMAT_VERSION: u16 = 1;
    /// Default page size in bytes.
    pub const DEFAULT_PAGE_SIZE: u32 = 4096;
    /// Smallest page size the pager accepts.
    pub const MIN_PAGE_SIZE: u32 = 256;
    /// Largest page size the pager accepts.
    pub const MAX_PAGE_SIZE: u32 = 65536;
    /// Length of the common page header.
    pub const PAGE_HDR_LEN: usize = 32;

    pub mod header {
        //! Byte offsets for fixed header fields.
        use core::ops::Range;

        /// Magic bytes.
        pub const MAGIC: Range<usize> = 0..4;
        /// Format version.
        pub const FORMAT_VERSION: Range<usize> = 4..6;
        /// Page kind tag.
        pub const PAGE_KIND: usize = 6;
        /// Must be zero.
        pub const RESERVED: usize = 7;
        /// Page size in bytes.
        pub const PAGE_SIZE: Range<usize> = 8..12;
        /// Page number within its file.
        pub const PAGE_NO: Range<usize> = 12..20;
        /// LSN of the last commit that wrote the page.
        pub const LSN: Range<usize> = 20..28;
        /// CRC32 over the page with this field zeroed.
        pub const CRC32: Range<usize> = 28..32;
    }

    /// Kind tag stored in the page header.
    #[repr(u8)]
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub enum PageKind {
        /// Never written by a component.
        Unformatted = 0,
        /// Tree entry point (page 0).
        EntryPoint = 1,
        /// Tree node.
        Bucket = 2,
    }

    impl PageKind {
        /// Returns the on-disk tag.
        pub const fn as_u8(self) -> u8 {
            self as u8
        }
    }

    impl TryFrom<u8> for PageKind {
        type Error = RidbagError;

        fn try_from(value: u8) -> Result<Self> {
            match value {
                0 => Ok(PageKind::Unformatted),
                1 => Ok(PageKind::EntryPoint),
                2 => Ok(PageKind::Bucket),
                _ => Err(RidbagError::Corruption("unknown page kind")),
            }
        }
    }

    /// Decoded page header.
    #[derive(Clone, Debug, Eq, PartialEq)]
    pub struct PageHeader {
        /// Format version.
        pub format_version: u16,
        /// Page kind.
        pub kind: PageKind,
        /// Page size in bytes.
        pub page_size: u32,
        /// Page number within its file.
        pub page_no: PageId,
        /// LSN of the last writing commit.
        pub lsn: Lsn,
        /// Stored checksum.
        pub crc32: u32,
    }

    impl PageHeader {
        /// Builds a header with a zero checksum.
        pub fn new(page_no: PageId, kind: PageKind, page_size: u32, lsn: Lsn) -> Result<Self> {
            if (page_size as usize) < PAGE_HDR_LEN {
                return Err(RidbagError::Invalid("page size smaller than header"));
            }
            Ok(Self {
                format_version: PAGE_FORMAT_VERSION,
                kind,
                page_size,
                page_no,
                lsn,
                crc32: 0,
            })
        }

        /// Returns the header with `crc32` set.
        pub fn with_crc32(mut self, crc32: u32) -> Self {
            self.crc32 = crc32;
            self
        }

        /// Writes the header into the first [`PAGE_HDR_LEN`] bytes of `dst`.
        pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
            if dst.len() < PAGE_HDR_LEN {
                return Err(RidbagError::Invalid("page header buffer too small"));
            }
            let hdr = &mut dst[..PAGE_HDR_LEN];
            hdr[header::MAGIC].copy_from_slice(&PAGE_MAGIC);
            hdr[header::FORMAT_VERSION].copy_from_slice(&self.format_version.to_be_bytes());
            hdr[header::PAGE_KIND] = self.kind.as_u8();
            hdr[header::RESERVED] = 0;
            hdr[header::PAGE_SIZE].copy_from_slice(&self.page_size.to_be_bytes());
            hdr[header::PAGE_NO].copy_from_slice(&self.page_no.0.to_be_bytes());
            hdr[header::LSN].copy_from_slice(&self.lsn.0.to_be_bytes());
            hdr[header::CRC32].copy_from_slice(&self.crc32.to_be_bytes());
            Ok(())
        }

        /// Parses and validates a header.
        pub fn decode(src: &[u8]) -> Result<Self> {
            if src.len() < PAGE_HDR_LEN {
                return Err(RidbagError::Corruption("page header truncated"));
            }
            let hdr = &src[..PAGE_HDR_LEN];
            if hdr[header::MAGIC] != PAGE_MAGIC {
                return Err(RidbagError::Corruption("invalid page magic"));
            }
            let format_version = u16::from_be_bytes([hdr[4], hdr[5]]);
            if format_version != PAGE_FORMAT_VERSION {
                return Err(RidbagError::Corruption("unsupported page format version"));
            }
            if hdr[header::RESERVED] != 0 {
                return Err(RidbagError::Corruption(
                    "page header reserved byte not zero",
                ));
            }
            let kind = PageKind::try_from(hdr[header::PAGE_KIND])?;
            let page_size = read_u32(&hdr[header::PAGE_SIZE]);
            if (page_size as usize) < PAGE_HDR_LEN {
                return Err(RidbagError::Corruption("page size smaller than header"));
            }
            Ok(Self {
                format_version,
                kind,
                page_size,
                page_no: PageId(read_u64(&hdr[header::PAGE_NO])),
                lsn: Lsn(read_u64(&hdr[header::LSN])),
                crc32: read_u32(&hdr[header::CRC32]),
            })
        }
    }

    /// Reads the LSN without validating the rest of the header.
    pub fn lsn(buf: &[u8]) -> Lsn {
        Lsn(read_u64(&buf[header::LSN]))
    }

    /// Returns true when the page carries the format magic.
    pub fn is_formatted(buf: &[u8]) -> bool {
        buf.len() >= PAGE_HDR_LEN && buf[header::MAGIC] == PAGE_MAGIC
    }

    /// Rewrites the header of a page image for commit, keeping its kind tag,
    /// then stores the checksum of the whole page.
    pub fn stamp(buf: &mut [u8], page_no: PageId, lsn: Lsn) -> Result<()> {
        let kind = PageKind::try_from(buf[header::PAGE_KIND])?;
        let page_size =
            u32::try_from(buf.len()).map_err(|_| RidbagError::Invalid("page too large"))?;
        PageHeader::new(page_no, kind, page_size, lsn)?.encode(buf)?;
        let crc = super::page_crc32(page_no.0, buf);
        buf[header::CRC32].copy_from_slice(&crc.to_be_bytes());
        Ok(())
    }

    /// Verifies the stored checksum of a formatted page.
    pub fn verify(buf: &[u8], page_no: PageId) -> Result<()> {
        let header = PageHeader::decode(buf)?;
        if header.page_no != page_no {
            return Err(RidbagError::Corruption("page number mismatch"));
        }
        if header.page_size as usize != buf.len() {
            return Err(RidbagError::Corruption("page size mismatch"));
        }
        if super::page_crc32(page_no.0, buf) != header.crc32 {
            return Err(RidbagError::Corruption("page checksum mismatch"));
        }
        Ok(())
    }

    fn read_u32(src: &[u8]) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&src[..4]);
        u32::from_be_bytes(bytes)
    }

    fn read_u64(src: &[u8]) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&src[..8]);
        u64::from_be_bytes(bytes)
    }
}
