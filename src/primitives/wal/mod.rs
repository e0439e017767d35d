#![forbid(unsafe_code)]

use std::fmt;
use std::io::IoSlice;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::primitives::io::FileIo;
use crate::types::{Checksum, Crc32Fast, FileId, Lsn, PageId, Result, RidbagError};

const WAL_MAGIC: [u8; 4] = *b"RDBW";
const WAL_FORMAT_VERSION: u16 = 1;
const FILE_HEADER_LEN: usize = 32;
const FRAME_HEADER_LEN: usize = 40;
const WAL_MAX_IO_SLICES: usize = 512;

const KIND_PAGE: u8 = 1;
const KIND_COMMIT: u8 = 2;
const KIND_FILE_ADDED: u8 = 3;
const KIND_FILE_DROPPED: u8 = 4;

/// Configuration options for opening a write-ahead log.
#[derive(Clone, Debug, Default)]
pub struct WalOptions {
    /// Size of each page image in bytes
    pub page_size: u32,
    /// Random salt value tying the log to its manifest
    pub wal_salt: u64,
    /// Starting LSN for the log sequence
    pub start_lsn: Lsn,
}

impl WalOptions {
    /// Creates a new WalOptions with the specified configuration.
    pub fn new(page_size: u32, wal_salt: u64, start_lsn: Lsn) -> Self {
        Self {
            page_size,
            wal_salt,
            start_lsn,
        }
    }
}

/// Statistics tracking WAL operations since the last reset.
#[derive(Clone, Debug, Default)]
pub struct WalStats {
    /// Number of page frames appended to the log
    pub frames_appended: u64,
    /// Number of commit records appended
    pub commits_appended: u64,
    /// Total bytes written to the log
    pub bytes_appended: u64,
    /// Number of sync operations performed
    pub syncs: u64,
}

#[derive(Clone, Debug)]
struct FileHeader {
    page_size: u32,
    wal_salt: u64,
    start_lsn: Lsn,
}

impl FileHeader {
    fn encode(&self) -> [u8; FILE_HEADER_LEN] {
        let mut buf = [0u8; FILE_HEADER_LEN];
        buf[0..4].copy_from_slice(&WAL_MAGIC);
        buf[4..6].copy_from_slice(&WAL_FORMAT_VERSION.to_be_bytes());
        buf[8..12].copy_from_slice(&self.page_size.to_be_bytes());
        buf[12..20].copy_from_slice(&self.wal_salt.to_be_bytes());
        buf[20..28].copy_from_slice(&self.start_lsn.0.to_be_bytes());
        let crc = compute_crc32(&[&buf[..28]]);
        buf[28..32].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < FILE_HEADER_LEN {
            return Err(RidbagError::Corruption("wal header truncated"));
        }
        if src[0..4] != WAL_MAGIC {
            return Err(RidbagError::Corruption("wal magic mismatch"));
        }
        if be_u16(&src[4..6]) != WAL_FORMAT_VERSION {
            return Err(RidbagError::Corruption("wal format version mismatch"));
        }
        if src[6..8] != [0, 0] {
            return Err(RidbagError::Corruption(
                "wal reserved header bytes non-zero",
            ));
        }
        if compute_crc32(&[&src[..28]]) != be_u32(&src[28..32]) {
            return Err(RidbagError::Corruption("wal header crc mismatch"));
        }
        Ok(Self {
            page_size: be_u32(&src[8..12]),
            wal_salt: be_u64(&src[12..20]),
            start_lsn: Lsn(be_u64(&src[20..28])),
        })
    }
}

#[derive(Clone, Debug)]
struct FrameHeader {
    lsn: Lsn,
    file_id: FileId,
    kind: u8,
    page_id: PageId,
    prev_chain: u64,
    payload_crc32: u32,
}

impl FrameHeader {
    fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut buf = [0u8; FRAME_HEADER_LEN];
        buf[0..8].copy_from_slice(&self.lsn.0.to_be_bytes());
        buf[8..12].copy_from_slice(&self.file_id.0.to_be_bytes());
        buf[12] = self.kind;
        buf[16..24].copy_from_slice(&self.page_id.0.to_be_bytes());
        buf[24..32].copy_from_slice(&self.prev_chain.to_be_bytes());
        buf[32..36].copy_from_slice(&self.payload_crc32.to_be_bytes());
        let crc = compute_crc32(&[&buf[..36]]);
        buf[36..40].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < FRAME_HEADER_LEN {
            return Err(RidbagError::Corruption("wal frame header truncated"));
        }
        if compute_crc32(&[&src[..36]]) != be_u32(&src[36..40]) {
            return Err(RidbagError::Corruption("wal frame header crc mismatch"));
        }
        let kind = src[12];
        if !matches!(
            kind,
            KIND_PAGE | KIND_COMMIT | KIND_FILE_ADDED | KIND_FILE_DROPPED
        ) {
            return Err(RidbagError::Corruption("wal frame kind unknown"));
        }
        Ok(Self {
            lsn: Lsn(be_u64(&src[0..8])),
            file_id: FileId(be_u32(&src[8..12])),
            kind,
            page_id: PageId(be_u64(&src[16..24])),
            prev_chain: be_u64(&src[24..32]),
            payload_crc32: be_u32(&src[32..36]),
        })
    }
}

struct WalState {
    header: FileHeader,
    append_offset: u64,
    prev_chain: u64,
    stats: WalStats,
}

/// Write-ahead log of page images grouped into atomic commits.
///
/// Each committed atomic operation is written as its file registration
/// changes and page frames followed by a commit record carrying the same LSN. Frames are checksummed and chained
/// so a torn or stale tail is detected and ignored during replay.
pub struct Wal {
    io: Arc<dyn FileIo>,
    page_size: usize,
    state: Mutex<WalState>,
}

impl Wal {
    /// Opens or creates a write-ahead log with the given options.
    ///
    /// If the file already exists, validates that the stored page size and salt
    /// match the provided options.
    pub fn open(io: Arc<dyn FileIo>, options: WalOptions) -> Result<Self> {
        if options.page_size == 0 {
            return Err(RidbagError::Invalid("wal page size must be non-zero"));
        }
        let len = io.len()?;
        let header = if len < FILE_HEADER_LEN as u64 {
            let header = FileHeader {
                page_size: options.page_size,
                wal_salt: options.wal_salt,
                start_lsn: options.start_lsn,
            };
            io.write_at(0, &header.encode())?;
            io.truncate(FILE_HEADER_LEN as u64)?;
            header
        } else {
            let mut buf = [0u8; FILE_HEADER_LEN];
            io.read_at(0, &mut buf)?;
            let header = FileHeader::decode(&buf)?;
            if header.page_size != options.page_size {
                return Err(RidbagError::Corruption("wal page size mismatch"));
            }
            if header.wal_salt != options.wal_salt {
                return Err(RidbagError::Corruption("wal salt mismatch"));
            }
            header
        };
        let append_offset = io.len()?.max(FILE_HEADER_LEN as u64);
        Ok(Self {
            io,
            page_size: options.page_size as usize,
            state: Mutex::new(WalState {
                header,
                append_offset,
                prev_chain: 0,
                stats: WalStats::default(),
            }),
        })
    }

    /// First LSN this log may contain.
    pub fn start_lsn(&self) -> Lsn {
        self.state.lock().header.start_lsn
    }

    /// Resets the WAL to a new starting LSN, truncating all existing frames.
    pub fn reset(&self, start_lsn: Lsn) -> Result<()> {
        let mut state = self.state.lock();
        state.header.start_lsn = start_lsn;
        state.prev_chain = 0;
        state.stats = WalStats::default();
        self.io.write_at(0, &state.header.encode())?;
        self.io.truncate(FILE_HEADER_LEN as u64)?;
        state.append_offset = FILE_HEADER_LEN as u64;
        debug!(start_lsn = start_lsn.0, "wal.reset");
        Ok(())
    }

    /// Appends the page images of one atomic operation followed by its commit
    /// record. Does not sync; call [`Wal::sync`] for durability.
    pub fn append_commit_group(&self, lsn: Lsn, pages: &[WalPage<'_>]) -> Result<()> {
        self.append_commit_group_with_files(lsn, &[], pages)
    }

    /// Like [`Wal::append_commit_group`], logging the files the operation
    /// created or removed ahead of its pages.
    pub fn append_commit_group_with_files(
        &self,
        lsn: Lsn,
        files: &[WalFileChange<'_>],
        pages: &[WalPage<'_>],
    ) -> Result<()> {
        let mut state = self.state.lock();
        for change in files {
            self.append_file_change_locked(&mut state, lsn, change)?;
        }
        self.append_pages_locked(&mut state, lsn, pages)?;
        self.append_commit_locked(&mut state, lsn)
    }

    /// Appends page frames without a commit record. Replay ignores them until
    /// a commit record with the same LSN follows.
    pub fn append_pages(&self, lsn: Lsn, pages: &[WalPage<'_>]) -> Result<()> {
        let mut state = self.state.lock();
        self.append_pages_locked(&mut state, lsn, pages)
    }

    fn append_pages_locked(
        &self,
        state: &mut WalState,
        lsn: Lsn,
        pages: &[WalPage<'_>],
    ) -> Result<()> {
        if lsn.0 < state.header.start_lsn.0 {
            return Err(RidbagError::Invalid("wal frame lsn below start_lsn"));
        }
        if pages.iter().any(|page| page.payload.len() != self.page_size) {
            return Err(RidbagError::Invalid("wal frame payload size mismatch"));
        }
        let frame_size = FRAME_HEADER_LEN + self.page_size;
        for chunk in pages.chunks((WAL_MAX_IO_SLICES / 2).max(1)) {
            let mut header_bufs: Vec<[u8; FRAME_HEADER_LEN]> = Vec::with_capacity(chunk.len());
            for page in chunk {
                let header = FrameHeader {
                    lsn,
                    file_id: page.file_id,
                    kind: KIND_PAGE,
                    page_id: page.page_id,
                    prev_chain: state.prev_chain,
                    payload_crc32: compute_crc32(&[page.payload]),
                };
                let encoded = header.encode();
                state.prev_chain = next_chain(state.prev_chain, frame_size, &encoded, page.payload);
                header_bufs.push(encoded);
            }
            let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(chunk.len() * 2);
            for (encoded, page) in header_bufs.iter().zip(chunk) {
                slices.push(IoSlice::new(encoded));
                slices.push(IoSlice::new(page.payload));
            }
            let chunk_bytes = (chunk.len() * frame_size) as u64;
            self.io.writev_at(state.append_offset, &slices)?;
            state.append_offset += chunk_bytes;
            state.stats.frames_appended += chunk.len() as u64;
            state.stats.bytes_appended += chunk_bytes;
        }
        Ok(())
    }

    fn append_file_change_locked(
        &self,
        state: &mut WalState,
        lsn: Lsn,
        change: &WalFileChange<'_>,
    ) -> Result<()> {
        if lsn.0 < state.header.start_lsn.0 {
            return Err(RidbagError::Invalid("wal frame lsn below start_lsn"));
        }
        let (kind, file_id, payload) = match *change {
            WalFileChange::Added { file_id, name } => {
                let bytes = name.as_bytes();
                if bytes.len() + 2 > self.page_size {
                    return Err(RidbagError::Invalid("wal file name longer than a page"));
                }
                let len = u16::try_from(bytes.len())
                    .map_err(|_| RidbagError::Invalid("wal file name too long"))?;
                let mut payload = vec![0u8; self.page_size];
                payload[..2].copy_from_slice(&len.to_be_bytes());
                payload[2..2 + bytes.len()].copy_from_slice(bytes);
                (KIND_FILE_ADDED, file_id, payload)
            }
            WalFileChange::Dropped { file_id } => (KIND_FILE_DROPPED, file_id, Vec::new()),
        };
        let header = FrameHeader {
            lsn,
            file_id,
            kind,
            page_id: PageId(0),
            prev_chain: state.prev_chain,
            payload_crc32: compute_crc32(&[&payload]),
        };
        let encoded = header.encode();
        let frame_size = FRAME_HEADER_LEN + payload.len();
        state.prev_chain = next_chain(state.prev_chain, frame_size, &encoded, &payload);
        self.io.writev_at(
            state.append_offset,
            &[IoSlice::new(&encoded), IoSlice::new(&payload)],
        )?;
        state.append_offset += frame_size as u64;
        state.stats.bytes_appended += frame_size as u64;
        Ok(())
    }

    fn append_commit_locked(&self, state: &mut WalState, lsn: Lsn) -> Result<()> {
        let header = FrameHeader {
            lsn,
            file_id: FileId(0),
            kind: KIND_COMMIT,
            page_id: PageId(0),
            prev_chain: state.prev_chain,
            payload_crc32: 0,
        };
        let encoded = header.encode();
        state.prev_chain = next_chain(state.prev_chain, FRAME_HEADER_LEN, &encoded, &[]);
        self.io.write_at(state.append_offset, &encoded)?;
        state.append_offset += FRAME_HEADER_LEN as u64;
        state.stats.commits_appended += 1;
        state.stats.bytes_appended += FRAME_HEADER_LEN as u64;
        Ok(())
    }

    /// Syncs all pending writes to persistent storage.
    pub fn sync(&self) -> Result<()> {
        self.io.sync_all()?;
        self.state.lock().stats.syncs += 1;
        Ok(())
    }

    /// Creates an iterator over the records currently in the log.
    pub fn iter(&self) -> Result<WalIterator> {
        let len = self.io.len()?;
        if len < FILE_HEADER_LEN as u64 {
            return Err(RidbagError::Corruption("wal truncated header"));
        }
        let mut header_buf = [0u8; FILE_HEADER_LEN];
        self.io.read_at(0, &mut header_buf)?;
        let header = FileHeader::decode(&header_buf)?;
        Ok(WalIterator {
            io: Arc::clone(&self.io),
            page_size: self.page_size,
            offset: FILE_HEADER_LEN as u64,
            end: len,
            prev_chain: 0,
            valid_up_to: FILE_HEADER_LEN as u64,
            header,
        })
    }

    /// Returns current statistics for this WAL instance.
    pub fn stats(&self) -> WalStats {
        self.state.lock().stats.clone()
    }

    /// Returns the total size of the WAL file in bytes.
    pub fn len(&self) -> Result<u64> {
        self.io.len()
    }

    /// Returns true if the WAL contains no frames.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? <= FILE_HEADER_LEN as u64)
    }
}

/// One page image queued for the log.
pub struct WalPage<'a> {
    /// File the page belongs to
    pub file_id: FileId,
    /// Page index within the file
    pub page_id: PageId,
    /// Page data contents
    pub payload: &'a [u8],
}

/// A file registration change carried by a commit group.
#[derive(Clone, Copy, Debug)]
pub enum WalFileChange<'a> {
    /// The operation created a data file.
    Added {
        /// Id assigned to the new file
        file_id: FileId,
        /// Logical file name
        name: &'a str,
    },
    /// The operation removed a data file.
    Dropped {
        /// Id of the removed file
        file_id: FileId,
    },
}

/// A record read back from the log.
pub enum WalRecord {
    /// Full page image written by the operation with `lsn`.
    Page {
        /// LSN of the owning operation
        lsn: Lsn,
        /// File the page belongs to
        file_id: FileId,
        /// Page index within the file
        page_id: PageId,
        /// Page data contents
        payload: Vec<u8>,
    },
    /// Data file created by the operation with `lsn`.
    FileAdded {
        /// LSN of the owning operation
        lsn: Lsn,
        /// Id assigned to the new file
        file_id: FileId,
        /// Logical file name
        name: String,
    },
    /// Data file removed by the operation with `lsn`.
    FileDropped {
        /// LSN of the owning operation
        lsn: Lsn,
        /// Id of the removed file
        file_id: FileId,
    },
    /// Marks every preceding record with the same LSN as committed.
    Commit {
        /// LSN of the committed operation
        lsn: Lsn,
    },
}

impl fmt::Debug for WalRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WalRecord::Page {
                lsn,
                file_id,
                page_id,
                payload,
            } => f
                .debug_struct("Page")
                .field("lsn", lsn)
                .field("file_id", file_id)
                .field("page_id", page_id)
                .field("payload_len", &payload.len())
                .finish(),
            WalRecord::FileAdded { lsn, file_id, name } => f
                .debug_struct("FileAdded")
                .field("lsn", lsn)
                .field("file_id", file_id)
                .field("name", name)
                .finish(),
            WalRecord::FileDropped { lsn, file_id } => f
                .debug_struct("FileDropped")
                .field("lsn", lsn)
                .field("file_id", file_id)
                .finish(),
            WalRecord::Commit { lsn } => f.debug_struct("Commit").field("lsn", lsn).finish(),
        }
    }
}

/// Iterator for reading records from a WAL file.
///
/// Stops when corruption is detected or end of valid frames is reached.
pub struct WalIterator {
    io: Arc<dyn FileIo>,
    page_size: usize,
    offset: u64,
    end: u64,
    prev_chain: u64,
    valid_up_to: u64,
    header: FileHeader,
}

impl WalIterator {
    /// Reads the next record from the WAL.
    ///
    /// Returns None when reaching the end of valid frames or detecting corruption.
    pub fn next_record(&mut self) -> Result<Option<WalRecord>> {
        if self.offset + FRAME_HEADER_LEN as u64 > self.end {
            return Ok(self.stop());
        }
        let mut header_buf = [0u8; FRAME_HEADER_LEN];
        match self.io.read_at(self.offset, &mut header_buf) {
            Ok(()) => {}
            Err(err) if is_eof(&err) => return Ok(self.stop()),
            Err(err) => return Err(err),
        }
        let header = match FrameHeader::decode(&header_buf) {
            Ok(header) => header,
            Err(_) => return Ok(self.stop()),
        };
        if header.prev_chain != self.prev_chain {
            return Ok(self.stop());
        }
        if header.lsn.0 < self.header.start_lsn.0 {
            return Err(RidbagError::Corruption("wal frame lsn below start_lsn"));
        }
        let payload_len = match header.kind {
            KIND_PAGE | KIND_FILE_ADDED => self.page_size,
            _ => 0,
        };
        let mut payload = vec![0u8; payload_len];
        if payload_len > 0 {
            match self
                .io
                .read_at(self.offset + FRAME_HEADER_LEN as u64, &mut payload)
            {
                Ok(()) => {}
                Err(err) if is_eof(&err) => return Ok(self.stop()),
                Err(err) => return Err(err),
            }
            if compute_crc32(&[&payload]) != header.payload_crc32 {
                return Ok(self.stop());
            }
        }
        let frame_size = FRAME_HEADER_LEN + payload_len;
        self.prev_chain = next_chain(self.prev_chain, frame_size, &header_buf, &payload);
        self.offset += frame_size as u64;
        self.valid_up_to = self.offset;
        Ok(Some(match header.kind {
            KIND_PAGE => WalRecord::Page {
                lsn: header.lsn,
                file_id: header.file_id,
                page_id: header.page_id,
                payload,
            },
            KIND_FILE_ADDED => WalRecord::FileAdded {
                lsn: header.lsn,
                file_id: header.file_id,
                name: decode_file_name(&payload)?,
            },
            KIND_FILE_DROPPED => WalRecord::FileDropped {
                lsn: header.lsn,
                file_id: header.file_id,
            },
            _ => WalRecord::Commit { lsn: header.lsn },
        }))
    }

    /// Returns the file offset up to which frames have been validated.
    pub fn valid_up_to(&self) -> u64 {
        self.valid_up_to
    }

    fn stop(&mut self) -> Option<WalRecord> {
        self.offset = self.end;
        None
    }
}

fn decode_file_name(payload: &[u8]) -> Result<String> {
    let len = usize::from(be_u16(payload));
    let bytes = payload
        .get(2..2 + len)
        .ok_or(RidbagError::Corruption("wal file name overruns its frame"))?;
    String::from_utf8(bytes.to_vec())
        .map_err(|_| RidbagError::Corruption("wal file name is not utf-8"))
}

fn is_eof(err: &RidbagError) -> bool {
    matches!(err, RidbagError::Io(io_err) if io_err.kind() == std::io::ErrorKind::UnexpectedEof)
}

fn next_chain(prev_chain: u64, frame_size: usize, header: &[u8], payload: &[u8]) -> u64 {
    let mut chain_hasher = Crc32Fast::default();
    chain_hasher.update(&prev_chain.to_be_bytes());
    chain_hasher.update(header);
    chain_hasher.update(payload);
    ((frame_size as u64) << 32) | u64::from(chain_hasher.finalize())
}

fn compute_crc32(chunks: &[&[u8]]) -> u32 {
    let mut hasher = Crc32Fast::default();
    for chunk in chunks {
        hasher.update(chunk);
    }
    hasher.finalize()
}

fn be_u16(src: &[u8]) -> u16 {
    u16::from_be_bytes([src[0], src[1]])
}

fn be_u32(src: &[u8]) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&src[..4]);
    u32::from_be_bytes(bytes)
}

fn be_u64(src: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&src[..8]);
    u64::from_be_bytes(bytes)
}
