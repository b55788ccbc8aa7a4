//! On-disk format: section framing, file codec, and catalogue entries.
//!
//! A Haystack file is a sequence of framed sections:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Section header (16 bytes)                                   │
//! │  - Magic: DA FE EB (3 bytes)                                 │
//! │  - Section id (1 byte)                                       │
//! │  - Plain length: u32 LE (4 bytes)                            │
//! │  - Compressed length: u32 LE (4 bytes)                       │
//! │  - CRC32-IEEE of plain content: u32 LE (4 bytes)             │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Payload                                                     │
//! │  - Header section (id 1): plain content, in the clear        │
//! │  - Everything else: nonce(12) ‖ AES-256-GCM ciphertext+tag,  │
//! │    content bzip2-compressed first when that gains            │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The 16-byte section header doubles as the AEAD associated data. Section
//! order is Header, then Dictionary/Haybale pairs, then Trailer; a catalogue
//! file is Header plus one SHA-512 section.

pub mod catalogue;
pub mod codec;
pub mod file;

/// Section signature bytes as they appear on disk.
pub const SECTION_MAGIC: [u8; 3] = [0xda, 0xfe, 0xeb];

/// Section id: file header (clear, uncompressed).
pub const SECTION_HEADER: u8 = 1;
/// Section id: dictionary (full or incremental).
pub const SECTION_DICTIONARY: u8 = 2;
/// Section id: one sorted Haybale.
pub const SECTION_HAYBALE: u8 = 3;
/// Section id: SHA-512 catalogue entry.
pub const SECTION_SHA512: u8 = 254;
/// Section id: file trailer.
pub const SECTION_TRAILER: u8 = 255;

/// File format major version.
pub const VERSION_MAJOR: u8 = 1;
/// File format minor version.
pub const VERSION_MINOR: u8 = 0;

/// Framed section header length in bytes; also the AEAD associated data.
pub const SECTION_HDR_LEN: usize = 16;

/// AES-GCM payload overhead: 12-byte nonce plus 16-byte tag.
pub const AESGCM_OVERHEAD: usize = 28;

/// Smallest plausible Haystack file (header and trailer framing only).
pub const MIN_FILESIZE: usize = 54;

/// Hard per-file size cap: 1 GiB.
pub const MAX_FILESIZE: usize = 1024 * 1024 * 1024;

/// String length marker for a de-dupped (repeat of previous) string value.
pub const LEN_DUP: u32 = 0xffff_fffe;

/// SHA-512 digest length in bytes.
pub const SHA512_LEN: usize = 64;
