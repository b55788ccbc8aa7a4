//! Error and Result types for Haystack operations.

use std::io;
use thiserror::Error;
use uuid::Uuid;

/// A convenience `Result` type for Haystack operations.
pub type Result<T> = std::result::Result<T, HayError>;

/// The error type for Haystack operations.
#[derive(Debug, Error)]
pub enum HayError {
    /// Invalid section signature in a Haystack file.
    #[error("Invalid section signature: {0:#08x}, not a Haystack or dataset corrupt")]
    BadSignature(u32),

    /// Unsupported Haystack file format version.
    #[error("Stored Haystack version {major}.{minor} incompatible with this build")]
    UnsupportedVersion {
        /// Major version read from the file header.
        major: u8,
        /// Minor version read from the file header.
        minor: u8,
    },

    /// Unknown section identifier.
    #[error("Unknown section type {0}, not a Haystack or dataset corrupt")]
    UnknownSection(u8),

    /// Sections appeared in an order the format does not permit.
    #[error("Section {found} cannot follow section {prev}")]
    SectionOrder {
        /// Identifier of the preceding section (0 for start of file).
        prev: u8,
        /// Identifier of the offending section.
        found: u8,
    },

    /// Stored section lengths are out of bounds.
    #[error("Stored lengths {compressed} (compressed), {plain} (plain) invalid, corrupted Haystack")]
    BadLength {
        /// Compressed content length from the section header.
        compressed: u32,
        /// Plain content length from the section header.
        plain: u32,
    },

    /// Section content checksum does not match the stored value.
    #[error("Section CRC mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    CrcMismatch {
        /// CRC32 read from the section header.
        stored: u32,
        /// CRC32 computed over the decoded content.
        computed: u32,
    },

    /// AES-GCM authentication failed: wrong key or tampered data.
    #[error("Section decryption failed: wrong key or data corrupted/tampered")]
    DecryptFailed,

    /// Encryption of a section failed.
    #[error("Section encryption failed")]
    EncryptFailed,

    /// The file was encrypted with a key this process does not hold.
    #[error("File was encrypted with unknown AES key {0}")]
    UnknownKey(Uuid),

    /// A compressed section does not carry valid bzip2 signatures.
    #[error("Compressed section lacks bzip2 signatures, corrupted Haystack")]
    BadCompression,

    /// The byte stream ended inside a section.
    #[error("Unexpected end of data while reading Haystack")]
    Truncated,

    /// A string dedup marker appeared with no preceding string.
    #[error("De-dupped string indicated but no previous string present")]
    DanglingDedup,

    /// Decoded section content is internally inconsistent.
    #[error("Corrupt section content: {0}")]
    Corrupt(String),

    /// The 24-bit key hash table has no free slot left on the probe path.
    #[error("Dictionary hash table exhausted while probing for {0:?}")]
    DictionaryFull(String),

    /// Attempted to insert into a sorted (immutable) Haybale.
    #[error("Cannot insert into an immutable Haybale")]
    ImmutableHaybale,

    /// Attempted to search a Haybale that has not been sorted yet.
    #[error("Cannot search an unsorted Haybale; call sort_all() first")]
    UnsortedHaybale,

    /// A record's `_timestamp` value could not be parsed.
    #[error("Cannot parse timestamp {0:?}")]
    BadTimestamp(String),

    /// A conjunctive search was issued with no conditions.
    #[error("Search requires at least one key/value condition")]
    EmptySearch,

    /// Configuration is missing, out of range, or fails validation.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A JSON input line could not be turned into a record.
    #[error("Ingest error: {0}")]
    Ingest(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
