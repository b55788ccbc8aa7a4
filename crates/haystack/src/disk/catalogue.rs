//! SHA-512 catalogue files.
//!
//! A catalogue entry lives in its own directory, named after the same
//! `<time_first>-<time_last>` pair as the Haystack file it signs. Its
//! presence implies the Haystack was committed; its digest lets external
//! tooling verify the file without holding the data in memory.

use crate::config::KeyStore;
use crate::disk::codec::{decode_section, peek_section_id, put_uint};
use crate::disk::file::{parse_header, SectionWriter};
use crate::disk::{SECTION_HEADER, SECTION_SHA512, SHA512_LEN};
use crate::error::{HayError, Result};
use sha2::{Digest, Sha512};
use std::fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// A decoded catalogue entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogueEntry {
    /// Earliest `_timestamp` in the signed Haystack.
    pub time_first: i64,
    /// Latest `_timestamp` in the signed Haystack.
    pub time_last: i64,
    /// SHA-512 over the entire Haystack file, header to trailer.
    pub sha512: [u8; SHA512_LEN],
}

/// Builds catalogue file bytes for the given Haystack file bytes.
pub fn catalogue_bytes(
    haystack_bytes: &[u8],
    keystore: &KeyStore,
    uuid: Uuid,
    time_first: i64,
    time_last: i64,
) -> Result<Vec<u8>> {
    let digest = Sha512::digest(haystack_bytes);

    let mut content = Vec::with_capacity(16 + SHA512_LEN);
    put_uint(&mut content, time_first as u64, 8);
    put_uint(&mut content, time_last as u64, 8);
    content.extend_from_slice(&digest);

    // Versioned like a Haystack file: header section, then the digest
    // section (encrypted, never compressed).
    let mut writer = SectionWriter::new(keystore, uuid, 0)?;
    let mut data = writer.header_section()?;
    data.extend(writer.encrypted_section(SECTION_SHA512, &content)?);
    Ok(data)
}

/// Computes the SHA-512 of a Haystack file and writes
/// `<catalogue_dir>/<time_first>-<time_last>.hsc` (mode 0660).
///
/// Returns the catalogue file path.
pub fn create(
    haystack_path: &Path,
    catalogue_dir: &Path,
    keystore: &KeyStore,
    uuid: Uuid,
    time_first: i64,
    time_last: i64,
) -> Result<PathBuf> {
    let haystack_bytes = fs::read(haystack_path)?;
    let data = catalogue_bytes(&haystack_bytes, keystore, uuid, time_first, time_last)?;

    let path = catalogue_dir.join(format!("{time_first}-{time_last}.hsc"));
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o660)
        .open(&path)?;
    file.write_all(&data)?;
    file.sync_all()?;

    Ok(path)
}

/// Decodes a catalogue file.
pub fn read_entry(data: &[u8], keystore: &KeyStore) -> Result<CatalogueEntry> {
    let id = peek_section_id(data, 0)?;
    if id != SECTION_HEADER {
        return Err(HayError::SectionOrder { prev: 0, found: id });
    }
    let header = decode_section(data, 0, None)?;
    let (_uuid, key) = parse_header(&header.content, keystore)?;

    let id = peek_section_id(data, header.encoded_len)?;
    if id != SECTION_SHA512 {
        return Err(HayError::SectionOrder {
            prev: SECTION_HEADER,
            found: id,
        });
    }
    let section = decode_section(data, header.encoded_len, Some(&key))?;
    if section.content.len() != 16 + SHA512_LEN {
        return Err(HayError::Corrupt(
            "catalogue section has the wrong size".into(),
        ));
    }

    let mut sha512 = [0u8; SHA512_LEN];
    sha512.copy_from_slice(&section.content[16..]);
    Ok(CatalogueEntry {
        time_first: u64::from_le_bytes(section.content[0..8].try_into().unwrap()) as i64,
        time_last: u64::from_le_bytes(section.content[8..16].try_into().unwrap()) as i64,
        sha512,
    })
}

/// Verifies Haystack file bytes against a catalogue file.
pub fn verify(catalogue_data: &[u8], haystack_bytes: &[u8], keystore: &KeyStore) -> Result<bool> {
    let entry = read_entry(catalogue_data, keystore)?;
    let digest = Sha512::digest(haystack_bytes);
    Ok(entry.sha512[..] == digest[..])
}
