//! Section framing: CRC32 → bzip2 → AES-256-GCM.
//!
//! [`encode_section`] and [`decode_section`] are the only paths bytes take
//! between memory and disk. The CRC is always computed over the plain
//! content; compression only applies when it actually shrinks the content
//! (`compressed_len == plain_len` signals "stored as-is"); encryption covers
//! every section except the file header, with the 16-byte section header as
//! associated data so framing tampering also fails authentication.

use crate::disk::{
    AESGCM_OVERHEAD, LEN_DUP, MAX_FILESIZE, SECTION_HDR_LEN, SECTION_HEADER, SECTION_MAGIC,
};
use crate::error::{HayError, Result};
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use bzip2::Compression;
use rand_core::{OsRng, RngCore};
use std::io::{Read, Write};

/// bzip2 stream signature, "BZ", highest byte first.
const BZIP2_HDR_MAGIC: u64 = 0x425a;

/// bzip2 block signature, BCD of π, highest byte first.
const BZIP2_BLK_MAGIC: u64 = 0x3141_5926_5359;

/// A 12-byte GCM nonce counter.
///
/// Seeded from the OS RNG once per writer and incremented with carry per
/// encrypted section; nonce reuse under one key breaks GCM, so the counter
/// is never rewound.
pub struct NonceCounter([u8; 12]);

impl NonceCounter {
    /// Creates a counter with a random starting point.
    pub fn new() -> Self {
        let mut nonce = [0u8; 12];
        OsRng.fill_bytes(&mut nonce);
        Self(nonce)
    }

    /// Returns the current nonce and advances the counter.
    pub fn next(&mut self) -> [u8; 12] {
        let out = self.0;
        for b in self.0.iter_mut().rev() {
            let (v, carry) = b.overflowing_add(1);
            *b = v;
            if !carry {
                break;
            }
        }
        out
    }
}

impl Default for NonceCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// One decoded section: its id and plain content.
#[derive(Debug)]
pub struct Section {
    /// Section identifier byte.
    pub id: u8,
    /// Verified plain content.
    pub content: Vec<u8>,
    /// Total encoded length, header included.
    pub encoded_len: usize,
}

/// Appends a little-endian integer of `len` bytes.
pub fn put_uint(buf: &mut Vec<u8>, v: u64, len: usize) {
    let bytes = v.to_le_bytes();
    buf.extend_from_slice(&bytes[..len]);
}

/// Reads a little-endian integer of `len` bytes.
pub fn get_uint(buf: &[u8], ofs: usize, len: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes[..len].copy_from_slice(&buf[ofs..ofs + len]);
    u64::from_le_bytes(bytes)
}

/// Encodes one framed section.
///
/// `crypt` carries the AES key and the writer's nonce counter; it must be
/// `None` exactly for the file header section, which stays in the clear
/// because it names the key every other section is encrypted with.
/// `compression_level` 0 disables bzip2; 1-9 select the effort, and the
/// compressed form is only kept when it is smaller than the plain content.
pub fn encode_section(
    id: u8,
    plain: &[u8],
    compression_level: u32,
    crypt: Option<(&[u8; 32], &mut NonceCounter)>,
) -> Result<Vec<u8>> {
    let crc = crc32fast::hash(plain);

    let compressed = match compression_level {
        0 => None,
        level if crypt.is_some() => {
            let candidate = bzip2_compress(plain, level)?;
            (candidate.len() < plain.len()).then_some(candidate)
        }
        _ => None,
    };
    let content = compressed.as_deref().unwrap_or(plain);

    let mut header = Vec::with_capacity(SECTION_HDR_LEN);
    header.extend_from_slice(&SECTION_MAGIC);
    header.push(id);
    put_uint(&mut header, plain.len() as u64, 4);
    put_uint(&mut header, content.len() as u64, 4);
    put_uint(&mut header, u64::from(crc), 4);

    let mut out = header.clone();
    match crypt {
        None => out.extend_from_slice(content),
        Some((key, nonce_counter)) => {
            let nonce_bytes = nonce_counter.next();
            let cipher = Aes256Gcm::new_from_slice(key).expect("key is always 32 bytes");
            let ciphertext = cipher
                .encrypt(
                    Nonce::from_slice(&nonce_bytes),
                    Payload {
                        msg: content,
                        aad: &header,
                    },
                )
                .map_err(|_| HayError::EncryptFailed)?;
            out.extend_from_slice(&nonce_bytes);
            out.extend_from_slice(&ciphertext);
        }
    }

    Ok(out)
}

/// Peeks the section id at `ofs` without decoding.
pub fn peek_section_id(data: &[u8], ofs: usize) -> Result<u8> {
    if data.len() < ofs + SECTION_HDR_LEN {
        return Err(HayError::Truncated);
    }
    Ok(data[ofs + 3])
}

/// Decodes and verifies the section starting at `ofs`.
///
/// `key` must be `Some` for every section other than the header. Magic,
/// length bounds, GCM authentication, bzip2 signatures, and the CRC are all
/// checked; any failure is a codec-integrity error.
pub fn decode_section(data: &[u8], ofs: usize, key: Option<&[u8; 32]>) -> Result<Section> {
    if data.len() < ofs + SECTION_HDR_LEN {
        return Err(HayError::Truncated);
    }
    let header = &data[ofs..ofs + SECTION_HDR_LEN];

    if header[..3] != SECTION_MAGIC {
        let sig = get_uint(header, 0, 3) as u32;
        return Err(HayError::BadSignature(sig));
    }
    let id = header[3];
    let plain_len = get_uint(header, 4, 4) as usize;
    let compressed_len = get_uint(header, 8, 4) as usize;
    let stored_crc = get_uint(header, 12, 4) as u32;

    if plain_len < 1
        || plain_len > MAX_FILESIZE
        || compressed_len < 1
        || compressed_len > plain_len
    {
        return Err(HayError::BadLength {
            compressed: compressed_len as u32,
            plain: plain_len as u32,
        });
    }

    let payload_len = if id == SECTION_HEADER {
        compressed_len
    } else {
        compressed_len + AESGCM_OVERHEAD
    };
    let payload_start = ofs + SECTION_HDR_LEN;
    if data.len() < payload_start + payload_len {
        return Err(HayError::Truncated);
    }
    let payload = &data[payload_start..payload_start + payload_len];

    let mut content: Vec<u8> = if id == SECTION_HEADER {
        payload.to_vec()
    } else {
        let key = key.ok_or(HayError::DecryptFailed)?;
        let (nonce, ciphertext) = payload.split_at(12);
        let cipher = Aes256Gcm::new_from_slice(key).expect("key is always 32 bytes");
        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: header,
                },
            )
            .map_err(|_| HayError::DecryptFailed)?
    };

    if compressed_len < plain_len {
        content = bzip2_decompress(&content)?;
    }
    if content.len() != plain_len {
        return Err(HayError::BadLength {
            compressed: compressed_len as u32,
            plain: plain_len as u32,
        });
    }

    let computed_crc = crc32fast::hash(&content);
    if computed_crc != stored_crc {
        return Err(HayError::CrcMismatch {
            stored: stored_crc,
            computed: computed_crc,
        });
    }

    Ok(Section {
        id,
        content,
        encoded_len: SECTION_HDR_LEN + payload_len,
    })
}

/// bzip2-compresses `data` at the given level (1-9).
fn bzip2_compress(data: &[u8], level: u32) -> Result<Vec<u8>> {
    let mut encoder = BzEncoder::new(Vec::new(), Compression::new(level.clamp(1, 9)));
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Verifies the bzip2 stream and block signatures, then decompresses.
fn bzip2_decompress(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < 10
        || !check_sig_msb(&data[0..2], BZIP2_HDR_MAGIC)
        || !check_sig_msb(&data[4..10], BZIP2_BLK_MAGIC)
    {
        return Err(HayError::BadCompression);
    }

    let mut out = Vec::with_capacity(data.len() * 2);
    let mut decoder = BzDecoder::new(data).take(MAX_FILESIZE as u64 + 1);
    decoder.read_to_end(&mut out)?;
    if out.len() > MAX_FILESIZE {
        return Err(HayError::BadLength {
            compressed: data.len() as u32,
            plain: u32::MAX,
        });
    }
    Ok(out)
}

/// bzip2 signatures are stored highest byte first.
fn check_sig_msb(slice: &[u8], sig: u64) -> bool {
    let mut res: u64 = 0;
    for b in slice {
        res = (res << 8) | u64::from(*b);
    }
    res == sig
}

/// Appends a length-prefixed string: u32 LE length, then the raw bytes.
pub fn put_string(buf: &mut Vec<u8>, s: &str) {
    put_uint(buf, s.len() as u64, 4);
    buf.extend_from_slice(s.as_bytes());
}

/// Appends the marker for a string equal to the previously written one.
pub fn put_dup_marker(buf: &mut Vec<u8>) {
    put_uint(buf, u64::from(LEN_DUP), 4);
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [0x42; 32];

    #[test]
    fn test_nonce_counter_advances_with_carry() {
        let mut ctr = NonceCounter([0xff; 12]);
        let first = ctr.next();
        assert_eq!(first, [0xff; 12]);
        assert_eq!(ctr.next(), [0x00; 12]);
    }

    #[test]
    fn test_header_section_round_trip_in_clear() {
        let plain = b"\x01\x00header-content";
        let encoded = encode_section(SECTION_HEADER, plain, 9, None).unwrap();

        // The header section carries its content verbatim.
        assert_eq!(&encoded[SECTION_HDR_LEN..], plain);

        let section = decode_section(&encoded, 0, None).unwrap();
        assert_eq!(section.id, SECTION_HEADER);
        assert_eq!(section.content, plain);
        assert_eq!(section.encoded_len, encoded.len());
    }

    #[test]
    fn test_encrypted_section_round_trip() {
        let plain = b"some dictionary bytes".to_vec();
        let mut nonce = NonceCounter::new();
        let encoded = encode_section(2, &plain, 0, Some((&KEY, &mut nonce))).unwrap();

        // Uncompressed: payload is nonce + ciphertext + tag.
        assert_eq!(
            encoded.len(),
            SECTION_HDR_LEN + plain.len() + AESGCM_OVERHEAD
        );

        let section = decode_section(&encoded, 0, Some(&KEY)).unwrap();
        assert_eq!(section.id, 2);
        assert_eq!(section.content, plain);
    }

    #[test]
    fn test_compression_only_when_it_gains() {
        let mut nonce = NonceCounter::new();

        // Highly repetitive content compresses.
        let plain = vec![b'a'; 4096];
        let encoded = encode_section(3, &plain, 9, Some((&KEY, &mut nonce))).unwrap();
        let compressed_len = get_uint(&encoded, 8, 4) as usize;
        assert!(compressed_len < plain.len());
        let section = decode_section(&encoded, 0, Some(&KEY)).unwrap();
        assert_eq!(section.content, plain);

        // Tiny content does not; stored as-is.
        let plain = b"xy".to_vec();
        let encoded = encode_section(3, &plain, 9, Some((&KEY, &mut nonce))).unwrap();
        assert_eq!(get_uint(&encoded, 8, 4) as usize, plain.len());
        let section = decode_section(&encoded, 0, Some(&KEY)).unwrap();
        assert_eq!(section.content, plain);
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let mut nonce = NonceCounter::new();
        let encoded = encode_section(2, b"payload", 0, Some((&KEY, &mut nonce))).unwrap();

        let mut tampered = encoded.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        assert!(matches!(
            decode_section(&tampered, 0, Some(&KEY)),
            Err(HayError::DecryptFailed)
        ));
    }

    #[test]
    fn test_tampered_header_rejected() {
        let mut nonce = NonceCounter::new();
        let encoded = encode_section(2, b"payload", 0, Some((&KEY, &mut nonce))).unwrap();

        // Flipping a CRC byte invalidates the AAD before the CRC is even
        // compared.
        let mut tampered = encoded.clone();
        tampered[12] ^= 0x01;
        assert!(decode_section(&tampered, 0, Some(&KEY)).is_err());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let mut nonce = NonceCounter::new();
        let encoded = encode_section(2, b"payload", 0, Some((&KEY, &mut nonce))).unwrap();

        let other = [0x24u8; 32];
        assert!(matches!(
            decode_section(&encoded, 0, Some(&other)),
            Err(HayError::DecryptFailed)
        ));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut encoded = encode_section(SECTION_HEADER, b"xx", 0, None).unwrap();
        encoded[0] = 0x00;
        assert!(matches!(
            decode_section(&encoded, 0, None),
            Err(HayError::BadSignature(_))
        ));
    }

    #[test]
    fn test_truncated_rejected() {
        let encoded = encode_section(SECTION_HEADER, b"content", 0, None).unwrap();
        assert!(matches!(
            decode_section(&encoded[..encoded.len() - 1], 0, None),
            Err(HayError::Truncated)
        ));
        assert!(matches!(
            decode_section(&encoded[..8], 0, None),
            Err(HayError::Truncated)
        ));
    }

    #[test]
    fn test_crc_covers_plain_content() {
        let encoded = encode_section(SECTION_HEADER, b"content", 0, None).unwrap();
        // Corrupt a payload byte of the clear header section: only the CRC
        // can catch it.
        let mut tampered = encoded.clone();
        tampered[SECTION_HDR_LEN] ^= 0x01;
        assert!(matches!(
            decode_section(&tampered, 0, None),
            Err(HayError::CrcMismatch { .. })
        ));
    }
}
