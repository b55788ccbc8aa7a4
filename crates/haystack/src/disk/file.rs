//! Haystack file serialisation and the reading state machine.
//!
//! Writing emits a Header, then one Dictionary+Haybale section pair per
//! non-empty bale (full dictionary for the first pair, incremental after),
//! then a Trailer. Reading is a strict linear state machine over the same
//! sections; any framing, ordering, integrity, or content failure rejects
//! the file and discards the partially built Haystack.

use crate::dictionary::Dictionary;
use crate::disk::codec::{
    decode_section, encode_section, peek_section_id, put_dup_marker, put_string, put_uint,
    NonceCounter, Section,
};
use crate::disk::{
    LEN_DUP, MAX_FILESIZE, MIN_FILESIZE, SECTION_DICTIONARY, SECTION_HAYBALE, SECTION_HEADER,
    SECTION_TRAILER, VERSION_MAJOR, VERSION_MINOR,
};
use crate::config::KeyStore;
use crate::error::{HayError, Result};
use crate::mem::value::{VALTYPE_FLOAT, VALTYPE_INT, VALTYPE_STRING};
use crate::mem::{Haybale, Haystack, Haystalk, Value, OFS_NIL};
use std::sync::Arc;
use uuid::Uuid;

/// Per-stalk memsize estimate, mirrored from the in-memory accounting.
const STALK_MEMSIZE: u32 = 37;

/// Encodes the sections of one Haystack file, holding the AES key, the
/// nonce counter, and the configured compression level.
pub struct SectionWriter {
    key: [u8; 32],
    uuid: Uuid,
    nonce: NonceCounter,
    compression_level: u32,
}

impl SectionWriter {
    /// Creates a writer bound to `uuid`, resolving the key from the store.
    ///
    /// # Errors
    ///
    /// [`HayError::UnknownKey`] when the keystore has no such key.
    pub fn new(keystore: &KeyStore, uuid: Uuid, compression_level: u32) -> Result<Self> {
        let key = *keystore.key(&uuid).ok_or(HayError::UnknownKey(uuid))?;
        Ok(Self {
            key,
            uuid,
            nonce: NonceCounter::new(),
            compression_level,
        })
    }

    /// Encodes the file header section (clear, uncompressed).
    pub fn header_section(&self) -> Result<Vec<u8>> {
        let mut content = Vec::with_capacity(18);
        content.push(VERSION_MAJOR);
        content.push(VERSION_MINOR);
        content.extend_from_slice(self.uuid.as_bytes());
        encode_section(SECTION_HEADER, &content, 0, None)
    }

    /// Encodes a dictionary section from the given `(dkey, name)` entries.
    ///
    /// `prev_ofs` is the byte offset of the previous Dictionary+Haybale pair
    /// in the file, or 0 for the first.
    pub fn dictionary_section(&mut self, entries: &[(u32, Arc<str>)], prev_ofs: u32) -> Result<Vec<u8>> {
        let mut content = Vec::with_capacity(16 + entries.len() * 32);
        put_uint(&mut content, u64::from(prev_ofs), 4);
        put_uint(&mut content, entries.len() as u64, 4);
        for (dkey, name) in entries {
            put_uint(&mut content, u64::from(*dkey), 3);
            content.push(name.len() as u8);
            content.extend_from_slice(name.as_bytes());
        }
        encode_section(
            SECTION_DICTIONARY,
            &content,
            self.compression_level,
            Some((&self.key, &mut self.nonce)),
        )
    }

    /// Encodes a sorted Haybale section, de-duplicating adjacent equal
    /// string values with the [`LEN_DUP`] marker.
    pub fn haybale_section(&mut self, bale: &Haybale) -> Result<Vec<u8>> {
        debug_assert!(bale.is_sorted(), "serialising an unsorted Haybale");

        let mut content = Vec::with_capacity(20 + bale.num_stalks() as usize * 24);
        put_uint(&mut content, u64::from(bale.num_stalks()), 4);
        put_uint(&mut content, bale.time_first() as u64, 8);
        put_uint(&mut content, bale.time_last() as u64, 8);

        let mut prev_string: Option<&Arc<str>> = None;
        for stalk in bale.stalks() {
            put_uint(&mut content, u64::from(stalk.dkey), 3);
            content.push(stalk.val.type_tag());
            put_uint(&mut content, u64::from(stalk.first_ofs), 4);
            put_uint(&mut content, u64::from(stalk.next_ofs), 4);

            match &stalk.val {
                Value::Int(i) => put_uint(&mut content, *i as u64, 8),
                Value::Float(f) => put_uint(&mut content, f.to_bits(), 8),
                Value::Str(s) => match prev_string {
                    Some(prev) if prev.as_ref() == s.as_ref() => put_dup_marker(&mut content),
                    _ => {
                        put_string(&mut content, s);
                        prev_string = Some(s);
                    }
                },
            }
        }

        encode_section(
            SECTION_HAYBALE,
            &content,
            self.compression_level,
            Some((&self.key, &mut self.nonce)),
        )
    }

    /// Encodes the file trailer section.
    pub fn trailer_section(&mut self, last_dict_ofs: u32, time_first: i64, time_last: i64) -> Result<Vec<u8>> {
        let mut content = Vec::with_capacity(20);
        put_uint(&mut content, u64::from(last_dict_ofs), 4);
        put_uint(&mut content, time_first as u64, 8);
        put_uint(&mut content, time_last as u64, 8);
        encode_section(
            SECTION_TRAILER,
            &content,
            self.compression_level,
            Some((&self.key, &mut self.nonce)),
        )
    }

    /// Encodes an arbitrary encrypted section; the catalogue path.
    pub(crate) fn encrypted_section(&mut self, id: u8, content: &[u8]) -> Result<Vec<u8>> {
        encode_section(id, content, 0, Some((&self.key, &mut self.nonce)))
    }
}

/// Collects the dictionary entries for the next section pair and clears
/// their dirty flags: the full table for the first pair in a file,
/// incremental (dirty only) afterwards.
pub fn dictionary_entries_for_pair(dict: &mut Dictionary, prev_ofs: u32) -> Vec<(u32, Arc<str>)> {
    if prev_ofs == 0 {
        let all = dict.all_entries();
        let _ = dict.take_dirty();
        all
    } else {
        dict.take_dirty()
    }
}

/// Serialises a whole Haystack into file bytes: Header, Dictionary+Haybale
/// pairs, Trailer. Bales are finalised first; empty bales produce nothing.
pub fn haystack_to_bytes(hs: &mut Haystack, keystore: &KeyStore, compression_level: u32) -> Result<Vec<u8>> {
    let mut writer = SectionWriter::new(keystore, hs.aes_key_uuid(), compression_level)?;
    let mut data = writer.header_section()?;

    hs.sort_all();

    let mut prev_ofs = 0u32;
    for i in 0..hs.bales().len() {
        if hs.bales()[i].num_stalks() == 0 {
            continue;
        }
        let cur_ofs = data.len() as u32;

        let entries = dictionary_entries_for_pair(hs.dict_mut(), prev_ofs);
        data.extend(writer.dictionary_section(&entries, prev_ofs)?);
        data.extend(writer.haybale_section(&hs.bales()[i])?);

        prev_ofs = cur_ofs;
    }

    let (time_first, time_last) = hs.time_bounds();
    data.extend(writer.trailer_section(prev_ofs, time_first, time_last)?);

    Ok(data)
}

impl Haystack {
    /// Serialises this Haystack into complete file bytes, finalising every
    /// bale first. Equivalent to [`haystack_to_bytes`].
    pub fn serialize(&mut self, keystore: &KeyStore, compression_level: u32) -> Result<Vec<u8>> {
        haystack_to_bytes(self, keystore, compression_level)
    }
}

/// A bounds-checked little-endian cursor over section content.
struct Cur<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cur<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn get_uint(&mut self, len: usize) -> Result<u64> {
        if self.remaining() < len {
            return Err(HayError::Truncated);
        }
        let mut bytes = [0u8; 8];
        bytes[..len].copy_from_slice(&self.buf[self.pos..self.pos + len]);
        self.pos += len;
        Ok(u64::from_le_bytes(bytes))
    }

    fn get_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(HayError::Truncated);
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn get_str(&mut self, len: usize) -> Result<&'a str> {
        std::str::from_utf8(self.get_bytes(len)?)
            .map_err(|_| HayError::Corrupt("invalid UTF-8 in string".into()))
    }
}

/// Parses a file header section: version check, then the AES key UUID.
pub(crate) fn parse_header(content: &[u8], keystore: &KeyStore) -> Result<(Uuid, [u8; 32])> {
    let mut cur = Cur::new(content);
    let major = cur.get_uint(1)? as u8;
    let minor = cur.get_uint(1)? as u8;
    if major != VERSION_MAJOR || minor != VERSION_MINOR {
        return Err(HayError::UnsupportedVersion { major, minor });
    }

    let uuid_bytes: [u8; 16] = cur
        .get_bytes(16)?
        .try_into()
        .expect("slice is exactly 16 bytes");
    let uuid = Uuid::from_bytes(uuid_bytes);
    let key = *keystore.key(&uuid).ok_or(HayError::UnknownKey(uuid))?;
    Ok((uuid, key))
}

/// Parses a dictionary section into the Haystack's Dictionary.
///
/// The stored entry count is advisory; entries are consumed until the
/// payload ends.
fn parse_dictionary(content: &[u8], dict: &mut Dictionary) -> Result<()> {
    let mut cur = Cur::new(content);
    let _prev_ofs = cur.get_uint(4)?;
    let num_dkeys = cur.get_uint(4)?;
    if num_dkeys > 16 * 1024 * 1024 {
        return Err(HayError::Corrupt(format!(
            "dictionary claims {num_dkeys} keys, more than the table holds"
        )));
    }

    while cur.remaining() > 0 {
        let dkey = cur.get_uint(3)? as u32;
        let name_len = cur.get_uint(1)? as usize;
        let name = cur.get_str(name_len)?;
        dict.install(dkey, name);
    }

    Ok(())
}

/// Parses a Haybale section into a sorted, immutable bale.
fn parse_haybale(content: &[u8], dict: &Dictionary) -> Result<Haybale> {
    if content.is_empty() {
        return Ok(Haybale::from_disk(Vec::new(), 0, 0, 0));
    }

    let mut cur = Cur::new(content);
    let num_stalks = cur.get_uint(4)? as usize;
    let time_first = cur.get_uint(8)? as i64;
    let time_last = cur.get_uint(8)? as i64;

    let mut stalks = Vec::with_capacity(num_stalks.min(1 << 20));
    let mut memsize = 0u32;
    let mut prev_string: Option<Arc<str>> = None;

    for i in 0..num_stalks {
        let dkey = cur.get_uint(3)? as u32;
        if dict.name(dkey).is_none() {
            return Err(HayError::Corrupt(format!(
                "stalk references dkey {dkey} missing from dictionary"
            )));
        }

        let valtype = cur.get_uint(1)? as u8;
        let first_ofs = cur.get_uint(4)? as u32;
        let next_ofs = cur.get_uint(4)? as u32;

        let val = match valtype {
            VALTYPE_INT => Value::Int(cur.get_uint(8)? as i64),
            VALTYPE_FLOAT => Value::Float(f64::from_bits(cur.get_uint(8)?)),
            VALTYPE_STRING => {
                let len = cur.get_uint(4)? as u32;
                if len == LEN_DUP {
                    let prev = prev_string.as_ref().ok_or(HayError::DanglingDedup)?;
                    Value::Str(Arc::clone(prev))
                } else {
                    let s: Arc<str> = Arc::from(cur.get_str(len as usize)?);
                    memsize += 2 + s.len() as u32;
                    prev_string = Some(Arc::clone(&s));
                    Value::Str(s)
                }
            }
            other => {
                return Err(HayError::Corrupt(format!("unknown value type {other}")));
            }
        };

        memsize += STALK_MEMSIZE;
        stalks.push(Haystalk {
            dkey,
            val,
            self_ofs: i as u32,
            first_ofs,
            next_ofs,
        });
    }

    // Link bounds: first_ofs must resolve, next_ofs resolves or terminates.
    let n = stalks.len() as u32;
    for stalk in &stalks {
        if stalk.first_ofs >= n || (stalk.next_ofs != OFS_NIL && stalk.next_ofs >= n) {
            return Err(HayError::Corrupt(format!(
                "stalk link out of bounds (first {}, next {}, stalks {})",
                stalk.first_ofs, stalk.next_ofs, n
            )));
        }
    }

    Ok(Haybale::from_disk(stalks, time_first, time_last, memsize))
}

/// Decodes file bytes into a complete in-memory Haystack.
///
/// Sections are consumed in strict order (Header, then Dictionary/Haybale
/// pairs, then Trailer); parsing halts at the Trailer and trailing bytes are
/// ignored for forward compatibility.
///
/// # Errors
///
/// Any integrity or format failure: the partially built Haystack is simply
/// dropped.
pub fn haystack_from_bytes(data: &[u8], keystore: &KeyStore) -> Result<Haystack> {
    if data.len() < MIN_FILESIZE {
        return Err(HayError::Truncated);
    }
    if data.len() > MAX_FILESIZE {
        return Err(HayError::BadLength {
            compressed: 0,
            plain: u32::MAX,
        });
    }

    let mut pos = 0usize;
    let mut prev_id = 0u8;
    let mut key: Option<[u8; 32]> = None;
    let mut hs: Option<Haystack> = None;

    loop {
        let id = peek_section_id(data, pos)?;

        let permitted = matches!(
            (prev_id, id),
            (0, SECTION_HEADER)
                | (SECTION_HEADER, SECTION_DICTIONARY)
                | (SECTION_HEADER, SECTION_TRAILER)
                | (SECTION_DICTIONARY, SECTION_HAYBALE)
                | (SECTION_HAYBALE, SECTION_DICTIONARY)
                | (SECTION_HAYBALE, SECTION_TRAILER)
        );
        if !permitted {
            return match id {
                SECTION_HEADER | SECTION_DICTIONARY | SECTION_HAYBALE | SECTION_TRAILER
                | crate::disk::SECTION_SHA512 => Err(HayError::SectionOrder {
                    prev: prev_id,
                    found: id,
                }),
                other => Err(HayError::UnknownSection(other)),
            };
        }

        let Section { id, content, encoded_len } = decode_section(data, pos, key.as_ref())?;
        pos += encoded_len;

        match id {
            SECTION_HEADER => {
                let (uuid, k) = parse_header(&content, keystore)?;
                key = Some(k);
                hs = Some(Haystack::new(uuid));
            }
            SECTION_DICTIONARY => {
                let hs = hs.as_mut().expect("header section precedes");
                parse_dictionary(&content, hs.dict_mut())?;
            }
            SECTION_HAYBALE => {
                let hs = hs.as_mut().expect("header section precedes");
                let bale = parse_haybale(&content, hs.dict())?;
                hs.push_loaded_bale(bale);
            }
            SECTION_TRAILER => {
                let mut cur = Cur::new(&content);
                let _last_dict_ofs = cur.get_uint(4)?;
                let _time_first = cur.get_uint(8)? as i64;
                let _time_last = cur.get_uint(8)? as i64;
                break;
            }
            _ => unreachable!("transition table admits no other id"),
        }

        prev_id = id;
    }

    Ok(hs.expect("loop cannot finish without a header section"))
}
