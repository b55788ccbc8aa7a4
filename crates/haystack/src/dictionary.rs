//! 24-bit open-addressed hash table interning key names.
//!
//! Every key name used by a [`Haystack`](crate::mem::Haystack) is interned
//! here once and addressed by its 24-bit slot number (the `dkey`). Lookups
//! are case-insensitive; the original spelling is retained for output.
//! Entries are never removed: the table grows monotonically for the lifetime
//! of its Haystack, and a dirty flag per entry tracks what still has to go
//! into the next incremental dictionary section on disk.

use crate::error::{HayError, Result};
use std::sync::Arc;

/// Number of slots in the key hash table (exact, 2^24).
pub const HASHTABLE_SIZE: usize = 16 * 1024 * 1024;

/// Maximum byte length of a key name.
pub const MAX_KEYLEN: usize = 255;

/// Probe step; coprime to 2^24 so a full sweep visits every slot.
const HASH_SKIP: u32 = 101;

/// Mask bounding a 32-bit FNV hash to the 24-bit table.
const HASHKEY_MASK: u32 = 0x00ff_ffff;

/// Slot table sentinel for an empty slot.
const EMPTY_SLOT: u32 = u32::MAX;

/// One interned key name.
#[derive(Debug, Clone)]
struct DictEntry {
    /// Slot number, i.e. the dkey stalks refer to.
    dkey: u32,
    /// Key name in its original case.
    name: Arc<str>,
    /// Not yet written into an on-disk dictionary section.
    dirty: bool,
}

/// Key-name intern table with a fixed 2^24-slot probe space.
///
/// The slot array holds indices into an insertion-ordered entry pool rather
/// than the strings themselves; slot numbers, probe order and the on-disk
/// form are identical to a direct pointer table, at a quarter of the memory.
pub struct Dictionary {
    /// dkey -> entry pool index, [`EMPTY_SLOT`] when unoccupied.
    slots: Box<[u32]>,
    /// Interned entries in insertion order.
    entries: Vec<DictEntry>,
}

impl Dictionary {
    /// Creates an empty Dictionary.
    pub fn new() -> Self {
        Self {
            slots: vec![EMPTY_SLOT; HASHTABLE_SIZE].into_boxed_slice(),
            entries: Vec::new(),
        }
    }

    /// 32-bit FNV-1a of the (already lower-cased) key, bounded to 24 bits.
    fn key_hash(lowered: &str) -> u32 {
        let mut hash: u32 = 0x811c_9dc5;
        for b in lowered.as_bytes() {
            hash ^= u32::from(*b);
            hash = hash.wrapping_mul(16_777_619);
        }
        hash & HASHKEY_MASK
    }

    /// Looks a key up case-insensitively.
    ///
    /// Returns `(slot, true)` when the key is present, or `(slot, false)`
    /// with the first free slot on its probe path when it is not.
    ///
    /// # Errors
    ///
    /// Returns [`HayError::DictionaryFull`] if a full sweep of the table
    /// finds neither the key nor an empty slot.
    pub fn exists(&self, key: &str) -> Result<(u32, bool)> {
        let lowered = key.to_lowercase();
        let mut h = Self::key_hash(&lowered);

        for _ in 0..HASHTABLE_SIZE {
            match self.slot_name(h) {
                None => return Ok((h, false)),
                Some(name) if name.to_lowercase() == lowered => return Ok((h, true)),
                Some(_) => h = (h + HASH_SKIP) & HASHKEY_MASK,
            }
        }

        Err(HayError::DictionaryFull(key.to_string()))
    }

    /// Returns the slot for `key`, interning it if necessary.
    ///
    /// New keys are stored in their original case and marked dirty for the
    /// next dictionary section.
    ///
    /// # Panics
    ///
    /// Panics if the key exceeds [`MAX_KEYLEN`] bytes; callers must guard at
    /// ingest, a longer key is a programming error.
    pub fn find_or_add(&mut self, key: &str) -> Result<u32> {
        assert!(
            key.len() <= MAX_KEYLEN,
            "key {:?} longer than {} bytes",
            key,
            MAX_KEYLEN
        );

        let (h, found) = self.exists(key)?;
        if !found {
            self.slots[h as usize] = self.entries.len() as u32;
            self.entries.push(DictEntry {
                dkey: h,
                name: Arc::from(key),
                dirty: true,
            });
        }
        Ok(h)
    }

    /// Places a key name at an exact slot, as read back from disk.
    ///
    /// Loaded entries are not dirty: they already exist on disk.
    pub fn install(&mut self, dkey: u32, name: &str) {
        let idx = self.slots[(dkey & HASHKEY_MASK) as usize];
        if idx != EMPTY_SLOT {
            // Incremental sections may repeat a key; keep the first copy.
            return;
        }
        self.slots[(dkey & HASHKEY_MASK) as usize] = self.entries.len() as u32;
        self.entries.push(DictEntry {
            dkey: dkey & HASHKEY_MASK,
            name: Arc::from(name),
            dirty: false,
        });
    }

    /// Returns the key name stored at `dkey`, if any.
    pub fn name(&self, dkey: u32) -> Option<&Arc<str>> {
        let idx = self.slots[(dkey & HASHKEY_MASK) as usize];
        if idx == EMPTY_SLOT {
            None
        } else {
            Some(&self.entries[idx as usize].name)
        }
    }

    fn slot_name(&self, slot: u32) -> Option<&Arc<str>> {
        let idx = self.slots[slot as usize];
        if idx == EMPTY_SLOT {
            None
        } else {
            Some(&self.entries[idx as usize].name)
        }
    }

    /// Number of interned keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no keys have been interned.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries as `(dkey, name)`, in insertion order.
    pub fn all_entries(&self) -> Vec<(u32, Arc<str>)> {
        self.entries
            .iter()
            .map(|e| (e.dkey, Arc::clone(&e.name)))
            .collect()
    }

    /// Collects the entries not yet serialised and clears their dirty flags.
    pub fn take_dirty(&mut self) -> Vec<(u32, Arc<str>)> {
        let mut out = Vec::new();
        for e in &mut self.entries {
            if e.dirty {
                e.dirty = false;
                out.push((e.dkey, Arc::clone(&e.name)));
            }
        }
        out
    }

    /// Re-arms the dirty flag on the given slots after a failed flush.
    pub fn mark_dirty(&mut self, dkeys: &[(u32, Arc<str>)]) {
        for (dkey, _) in dkeys {
            let idx = self.slots[(*dkey & HASHKEY_MASK) as usize];
            if idx != EMPTY_SLOT {
                self.entries[idx as usize].dirty = true;
            }
        }
    }
}

impl Default for Dictionary {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Dictionary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dictionary")
            .field("num_dkeys", &self.entries.len())
            .finish()
    }
}
