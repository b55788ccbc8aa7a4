//! Haybale: an append-only stalk table that becomes sorted and immutable.
//!
//! A Haybale has two phases. While writable it only supports appends; the
//! stalk order is arrival order and nothing may search it. Finalisation
//! ([`Haybale::sort_bale`]) establishes the total (dkey, tag, value) order,
//! rewrites bunch links through the sort permutation, deduplicates adjacent
//! equal strings, and freezes the bale for concurrent lock-free reads.

use crate::dictionary::Dictionary;
use crate::error::{HayError, Result};
use crate::mem::{Haystalk, Record, Value, OFS_NIL, TIMESTAMP_KEY};
use chrono::DateTime;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

/// Approximate in-memory cost of one stalk, used for flush accounting.
const STALK_MEMSIZE: u32 = 37;

/// Outcome of inserting one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BunchOutcome {
    /// The record was linked into the bale as a bunch.
    Inserted,
    /// The record carried no `_timestamp` and was dropped.
    MissingTimestamp,
}

/// A table of [`Haystalk`]s with time bounds and a size estimate.
pub struct Haybale {
    stalks: Vec<Haystalk>,
    /// Sorted bales are immutable; set exactly once by [`Haybale::sort_bale`].
    is_sorted_immutable: bool,
    /// The bale's Dictionary+Haybale pair has been written to the open file.
    flushed: bool,
    time_first: i64,
    time_last: i64,
    memsize: u32,
    created_at: Instant,
}

impl Haybale {
    /// Creates an empty writable Haybale.
    pub fn new() -> Self {
        Self {
            stalks: Vec::new(),
            is_sorted_immutable: false,
            flushed: false,
            time_first: 0,
            time_last: 0,
            memsize: 0,
            created_at: Instant::now(),
        }
    }

    /// Rebuilds a bale from decoded parts; used by the file reader.
    ///
    /// Loaded bales are sorted and flushed by construction.
    pub(crate) fn from_disk(stalks: Vec<Haystalk>, time_first: i64, time_last: i64, memsize: u32) -> Self {
        Self {
            stalks,
            is_sorted_immutable: true,
            flushed: true,
            time_first,
            time_last,
            memsize,
            created_at: Instant::now(),
        }
    }

    /// Number of stalks in the bale.
    pub fn num_stalks(&self) -> u32 {
        self.stalks.len() as u32
    }

    /// The stalk at `ofs`.
    pub fn stalk(&self, ofs: u32) -> &Haystalk {
        &self.stalks[ofs as usize]
    }

    /// All stalks, in current storage order.
    pub fn stalks(&self) -> &[Haystalk] {
        &self.stalks
    }

    /// Earliest `_timestamp` in the bale (UTC nanoseconds), 0 when empty.
    pub fn time_first(&self) -> i64 {
        self.time_first
    }

    /// Latest `_timestamp` in the bale (UTC nanoseconds), 0 when empty.
    pub fn time_last(&self) -> i64 {
        self.time_last
    }

    /// Estimated in-memory size in bytes.
    pub fn memsize(&self) -> u32 {
        self.memsize
    }

    /// True once the bale has been sorted and frozen.
    pub fn is_sorted(&self) -> bool {
        self.is_sorted_immutable
    }

    /// True once the bale's section pair has been written to disk.
    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    /// Marks the bale as written to the open file.
    pub(crate) fn set_flushed(&mut self) {
        self.flushed = true;
    }

    /// Re-arms the bale for serialisation after its file was abandoned.
    pub(crate) fn clear_flushed(&mut self) {
        self.flushed = false;
    }

    /// Time since this bale was created; drives the flush timers.
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Appends one stalk, interning the key and parsing the value string.
    ///
    /// Bunch links are initialised to [`OFS_NIL`]; the caller wires them.
    /// Returns the new stalk's offset.
    ///
    /// # Errors
    ///
    /// Fails on an immutable bale or on Dictionary probe exhaustion.
    pub fn insert_stalk(&mut self, dict: &mut Dictionary, key: &str, value: &str) -> Result<u32> {
        if self.is_sorted_immutable {
            return Err(HayError::ImmutableHaybale);
        }

        let dkey = dict.find_or_add(key)?;
        let val = Value::parse(value);

        self.memsize += STALK_MEMSIZE + val.extra_memsize();

        let pos = self.stalks.len() as u32;
        self.stalks.push(Haystalk {
            dkey,
            val,
            self_ofs: pos,
            first_ofs: OFS_NIL,
            next_ofs: OFS_NIL,
        });

        Ok(pos)
    }

    /// Inserts a record as one linked bunch.
    ///
    /// The `_timestamp` stalk goes in first and heads the chain; every other
    /// field links back to it via `first_ofs` and chains through `next_ofs`.
    /// Records without `_timestamp` are dropped ([`BunchOutcome::MissingTimestamp`]).
    ///
    /// # Errors
    ///
    /// [`HayError::BadTimestamp`] when the timestamp does not parse (the
    /// bunch is aborted before any stalk is inserted), or any
    /// [`insert_stalk`](Haybale::insert_stalk) failure.
    pub fn insert_bunch(&mut self, dict: &mut Dictionary, record: &Record) -> Result<BunchOutcome> {
        if self.is_sorted_immutable {
            return Err(HayError::ImmutableHaybale);
        }

        let ts_str = match record.get(TIMESTAMP_KEY) {
            Some(v) => v,
            None => return Ok(BunchOutcome::MissingTimestamp),
        };

        let ts = match parse_timestamp(ts_str) {
            Some(ts) => ts,
            None => {
                warn!(timestamp = %ts_str, "cannot parse record timestamp, dropping bunch");
                return Err(HayError::BadTimestamp(ts_str.clone()));
            }
        };

        let first = self.insert_stalk(dict, TIMESTAMP_KEY, ts_str)?;
        self.stalks[first as usize].first_ofs = first;

        if self.time_first == 0 || ts < self.time_first {
            self.time_first = ts;
        }
        if ts > self.time_last {
            self.time_last = ts;
        }

        // Chain the remaining fields backwards; _timestamp ends up in front.
        let mut prev = OFS_NIL;
        for (k, v) in record {
            if k == TIMESTAMP_KEY || k.is_empty() {
                continue;
            }
            let pos = self.insert_stalk(dict, k, v)?;
            self.stalks[pos as usize].first_ofs = first;
            self.stalks[pos as usize].next_ofs = prev;
            prev = pos;
        }
        self.stalks[first as usize].next_ofs = prev;

        Ok(BunchOutcome::Inserted)
    }

    /// Sorts the bale, rewires bunch links, dedups adjacent equal strings,
    /// and freezes it. A no-op on an already-sorted bale.
    pub fn sort_bale(&mut self) {
        if self.is_sorted_immutable {
            return;
        }

        // Stable sort: insertion order breaks ties among equal stalks.
        self.stalks.sort_by(|a, b| a.compare(b));

        // new_pos[old offset] = new offset
        let mut new_pos = vec![0u32; self.stalks.len()];
        for (i, stalk) in self.stalks.iter().enumerate() {
            new_pos[stalk.self_ofs as usize] = i as u32;
        }

        let mut prev_string: Option<Arc<str>> = None;
        for i in 0..self.stalks.len() {
            let stalk = &mut self.stalks[i];

            if stalk.first_ofs != OFS_NIL {
                stalk.first_ofs = new_pos[stalk.first_ofs as usize];
            }
            if stalk.next_ofs != OFS_NIL {
                stalk.next_ofs = new_pos[stalk.next_ofs as usize];
            }
            stalk.self_ofs = i as u32;

            // De-dup: exact byte equality only, adjacent string stalks only.
            if let Value::Str(s) = &stalk.val {
                match &prev_string {
                    Some(prev) if prev.as_ref() == s.as_ref() => {
                        self.memsize -= s.len() as u32;
                        stalk.val = Value::Str(Arc::clone(prev));
                    }
                    _ => prev_string = Some(Arc::clone(s)),
                }
            }
        }

        self.is_sorted_immutable = true;
    }

    /// Iterates the offsets of the bunch containing the stalk at `ofs`,
    /// starting from its `_timestamp` head.
    pub fn bunch_indices(&self, ofs: u32) -> BunchIter<'_> {
        BunchIter {
            bale: self,
            cur: self.stalks[ofs as usize].first_ofs,
        }
    }

    /// Materialises the bunch containing the stalk at `ofs` as a record.
    ///
    /// Duplicate keys within a bunch collapse, last chained member wins.
    pub fn bunch_record(&self, dict: &Dictionary, ofs: u32) -> Record {
        let mut rec = Record::new();
        for i in self.bunch_indices(ofs) {
            let stalk = &self.stalks[i as usize];
            if let Some(name) = dict.name(stalk.dkey) {
                rec.insert(name.to_string(), stalk.val.projection());
            }
        }
        rec
    }
}

impl Default for Haybale {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Haybale {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Haybale")
            .field("num_stalks", &self.stalks.len())
            .field("is_sorted_immutable", &self.is_sorted_immutable)
            .field("memsize", &self.memsize)
            .finish()
    }
}

/// Iterator over a bunch chain, yielding stalk offsets.
pub struct BunchIter<'a> {
    bale: &'a Haybale,
    cur: u32,
}

impl Iterator for BunchIter<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.cur == OFS_NIL {
            return None;
        }
        let out = self.cur;
        self.cur = self.bale.stalks[out as usize].next_ofs;
        Some(out)
    }
}

/// Parses a record timestamp into UTC nanoseconds.
///
/// RFC 3339 with nanoseconds is the primary form; a legacy
/// `YYYY-MM-DDThh:mm:ss.fffffffff+0000` spelling is the fallback.
pub fn parse_timestamp(s: &str) -> Option<i64> {
    let parsed = DateTime::parse_from_rfc3339(s)
        .or_else(|_| DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z"))
        .ok()?;
    parsed.timestamp_nanos_opt()
}
