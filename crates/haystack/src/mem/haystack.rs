//! Haystack: an ordered collection of Haybales sharing one Dictionary.

use crate::dictionary::Dictionary;
use crate::error::Result;
use crate::mem::{BunchOutcome, Haybale, Record};
use uuid::Uuid;

/// An ordered list of [`Haybale`]s (oldest first) plus the Dictionary they
/// share and the AES key UUID any serialised file will be bound to.
///
/// The last bale is the writable one; everything before it is sorted or on
/// its way to disk. A Haystack accumulates bales until the configured size
/// threshold, is flushed as one file, and is then replaced whole.
pub struct Haystack {
    dict: Dictionary,
    bales: Vec<Haybale>,
    aes_key_uuid: Uuid,
    memsize: u32,
}

impl Haystack {
    /// Creates an empty Haystack bound to the given AES key UUID, with one
    /// fresh writable bale.
    pub fn new(aes_key_uuid: Uuid) -> Self {
        Self {
            dict: Dictionary::new(),
            bales: vec![Haybale::new()],
            aes_key_uuid,
            memsize: 0,
        }
    }

    /// The AES key UUID stamped into this Haystack's file header.
    pub fn aes_key_uuid(&self) -> Uuid {
        self.aes_key_uuid
    }

    /// The shared key Dictionary.
    pub fn dict(&self) -> &Dictionary {
        &self.dict
    }

    /// Mutable access to the Dictionary (serialisation clears dirty flags).
    pub fn dict_mut(&mut self) -> &mut Dictionary {
        &mut self.dict
    }

    /// All bales, oldest first.
    pub fn bales(&self) -> &[Haybale] {
        &self.bales
    }

    /// Mutable access to the bales, for finalisation.
    pub fn bales_mut(&mut self) -> &mut [Haybale] {
        &mut self.bales
    }

    /// The writable bale ingest currently appends to.
    pub fn current_bale(&self) -> &Haybale {
        self.bales.last().expect("a Haystack always has a bale")
    }

    /// Accumulated size estimate across all bales.
    pub fn memsize(&self) -> u32 {
        self.memsize
    }

    /// Inserts a record into the current bale and tracks the size delta.
    pub fn insert_bunch(&mut self, record: &Record) -> Result<BunchOutcome> {
        let bale = self.bales.last_mut().expect("a Haystack always has a bale");
        let before = bale.memsize();
        let outcome = bale.insert_bunch(&mut self.dict, record)?;
        self.memsize += bale.memsize() - before;
        Ok(outcome)
    }

    /// Sorts every bale that is still writable.
    pub fn sort_all(&mut self) {
        let mut saved = 0;
        for bale in &mut self.bales {
            let before = bale.memsize();
            bale.sort_bale();
            saved += before - bale.memsize();
        }
        self.memsize -= saved;
    }

    /// Detaches the current writable bale for flushing and replaces it with
    /// a fresh one so ingest continues unblocked.
    pub(crate) fn take_current_bale(&mut self) -> Haybale {
        let bale = self.bales.pop().expect("a Haystack always has a bale");
        self.bales.push(Haybale::new());
        bale
    }

    /// Puts a flushed (sorted) bale back in front of the writable one, so it
    /// stays searchable until the whole Haystack is released.
    pub(crate) fn reinsert_bale(&mut self, bale: Haybale) {
        let at = self.bales.len() - 1;
        self.bales.insert(at, bale);
    }

    /// Adds a bale decoded from disk, keeping the writable bale last.
    pub(crate) fn push_loaded_bale(&mut self, bale: Haybale) {
        self.memsize += bale.memsize();
        let at = self.bales.len() - 1;
        self.bales.insert(at, bale);
    }

    /// Whole-stack time bounds over all non-empty bales: `(time_first,
    /// time_last)`, `(0, 0)` when nothing has been ingested.
    pub fn time_bounds(&self) -> (i64, i64) {
        let mut first = 0i64;
        let mut last = 0i64;
        for bale in &self.bales {
            if bale.num_stalks() == 0 {
                continue;
            }
            if first == 0 || bale.time_first() < first {
                first = bale.time_first();
            }
            if bale.time_last() > last {
                last = bale.time_last();
            }
        }
        (first, last)
    }

    /// Materialises every bunch in every bale, oldest bale first; the debug
    /// print path.
    pub fn all_records(&self) -> Vec<Record> {
        let mut out = Vec::new();
        for bale in &self.bales {
            for i in 0..bale.num_stalks() {
                // Emit each bunch once, from its head stalk.
                if bale.stalk(i).first_ofs == i {
                    out.push(bale.bunch_record(&self.dict, i));
                }
            }
        }
        out
    }
}

impl std::fmt::Debug for Haystack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Haystack")
            .field("num_bales", &self.bales.len())
            .field("num_dkeys", &self.dict.len())
            .field("memsize", &self.memsize)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::TIMESTAMP_KEY;

    fn record(ts: &str, pairs: &[(&str, &str)]) -> Record {
        let mut rec: Record = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        rec.insert(TIMESTAMP_KEY.to_string(), ts.to_string());
        rec
    }

    #[test]
    fn test_memsize_tracks_bales() {
        let mut hs = Haystack::new(Uuid::nil());
        assert_eq!(hs.memsize(), 0);

        hs.insert_bunch(&record("2023-06-01T00:00:00Z", &[("src", "a")]))
            .unwrap();
        assert_eq!(hs.memsize(), hs.current_bale().memsize());
        assert!(hs.memsize() > 0);
    }

    #[test]
    fn test_time_bounds_across_bales() {
        let mut hs = Haystack::new(Uuid::nil());
        hs.insert_bunch(&record("2023-06-01T00:00:02Z", &[])).unwrap();

        let old = hs.take_current_bale();
        hs.reinsert_bale(old);

        hs.insert_bunch(&record("2023-06-01T00:00:01Z", &[])).unwrap();
        hs.insert_bunch(&record("2023-06-01T00:00:03Z", &[])).unwrap();

        let (first, last) = hs.time_bounds();
        assert!(first < last);
        assert_eq!(last - first, 2_000_000_000);
    }

    #[test]
    fn test_all_records_round_trip() {
        let mut hs = Haystack::new(Uuid::nil());
        hs.insert_bunch(&record("2023-06-01T00:00:00Z", &[("src", "a"), ("dst", "b")]))
            .unwrap();
        hs.sort_all();

        let records = hs.all_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("src").unwrap(), "a");
        assert_eq!(records[0].get("dst").unwrap(), "b");
        assert!(records[0].contains_key(TIMESTAMP_KEY));
    }
}
