//! Point and conjunctive search over sorted Haybales.
//!
//! Search binary-searches each bale's (dkey, tag, value) order for the first
//! candidate stalk, scans the run of equal stalks, and walks each hit's bunch
//! chain to materialise the full record. Only sorted bales may be searched;
//! an empty writable bale is trivially allowed.

use crate::error::{HayError, Result};
use crate::mem::{Haybale, Haystack, Record, Value};
use std::cmp::Ordering;
use std::collections::HashSet;

impl Haystack {
    /// Finds every bunch holding at least one stalk with the given key and
    /// value, in sorted position order per bale, bales oldest first.
    ///
    /// An unknown key yields no matches without scanning. Values are parsed
    /// with the same int/float/string rule used at ingest.
    ///
    /// # Errors
    ///
    /// [`HayError::UnsortedHaybale`] if any non-empty bale has not been
    /// sorted yet.
    pub fn search_one(&self, key: &str, value_str: &str) -> Result<Vec<Record>> {
        self.ensure_searchable()?;

        let (dkey, found) = self.dict().exists(key)?;
        if !found {
            return Ok(Vec::new());
        }

        let val = Value::parse(value_str);
        let mut out = Vec::new();

        for bale in self.bales() {
            let mut seen = HashSet::new();
            for j in equal_run(bale, dkey, &val) {
                let stalk = bale.stalk(j);
                if !projection_matches(&stalk.val, value_str) {
                    continue;
                }
                if seen.insert(stalk.first_ofs) {
                    out.push(bale.bunch_record(self.dict(), j));
                }
            }
        }

        Ok(out)
    }

    /// Conjunctive search: every key/value condition must hold within one
    /// bunch for it to match.
    ///
    /// # Errors
    ///
    /// [`HayError::EmptySearch`] for an empty condition set;
    /// [`HayError::UnsortedHaybale`] if any non-empty bale is unsorted.
    pub fn search_and(&self, conditions: &Record) -> Result<Vec<Record>> {
        if conditions.is_empty() {
            return Err(HayError::EmptySearch);
        }
        self.ensure_searchable()?;

        // Resolve all keys up front; any unknown key falsifies the
        // conjunction before a single bale is scanned.
        let mut conds = Vec::with_capacity(conditions.len());
        for (key, value_str) in conditions {
            let (dkey, found) = self.dict().exists(key)?;
            if !found {
                return Ok(Vec::new());
            }
            conds.push((dkey, Value::parse(value_str), value_str.as_str()));
        }

        let (first_dkey, first_val, first_str) = (&conds[0].0, &conds[0].1, conds[0].2);
        let mut out = Vec::new();

        for bale in self.bales() {
            let mut seen = HashSet::new();
            for j in equal_run(bale, *first_dkey, first_val) {
                let stalk = bale.stalk(j);
                if !projection_matches(&stalk.val, first_str) {
                    continue;
                }
                if !seen.insert(stalk.first_ofs) {
                    continue;
                }
                if bunch_satisfies_all(bale, j, &conds) {
                    out.push(bale.bunch_record(self.dict(), j));
                }
            }
        }

        Ok(out)
    }

    fn ensure_searchable(&self) -> Result<()> {
        for bale in self.bales() {
            if !bale.is_sorted() && bale.num_stalks() > 0 {
                return Err(HayError::UnsortedHaybale);
            }
        }
        Ok(())
    }
}

/// Offsets of the stalks comparing equal to `(dkey, val)` in a sorted bale.
///
/// The binary search lands at or before the first match; the run ends at the
/// first stalk comparing greater.
fn equal_run<'a>(bale: &'a Haybale, dkey: u32, val: &'a Value) -> impl Iterator<Item = u32> + 'a {
    let stalks = bale.stalks();
    let start = stalks.partition_point(|s| {
        s.dkey.cmp(&dkey).then_with(|| s.val.compare(val)) == Ordering::Less
    });

    (start as u32..bale.num_stalks()).take_while(move |&j| {
        let s = bale.stalk(j);
        s.dkey == dkey && s.val.compare(val) == Ordering::Equal
    })
}

/// Re-verifies a hit by string projection, guarding against matches that are
/// only equal under the ordering (e.g. numeric spellings that normalise).
/// String values keep the case-insensitive semantics of the ordering.
fn projection_matches(val: &Value, query: &str) -> bool {
    match val {
        Value::Str(s) => {
            s.as_ref() == query || s.to_lowercase() == query.to_lowercase()
        }
        other => other.projection() == query,
    }
}

/// True if the bunch containing stalk `j` holds a compare-equal stalk for
/// every condition.
fn bunch_satisfies_all(bale: &Haybale, j: u32, conds: &[(u32, Value, &str)]) -> bool {
    conds.iter().all(|(dkey, val, _)| {
        bale.bunch_indices(j).any(|i| {
            let s = bale.stalk(i);
            s.dkey == *dkey && s.val.compare(val) == Ordering::Equal
        })
    })
}
