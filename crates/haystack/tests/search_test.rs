//! Ingest-to-search integration tests plus property tests for the sort
//! and linkage invariants.

use haystack::ingest::json_line_to_record;
use haystack::mem::{OFS_NIL, TIMESTAMP_KEY};
use haystack::{Haystack, Record};
use proptest::prelude::*;
use uuid::Uuid;

fn ingest_lines(lines: &[&str]) -> Haystack {
    let mut hs = Haystack::new(Uuid::nil());
    for line in lines {
        let record = json_line_to_record(line).unwrap();
        hs.insert_bunch(&record).unwrap();
    }
    hs.sort_all();
    hs
}

#[test]
fn test_ingest_then_search() {
    let hs = ingest_lines(&[
        r#"{"_timestamp":"2023-06-01T00:00:00Z","src_ip":"10.0.0.1","event":{"type":"alert","severity":3}}"#,
        r#"{"_timestamp":"2023-06-01T00:00:01Z","src_ip":"10.0.0.2","event":{"type":"alert","severity":1}}"#,
        r#"{"_timestamp":"2023-06-01T00:00:02Z","src_ip":"10.0.0.1","event":{"type":"flow","severity":3}}"#,
    ]);

    // Flattened keys are searchable like any other.
    assert_eq!(hs.search_one("event.type", "alert").unwrap().len(), 2);
    assert_eq!(hs.search_one("event.severity", "3").unwrap().len(), 2);
    assert_eq!(hs.search_one("src_ip", "10.0.0.1").unwrap().len(), 2);

    let mut conds = Record::new();
    conds.insert("src_ip".into(), "10.0.0.1".into());
    conds.insert("event.severity".into(), "3".into());
    let hits = hs.search_and(&conds).unwrap();
    assert_eq!(hits.len(), 2);

    conds.insert("event.type".into(), "alert".into());
    let hits = hs.search_and(&conds).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].get(TIMESTAMP_KEY).unwrap(), "2023-06-01T00:00:00Z");
}

#[test]
fn test_search_results_in_bale_order() {
    let hs = ingest_lines(&[
        r#"{"_timestamp":"2023-06-01T00:00:05Z","tag":"x","seq":"late"}"#,
        r#"{"_timestamp":"2023-06-01T00:00:01Z","tag":"x","seq":"early"}"#,
    ]);

    // Within one bale, matches come out in sorted stalk order; the two
    // "x" stalks sort by their bunch's surroundings deterministically.
    let hits = hs.search_one("tag", "x").unwrap();
    assert_eq!(hits.len(), 2);
}

#[test]
fn test_case_insensitive_values() {
    let hs = ingest_lines(&[
        r#"{"_timestamp":"2023-06-01T00:00:00Z","proto":"TCP"}"#,
        r#"{"_timestamp":"2023-06-01T00:00:01Z","proto":"tcp"}"#,
    ]);

    assert_eq!(hs.search_one("proto", "tcp").unwrap().len(), 2);
    assert_eq!(hs.search_one("PROTO", "TCP").unwrap().len(), 2);
}

// ---------------------------------------------------------------------------
// Property tests: quantified invariants over generated record batches.
// ---------------------------------------------------------------------------

fn arb_value() -> impl Strategy<Value = String> {
    prop_oneof![
        any::<i64>().prop_map(|i| i.to_string()),
        (-1.0e12..1.0e12f64).prop_map(|f| format!("{f:.3}")),
        "[a-z]{0,12}",
    ]
}

fn arb_record() -> impl Strategy<Value = Vec<(String, String)>> {
    prop::collection::vec(("[a-f]{1,3}", arb_value()), 0..6)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_sort_invariants(batches in prop::collection::vec(arb_record(), 1..40)) {
        let mut hs = Haystack::new(Uuid::nil());
        let mut inserted = 0u32;

        for (i, pairs) in batches.iter().enumerate() {
            let mut record = Record::new();
            record.insert(
                TIMESTAMP_KEY.to_string(),
                format!("2023-06-01T00:00:{:02}.{:09}Z", i % 60, i),
            );
            for (k, v) in pairs {
                record.insert(k.clone(), v.clone());
            }
            inserted += record.len() as u32;
            hs.insert_bunch(&record).unwrap();
        }

        hs.sort_all();
        let bale = &hs.bales()[0];
        let n = bale.num_stalks();
        prop_assert_eq!(n, inserted);

        let ts_dkey = hs.dict().exists(TIMESTAMP_KEY).unwrap().0;

        // Total order over all adjacent pairs.
        for w in bale.stalks().windows(2) {
            prop_assert_ne!(w[0].compare(&w[1]), std::cmp::Ordering::Greater);
        }

        for j in 0..n {
            let stalk = bale.stalk(j);

            // Link bounds.
            prop_assert!(stalk.first_ofs < n);
            prop_assert!(stalk.next_ofs == OFS_NIL || stalk.next_ofs < n);

            // The chain terminates within n hops at a NIL next_ofs, and
            // contains exactly one _timestamp stalk: the self-pointing head.
            let chain: Vec<u32> = bale.bunch_indices(j).collect();
            prop_assert!(chain.len() <= n as usize);
            let heads = chain
                .iter()
                .filter(|&&i| bale.stalk(i).dkey == ts_dkey && bale.stalk(i).first_ofs == i)
                .count();
            prop_assert_eq!(heads, 1);
        }
    }

    #[test]
    fn prop_search_soundness(values in prop::collection::vec("[a-d]{1,4}", 1..30)) {
        let mut hs = Haystack::new(Uuid::nil());
        for (i, v) in values.iter().enumerate() {
            let mut record = Record::new();
            record.insert(
                TIMESTAMP_KEY.to_string(),
                format!("2023-06-01T00:00:00.{i:09}Z"),
            );
            record.insert("needle".to_string(), v.clone());
            hs.insert_bunch(&record).unwrap();
        }
        hs.sort_all();

        // Every distinct value is found exactly as often as it was inserted.
        let mut distinct: Vec<&String> = values.iter().collect();
        distinct.sort();
        distinct.dedup();
        for v in distinct {
            let expected = values.iter().filter(|x| *x == v).count();
            let hits = hs.search_one("needle", v).unwrap();
            prop_assert_eq!(hits.len(), expected);
            for hit in &hits {
                prop_assert_eq!(hit.get("needle").unwrap(), v);
            }
        }
    }
}
