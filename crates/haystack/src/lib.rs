//! Haystack - an immutable, write-once / read-many log store where every
//! field is searchable.
//!
//! This crate provides the storage engine for the Haystack log management
//! system.
//!
//! # Components
//!
//! - [`Dictionary`](dictionary::Dictionary): 24-bit hash table interning key names
//! - [`Haybale`](mem::Haybale) / [`Haystack`](mem::Haystack): sorted, searchable in-memory tables
//! - [`disk`]: compressed, authenticated-encrypted on-disk sections
//! - [`Store`](store::Store): background writer with flush thresholds
//!
//! # Example
//!
//! ```rust,ignore
//! use haystack::{ingest, Haystack};
//! use uuid::Uuid;
//!
//! let mut hs = Haystack::new(keystore.current_uuid());
//!
//! // Ingest flattened JSON records
//! for line in log_lines {
//!     let record = ingest::json_line_to_record(line)?;
//!     hs.insert_bunch(&record)?;
//! }
//!
//! // Finalise, then search any field
//! hs.sort_all();
//! let hits = hs.search_one("src_ip", "10.0.0.1")?;
//! ```

#![deny(missing_docs)]

pub mod config;
pub mod dictionary;
pub mod disk;
pub mod error;
pub mod ingest;
pub mod mem;
pub mod store;

pub use config::{KeyStore, Settings};
pub use dictionary::Dictionary;
pub use error::{HayError, Result};
pub use mem::{BunchOutcome, Haybale, Haystack, Record, Value};
pub use store::{Store, WriterCmd};
