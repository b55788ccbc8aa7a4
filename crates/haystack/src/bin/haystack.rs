//! Haystack test & benchmark tool.
//!
//! Drives the storage engine from the command line: ingest JSON lines,
//! write and read back Haystack files, print memory, and run key/value
//! searches. Also generates keystore records for setting up a deployment.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use clap::Parser;
use haystack::disk::{catalogue, file};
use haystack::{ingest, HayError, Haystack, KeyStore, Settings};
use rand_core::{OsRng, RngCore};
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Haystack log management system test & benchmark tool.
#[derive(Parser, Debug)]
#[command(name = "haystack", version)]
struct Args {
    /// Configuration file; loaded and validated before anything else.
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// AES keystore CSV, when running without a configuration file.
    #[arg(short = 'k', long, value_name = "FILE")]
    keystore: Option<PathBuf>,

    /// Ingest JSON lines from a file into memory.
    #[arg(short = 'i', value_name = "FILE")]
    ingest: Option<PathBuf>,

    /// Write memory to a Haystack file and its catalogue entry.
    #[arg(short = 'w', value_name = "FILE")]
    write: Option<PathBuf>,

    /// Read a Haystack file back into memory.
    #[arg(short = 'r', value_name = "FILE")]
    read: Option<PathBuf>,

    /// Print memory to stdout, one JSON object per bunch.
    #[arg(short = 'p')]
    print: bool,

    /// Conjunctive key/value search: --kv <key> <value> [<key> <value> ...]
    #[arg(long = "kv", num_args = 2.., value_names = ["KEY", "VALUE"])]
    kv: Vec<String>,

    /// Generate a keystore record (uuid,base64key,label) and exit.
    #[arg(long)]
    genkey: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(%e, "haystack failed");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> haystack::Result<()> {
    if args.genkey {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        println!("{},{},generated", Uuid::new_v4(), BASE64.encode(key));
        return Ok(());
    }

    // Settings are optional for memory-only runs; file I/O needs a keystore.
    let settings = match &args.config {
        Some(path) => {
            let mut settings = Settings::load(path)?;
            settings.validate_system()?;
            Some(settings)
        }
        None => None,
    };

    let keystore = match (&settings, &args.keystore) {
        (_, Some(path)) => Some(KeyStore::load(path)?),
        (Some(s), None) => Some(KeyStore::load(&s.aes_keystore_list)?),
        (None, None) => None,
    };

    let uuid = keystore
        .as_ref()
        .map(|ks| ks.current_uuid())
        .unwrap_or_else(Uuid::nil);
    let mut hs = Haystack::new(uuid);
    let mut action = false;

    if let Some(path) = &args.ingest {
        action = true;
        ingest_file(&mut hs, path)?;
    }

    if let Some(path) = &args.read {
        action = true;
        let keystore = keystore
            .as_ref()
            .ok_or_else(|| HayError::Config("-r needs a keystore (-k or -c)".into()))?;
        let data = fs::read(path)?;
        hs = file::haystack_from_bytes(&data, keystore)?;
        info!(file = %path.display(), bales = hs.bales().len(), "haystack loaded");
    }

    if let Some(path) = &args.write {
        action = true;
        let keystore = keystore
            .as_ref()
            .ok_or_else(|| HayError::Config("-w needs a keystore (-k or -c)".into()))?;
        let compression_level = settings.as_ref().map(|s| s.compression_level).unwrap_or(9);

        let start = Instant::now();
        let data = file::haystack_to_bytes(&mut hs, keystore, compression_level)?;
        let mut out = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o660)
            .open(path)?;
        out.write_all(&data)?;
        out.sync_all()?;
        drop(out);

        let (time_first, time_last) = hs.time_bounds();
        let catalogue_dir = settings
            .as_ref()
            .map(|s| s.catalogue_dir.clone())
            .or_else(|| path.parent().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("."));
        let catalogue_path =
            catalogue::create(path, &catalogue_dir, keystore, uuid, time_first, time_last)?;

        info!(
            file = %path.display(),
            catalogue = %catalogue_path.display(),
            bytes = data.len(),
            elapsed = ?start.elapsed(),
            "haystack written"
        );
    }

    if args.print {
        action = true;
        hs.sort_all();
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        for record in hs.all_records() {
            serde_json::to_writer(&mut out, &record)
                .map_err(|e| HayError::Ingest(format!("cannot render record: {e}")))?;
            writeln!(out)?;
        }
    }

    if !args.kv.is_empty() {
        action = true;
        if args.kv.len() % 2 != 0 {
            return Err(HayError::Config(
                "--kv takes key/value pairs; got an odd number of arguments".into(),
            ));
        }

        hs.sort_all();
        let start = Instant::now();
        let hits = if args.kv.len() == 2 {
            hs.search_one(&args.kv[0], &args.kv[1])?
        } else {
            let conditions = args
                .kv
                .chunks(2)
                .map(|pair| (pair[0].clone(), pair[1].clone()))
                .collect();
            hs.search_and(&conditions)?
        };

        for hit in &hits {
            let line = serde_json::to_string(hit)
                .map_err(|e| HayError::Ingest(format!("cannot render record: {e}")))?;
            println!("{line}");
        }
        info!(matches = hits.len(), elapsed = ?start.elapsed(), "search done");
    }

    if !action {
        return Err(HayError::Config(
            "nothing to do; see --help for usage".into(),
        ));
    }

    Ok(())
}

fn ingest_file(hs: &mut Haystack, path: &PathBuf) -> haystack::Result<()> {
    info!(file = %path.display(), "ingesting JSON lines");
    let file = fs::File::open(path)?;
    let reader = BufReader::new(file);

    let start = Instant::now();
    let mut lines = 0u64;
    let mut dropped = 0u64;

    for line in reader.lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        lines += 1;

        let record = match ingest::json_line_to_record(&line) {
            Ok(record) => record,
            Err(e) => {
                warn!(line = lines, %e, "skipping unparseable line");
                dropped += 1;
                continue;
            }
        };

        match hs.insert_bunch(&record) {
            Ok(haystack::BunchOutcome::Inserted) => {}
            Ok(haystack::BunchOutcome::MissingTimestamp) => dropped += 1,
            Err(HayError::BadTimestamp(_)) => dropped += 1,
            Err(e) => return Err(e),
        }
    }

    info!(
        lines,
        dropped,
        elapsed = ?start.elapsed(),
        "ingest finished"
    );
    Ok(())
}
