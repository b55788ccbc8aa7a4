//! The Store: ingest front door plus the background disk writer.
//!
//! Ingest and flushing are decoupled: callers insert records under a single
//! short-held mutex and, when a threshold is crossed, post a command to the
//! writer's mailbox and move on. The writer thread owns the open file, the
//! AES nonce counter, and all I/O; it detaches bales (or whole Haystacks)
//! under the same mutex, then sorts, compresses, encrypts, and writes
//! without blocking ingest.
//!
//! ```text
//! ingest task ──insert──► active Haystack (mutex)
//!      │                        ▲      │ swap
//!      └─────FlushHaybale──────► writer thread ──► <hostname>.hs
//!             FlushHaystack        │                  │ trailer + rename
//!             Close (join)         └─► catalogue      ▼
//!                                                <t0>-<t1>.hs + .hsc
//! ```

use crate::config::{KeyStore, Settings};
use crate::disk::catalogue;
use crate::disk::file::{dictionary_entries_for_pair, SectionWriter};
use crate::error::{HayError, Result};
use crate::mem::{BunchOutcome, Haybale, Haystack, Record};
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

/// Commands accepted by the writer's mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterCmd {
    /// Wake up and do nothing.
    Nop,
    /// Finalise and append the current Haybale.
    FlushHaybale,
    /// Flush everything, commit the file, start a fresh Haystack.
    FlushHaystack,
    /// Drain, final flush, exit.
    Close,
}

/// Commands for the disk reader task (prefetch; reserved).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderCmd {
    /// Wake up and do nothing.
    Nop,
}

/// State shared between ingest callers and the writer thread.
struct Shared {
    /// The active Haystack; the single swap mutex of the store.
    active: Mutex<Haystack>,
    settings: Settings,
    keystore: KeyStore,
}

/// Handle to a running store.
///
/// Dropping the handle closes the store; [`Store::close`] does the same with
/// an error report.
pub struct Store {
    shared: Arc<Shared>,
    cmd_tx: Sender<WriterCmd>,
    writer: Option<JoinHandle<()>>,
    reader_tx: Option<Sender<ReaderCmd>>,
    reader: Option<JoinHandle<()>>,
}

impl Store {
    /// Starts the store: allocates the first Haystack bound to the current
    /// AES key and spawns the writer thread.
    pub fn open(settings: Settings, keystore: KeyStore) -> Result<Self> {
        let temp_path = settings
            .datastore_dir
            .join(format!("{}.hs", hostname()?.to_lowercase()));

        let shared = Arc::new(Shared {
            active: Mutex::new(Haystack::new(keystore.current_uuid())),
            settings,
            keystore,
        });

        let (cmd_tx, cmd_rx) = unbounded();
        let task = WriterTask {
            shared: Arc::clone(&shared),
            cmd_rx,
            temp_path,
            file: None,
            section_writer: None,
            prev_pair_ofs: 0,
            bytes_written: 0,
            pending: None,
        };
        let writer = thread::Builder::new()
            .name("haystack-writer".into())
            .spawn(move || task.run())?;

        // Disk prefetch is reserved: the mailbox exists, the task just
        // drains it until shutdown.
        let (reader_tx, reader_rx) = unbounded::<ReaderCmd>();
        let reader = thread::Builder::new()
            .name("haystack-reader".into())
            .spawn(move || while reader_rx.recv().is_ok() {})?;

        info!("haystack store started");
        Ok(Self {
            shared,
            cmd_tx,
            writer: Some(writer),
            reader_tx: Some(reader_tx),
            reader: Some(reader),
        })
    }

    /// Inserts one record into the active Haystack and signals the writer
    /// if a flush threshold was crossed. Never blocks on the writer.
    ///
    /// # Errors
    ///
    /// [`HayError::BadTimestamp`] drops just this record; the store stays
    /// usable.
    pub fn insert(&self, record: &Record) -> Result<BunchOutcome> {
        let (outcome, stack_size, bale_size) = {
            let mut hs = self.shared.active.lock();
            let outcome = hs.insert_bunch(record)?;
            (outcome, hs.memsize(), hs.current_bale().memsize())
        };

        let s = &self.shared.settings;
        if s.haystack_wait_maxsize > 0 && stack_size >= s.haystack_wait_maxsize {
            self.send(WriterCmd::FlushHaystack);
        } else if s.haybale_wait_minsize > 0 && bale_size >= s.haybale_wait_minsize {
            self.send(WriterCmd::FlushHaybale);
        }

        Ok(outcome)
    }

    /// Requests a Haybale flush.
    pub fn flush_haybale(&self) {
        self.send(WriterCmd::FlushHaybale);
    }

    /// Requests a full Haystack flush.
    pub fn flush_haystack(&self) {
        self.send(WriterCmd::FlushHaystack);
    }

    /// Runs `f` against the active Haystack under the swap mutex.
    pub fn with_active<R>(&self, f: impl FnOnce(&Haystack) -> R) -> R {
        f(&self.shared.active.lock())
    }

    /// Shuts the store down: a final Haystack flush, then the writer exits
    /// and is joined (the shutdown barrier).
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn send(&self, cmd: WriterCmd) {
        if self.cmd_tx.send(cmd).is_err() {
            error!("writer thread is gone; {cmd:?} dropped");
        }
    }

    fn shutdown(&mut self) -> Result<()> {
        if let Some(handle) = self.writer.take() {
            let _ = self.cmd_tx.send(WriterCmd::Close);
            handle
                .join()
                .map_err(|_| HayError::Config("writer thread panicked".into()))?;
        }
        if let Some(handle) = self.reader.take() {
            // Dropping our sender disconnects the reader's mailbox.
            drop(self.reader_tx.take());
            let _ = handle.join();
        }
        Ok(())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// The writer thread: one cooperative task owning all file state.
struct WriterTask {
    shared: Arc<Shared>,
    cmd_rx: Receiver<WriterCmd>,
    /// `<datastore_dir>/<hostname>.hs`, reused across flush attempts.
    temp_path: PathBuf,
    file: Option<File>,
    section_writer: Option<SectionWriter>,
    /// Byte offset of the previous Dictionary+Haybale pair, 0 before the
    /// first; also selects full vs incremental dictionary sections.
    prev_pair_ofs: u32,
    bytes_written: u64,
    /// A Haystack whose flush failed, parked for retry.
    pending: Option<Haystack>,
}

impl WriterTask {
    fn run(mut self) {
        let maxtime = self.shared.settings.haybale_wait_maxtime;
        loop {
            let cmd = if maxtime > 0 {
                match self.cmd_rx.recv_timeout(Duration::from_secs(u64::from(maxtime))) {
                    Ok(cmd) => cmd,
                    Err(RecvTimeoutError::Timeout) => WriterCmd::FlushHaybale,
                    Err(RecvTimeoutError::Disconnected) => WriterCmd::Close,
                }
            } else {
                self.cmd_rx.recv().unwrap_or(WriterCmd::Close)
            };

            match cmd {
                WriterCmd::Nop => {}
                WriterCmd::FlushHaybale => {
                    if let Err(e) = self.flush_haybale() {
                        error!(%e, "haybale flush failed; data retained in memory");
                    }
                }
                WriterCmd::FlushHaystack => {
                    if let Err(e) = self.flush_haystack() {
                        error!(%e, "haystack flush failed; data retained for retry");
                    }
                }
                WriterCmd::Close => {
                    if let Err(e) = self.flush_haystack() {
                        error!(%e, "final haystack flush failed on close");
                    }
                    info!("haystack writer shut down");
                    return;
                }
            }
        }
    }

    /// Finalises the current Haybale and appends its section pair.
    fn flush_haybale(&mut self) -> Result<()> {
        if self.pending.is_some() {
            // A parked Haystack owns the temp path until it is retried.
            return Ok(());
        }

        let mintime = self.shared.settings.haybale_wait_mintime;

        // Detach the bale and capture the dictionary increment under the
        // swap mutex; ingest continues into a fresh bale immediately.
        let (mut bale, entries, uuid) = {
            let mut hs = self.shared.active.lock();
            let cur = hs.current_bale();
            if cur.memsize() == 0 {
                return Ok(());
            }
            if mintime > 0 && cur.age() < Duration::from_secs(u64::from(mintime)) {
                return Ok(());
            }
            let bale = hs.take_current_bale();
            let entries = dictionary_entries_for_pair(hs.dict_mut(), self.prev_pair_ofs);
            (bale, entries, hs.aes_key_uuid())
        };

        debug!(stalks = bale.num_stalks(), "writing haybale");

        // Sort and write with no lock held.
        bale.sort_bale();
        let result = self.write_pair(uuid, &entries, &bale);

        match result {
            Ok(()) => {
                bale.set_flushed();
                self.shared.active.lock().reinsert_bale(bale);
                Ok(())
            }
            Err(e) => {
                // The open file is now suspect: abandon it and re-arm
                // everything so the next flush rewrites from scratch.
                self.reset_file();
                let mut hs = self.shared.active.lock();
                hs.reinsert_bale(bale);
                for b in hs.bales_mut() {
                    b.clear_flushed();
                }
                Err(e)
            }
        }
    }

    /// Flushes everything: remaining bales, trailer, rename, catalogue,
    /// fresh Haystack.
    fn flush_haystack(&mut self) -> Result<()> {
        // A previously failed Haystack gets the first go at the temp path.
        if let Some(pending) = self.pending.take() {
            info!("retrying parked haystack flush");
            if let Err((parked, e)) = self.write_stack(pending) {
                self.pending = Some(parked);
                return Err(e);
            }
        }

        let stack = {
            let mut hs = self.shared.active.lock();
            let has_data = hs.bales().iter().any(|b| b.memsize() > 0);
            if !has_data && self.file.is_none() {
                return Ok(());
            }
            let fresh = Haystack::new(self.shared.keystore.current_uuid());
            std::mem::replace(&mut *hs, fresh)
        };

        info!("writing haystack file");
        match self.write_stack(stack) {
            Ok(()) => Ok(()),
            Err((parked, e)) => {
                self.pending = Some(parked);
                Err(e)
            }
        }
    }

    /// Serialises a whole (exclusively owned) Haystack and commits its file.
    ///
    /// On failure the Haystack comes back to the caller with every bale
    /// re-armed, and the abandoned temp file will be rewritten from scratch.
    fn write_stack(&mut self, mut hs: Haystack) -> std::result::Result<(), (Haystack, HayError)> {
        let outcome = self.write_stack_inner(&mut hs);
        match outcome {
            Ok(()) => Ok(()),
            Err(e) => {
                self.reset_file();
                for bale in hs.bales_mut() {
                    bale.clear_flushed();
                }
                Err((hs, e))
            }
        }
    }

    fn write_stack_inner(&mut self, hs: &mut Haystack) -> Result<()> {
        let uuid = hs.aes_key_uuid();

        for i in 0..hs.bales().len() {
            if hs.bales()[i].is_flushed() || hs.bales()[i].num_stalks() == 0 {
                continue;
            }
            hs.bales_mut()[i].sort_bale();
            let entries = dictionary_entries_for_pair(hs.dict_mut(), self.prev_pair_ofs);
            self.write_pair(uuid, &entries, &hs.bales()[i])?;
            hs.bales_mut()[i].set_flushed();
        }

        if self.file.is_none() {
            // Nothing was ever written for this Haystack.
            return Ok(());
        }

        let (time_first, time_last) = hs.time_bounds();

        let writer = self.section_writer.as_mut().expect("file implies writer");
        let trailer = writer.trailer_section(self.prev_pair_ofs, time_first, time_last)?;
        let file = self.file.as_mut().expect("checked above");
        file.write_all(&trailer)?;
        file.sync_all()?;
        self.file = None;
        self.section_writer = None;
        self.prev_pair_ofs = 0;
        self.bytes_written = 0;

        let final_path = self
            .shared
            .settings
            .datastore_dir
            .join(format!("{time_first}-{time_last}.hs"));
        fs::rename(&self.temp_path, &final_path)?;

        catalogue::create(
            &final_path,
            &self.shared.settings.catalogue_dir,
            &self.shared.keystore,
            uuid,
            time_first,
            time_last,
        )?;

        info!(file = %final_path.display(), "haystack committed");
        Ok(())
    }

    /// Appends one Dictionary+Haybale pair, opening the file and writing the
    /// header first when needed.
    fn write_pair(
        &mut self,
        uuid: uuid::Uuid,
        entries: &[(u32, std::sync::Arc<str>)],
        bale: &Haybale,
    ) -> Result<()> {
        if self.file.is_none() {
            let mut writer = SectionWriter::new(
                &self.shared.keystore,
                uuid,
                self.shared.settings.compression_level,
            )?;
            let header = writer.header_section()?;

            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o660)
                .open(&self.temp_path)?;
            file.write_all(&header)?;

            self.bytes_written = header.len() as u64;
            self.prev_pair_ofs = 0;
            self.file = Some(file);
            self.section_writer = Some(writer);
        }

        let cur_ofs = self.bytes_written as u32;
        let writer = self.section_writer.as_mut().expect("opened above");
        let dict_bytes = writer.dictionary_section(entries, self.prev_pair_ofs)?;
        let bale_bytes = writer.haybale_section(bale)?;

        let file = self.file.as_mut().expect("opened above");
        file.write_all(&dict_bytes)?;
        file.write_all(&bale_bytes)?;
        file.flush()?;

        self.bytes_written += (dict_bytes.len() + bale_bytes.len()) as u64;
        self.prev_pair_ofs = cur_ofs;
        Ok(())
    }

    /// Abandons the open file after a failure; the temp path is rewritten
    /// from scratch by the next flush.
    fn reset_file(&mut self) {
        self.file = None;
        self.section_writer = None;
        self.prev_pair_ofs = 0;
        self.bytes_written = 0;
    }
}

/// The machine's hostname, for the temp file name.
fn hostname() -> Result<String> {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return Err(HayError::Io(std::io::Error::last_os_error()));
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8(buf[..end].to_vec())
        .map_err(|_| HayError::Config("hostname is not valid UTF-8".into()))
}
