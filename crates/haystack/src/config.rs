//! Configuration: the `[haystack]` INI section and the AES keystore.
//!
//! Every configurable knob of the store lives here; everything else is fixed
//! or derived. Loading is strict: missing or out-of-range entries, wrong
//! file ownership, and bad keystore records are all startup errors that
//! abort with a non-zero exit, reported individually via `tracing`.

use crate::error::{HayError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ini::Ini;
use std::collections::HashMap;
use std::ffi::CString;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::error;
use uuid::Uuid;

/// Lower bound for `haystack_wait_maxsize`: 64 MiB.
pub const HAYSTACK_WAIT_MAXSIZE_LOWER: u64 = 64 * 1024 * 1024;
/// Upper bound for `haystack_wait_maxsize`: 1 GiB.
pub const HAYSTACK_WAIT_MAXSIZE_UPPER: u64 = 1024 * 1024 * 1024;
/// Upper bound for `haybale_wait_minsize`: 1 GiB (0 disables).
pub const HAYBALE_WAIT_MINSIZE_UPPER: u64 = 1024 * 1024 * 1024;
/// Upper bound for the bale wait timers, in seconds (0 disables).
pub const HAYBALE_WAIT_TIME_UPPER: u64 = 24 * 60 * 60;
/// AES-256 key length in bytes.
pub const AES_KEY_LEN: usize = 32;

/// Validated `[haystack]` settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Required runtime user name.
    pub user: String,
    /// Resolved uid of `user`.
    pub uid: u32,
    /// Required runtime group name.
    pub group: String,
    /// Resolved gid of `group`.
    pub gid: u32,
    /// Directory receiving `*.hs` Haystack files.
    pub datastore_dir: PathBuf,
    /// Directory receiving `*.hsc` catalogue files.
    pub catalogue_dir: PathBuf,
    /// Path of the AES keystore CSV.
    pub aes_keystore_list: PathBuf,
    /// Haystack flush threshold in bytes.
    pub haystack_wait_maxsize: u32,
    /// Haybale flush threshold in bytes; 0 disables.
    pub haybale_wait_minsize: u32,
    /// Minimum bale age in seconds before a flush may fire; 0 disables.
    pub haybale_wait_mintime: u32,
    /// Maximum bale age in seconds before a timed flush fires; 0 disables.
    pub haybale_wait_maxtime: u32,
    /// bzip2 effort, 0 (off) to 9 (best).
    pub compression_level: u32,
}

impl Settings {
    /// Reads and checks the `[haystack]` section of an INI file.
    ///
    /// All problems are logged individually; the returned error summarises
    /// the count so startup can abort.
    pub fn load(path: &Path) -> Result<Self> {
        let ini = Ini::load_from_file(path)
            .map_err(|e| HayError::Config(format!("cannot read {}: {e}", path.display())))?;
        let section = ini
            .section(Some("haystack"))
            .ok_or_else(|| HayError::Config("missing [haystack] section".into()))?;

        let mut errors = 0usize;
        let mut get = |key: &str| -> String {
            match section.get(key) {
                Some(v) if !v.is_empty() => v.to_string(),
                _ => {
                    error!(key, "configuration entry missing or empty");
                    errors += 1;
                    String::new()
                }
            }
        };

        let user = get("user");
        let group = get("group");
        let datastore_dir = get("datastore_dir");
        let catalogue_dir = get("catalogue_dir");
        let aes_keystore_list = get("aes_keystore_list");
        let maxsize = get("haystack_wait_maxsize");
        let minsize = get("haybale_wait_minsize");
        let mintime = get("haybale_wait_mintime");
        let maxtime = get("haybale_wait_maxtime");
        let level = get("compression_level");
        drop(get);

        let mut settings = Settings {
            user,
            uid: 0,
            group,
            gid: 0,
            datastore_dir: PathBuf::from(datastore_dir),
            catalogue_dir: PathBuf::from(catalogue_dir),
            aes_keystore_list: PathBuf::from(aes_keystore_list),
            haystack_wait_maxsize: 0,
            haybale_wait_minsize: 0,
            haybale_wait_mintime: 0,
            haybale_wait_maxtime: 0,
            compression_level: 0,
        };

        errors += check_dir(&settings.datastore_dir, "datastore_dir");
        errors += check_dir(&settings.catalogue_dir, "catalogue_dir");
        errors += check_file(&settings.aes_keystore_list, "aes_keystore_list");

        errors += bind(
            &mut settings.haystack_wait_maxsize,
            parse_size(&maxsize),
            HAYSTACK_WAIT_MAXSIZE_LOWER..=HAYSTACK_WAIT_MAXSIZE_UPPER,
            "haystack_wait_maxsize",
        );
        errors += bind(
            &mut settings.haybale_wait_minsize,
            parse_size(&minsize),
            0..=HAYBALE_WAIT_MINSIZE_UPPER,
            "haybale_wait_minsize",
        );
        errors += bind(
            &mut settings.haybale_wait_mintime,
            parse_duration(&mintime),
            0..=HAYBALE_WAIT_TIME_UPPER,
            "haybale_wait_mintime",
        );
        errors += bind(
            &mut settings.haybale_wait_maxtime,
            parse_duration(&maxtime),
            0..=HAYBALE_WAIT_TIME_UPPER,
            "haybale_wait_maxtime",
        );
        errors += bind(
            &mut settings.compression_level,
            level
                .parse::<u64>()
                .map_err(|e| format!("cannot parse: {e}")),
            0..=9,
            "compression_level",
        );

        if errors > 0 {
            return Err(HayError::Config(format!(
                "{errors} configuration error(s), see log"
            )));
        }
        Ok(settings)
    }

    /// Checks the runtime identity and directory ownership/permissions.
    ///
    /// The configured user and group must resolve (by name or numeric id)
    /// and match the effective uid/gid; the data, catalogue, and keystore
    /// paths must be owned by them and grant nothing to "other".
    pub fn validate_system(&mut self) -> Result<()> {
        let mut errors = 0usize;

        match lookup_user(&self.user) {
            Some(uid) => self.uid = uid,
            None => {
                error!(user = %self.user, "configured user does not exist on system");
                errors += 1;
            }
        }
        match lookup_group(&self.group) {
            Some(gid) => self.gid = gid,
            None => {
                error!(group = %self.group, "configured group does not exist on system");
                errors += 1;
            }
        }

        if errors == 0 {
            let euid = unsafe { libc::geteuid() };
            let egid = unsafe { libc::getegid() };
            if euid != self.uid {
                error!(euid, uid = self.uid, "current user not the configured user");
                errors += 1;
            }
            if egid != self.gid {
                error!(egid, gid = self.gid, "current group not the configured group");
                errors += 1;
            }

            for path in [
                &self.datastore_dir,
                &self.catalogue_dir,
                &self.aes_keystore_list,
            ] {
                errors += check_ownership(path, self.uid, self.gid);
            }
        }

        if errors > 0 {
            return Err(HayError::Config(format!(
                "{errors} validation error(s), see log"
            )));
        }
        Ok(())
    }
}

/// The AES-256 keystore: every key this process may decrypt with, plus the
/// current key new files are encrypted under (the last record in the file).
#[derive(Debug, Clone)]
pub struct KeyStore {
    keys: HashMap<Uuid, [u8; AES_KEY_LEN]>,
    current: Uuid,
}

impl KeyStore {
    /// Loads a keystore CSV: `uuid,base64key,label` records, `#` comments.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| HayError::Config(format!("cannot read keystore: {e}")))?;
        Self::parse(&content)
    }

    /// Parses keystore CSV content.
    ///
    /// Each record must have exactly three fields; keys must be base64 of
    /// exactly 32 bytes; at least one record is required.
    pub fn parse(content: &str) -> Result<Self> {
        let mut keys = HashMap::new();
        let mut current = None;

        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let fields: Vec<&str> = line.split(',').collect();
            if fields.len() != 3 {
                return Err(HayError::Config(format!(
                    "keystore line {}: expected 3 fields, got {}",
                    lineno + 1,
                    fields.len()
                )));
            }

            let uuid = Uuid::parse_str(fields[0].trim()).map_err(|e| {
                HayError::Config(format!("keystore line {}: bad uuid: {e}", lineno + 1))
            })?;
            let raw = BASE64.decode(fields[1].trim()).map_err(|e| {
                HayError::Config(format!("keystore line {}: bad base64 key: {e}", lineno + 1))
            })?;
            let key: [u8; AES_KEY_LEN] = raw.try_into().map_err(|_| {
                HayError::Config(format!(
                    "keystore line {}: key is not {} bytes",
                    lineno + 1,
                    AES_KEY_LEN
                ))
            })?;

            keys.insert(uuid, key);
            current = Some(uuid); // last record wins
        }

        let current =
            current.ok_or_else(|| HayError::Config("keystore holds no keys".into()))?;
        Ok(Self { keys, current })
    }

    /// The key stored under `uuid`, if held.
    pub fn key(&self, uuid: &Uuid) -> Option<&[u8; AES_KEY_LEN]> {
        self.keys.get(uuid)
    }

    /// UUID of the current (most recent) key.
    pub fn current_uuid(&self) -> Uuid {
        self.current
    }

    /// The current key material.
    pub fn current_key(&self) -> &[u8; AES_KEY_LEN] {
        &self.keys[&self.current]
    }
}

/// Parses a size with optional `M` (×2²⁰) or `G` (×2³⁰) suffix.
pub fn parse_size(s: &str) -> std::result::Result<u64, String> {
    let s = s.trim().to_uppercase();
    let (digits, multiplier) = if let Some(d) = s.strip_suffix('M') {
        (d.to_string(), 1024 * 1024)
    } else if let Some(d) = s.strip_suffix('G') {
        (d.to_string(), 1024 * 1024 * 1024)
    } else {
        (s, 1)
    };
    digits
        .parse::<u64>()
        .map(|v| v * multiplier)
        .map_err(|e| format!("cannot parse: {e}"))
}

/// Parses a duration in seconds with optional `s` (×1) or `m` (×60) suffix.
pub fn parse_duration(s: &str) -> std::result::Result<u64, String> {
    let s = s.trim().to_lowercase();
    let (digits, multiplier) = if let Some(d) = s.strip_suffix('s') {
        (d.to_string(), 1)
    } else if let Some(d) = s.strip_suffix('m') {
        (d.to_string(), 60)
    } else {
        (s, 1)
    };
    digits
        .parse::<u64>()
        .map(|v| v * multiplier)
        .map_err(|e| format!("cannot parse: {e}"))
}

fn bind(
    slot: &mut u32,
    parsed: std::result::Result<u64, String>,
    bounds: std::ops::RangeInclusive<u64>,
    key: &str,
) -> usize {
    match parsed {
        Ok(v) if bounds.contains(&v) => {
            *slot = v as u32;
            0
        }
        Ok(v) => {
            error!(
                key,
                value = v,
                lower = *bounds.start(),
                upper = *bounds.end(),
                "variable out of bounds"
            );
            1
        }
        Err(e) => {
            error!(key, %e, "cannot parse variable");
            1
        }
    }
}

fn check_dir(path: &Path, key: &str) -> usize {
    match fs::metadata(path) {
        Ok(st) if st.is_dir() => 0,
        Ok(_) => {
            error!(key, path = %path.display(), "path is not a directory");
            1
        }
        Err(e) => {
            error!(key, path = %path.display(), %e, "cannot stat path");
            1
        }
    }
}

fn check_file(path: &Path, key: &str) -> usize {
    match fs::metadata(path) {
        Ok(st) if st.is_file() => 0,
        Ok(_) => {
            error!(key, path = %path.display(), "path is not a file");
            1
        }
        Err(e) => {
            error!(key, path = %path.display(), %e, "cannot stat path");
            1
        }
    }
}

fn check_ownership(path: &Path, uid: u32, gid: u32) -> usize {
    let st = match fs::metadata(path) {
        Ok(st) => st,
        Err(e) => {
            error!(path = %path.display(), %e, "cannot stat path");
            return 1;
        }
    };

    let mut errors = 0;
    if st.uid() != uid {
        error!(path = %path.display(), "not owned by the configured user");
        errors += 1;
    }
    if st.gid() != gid {
        error!(path = %path.display(), "not owned by the configured group");
        errors += 1;
    }
    if st.mode() & 0o007 != 0 {
        error!(
            path = %path.display(),
            mode = format!("{:04o}", st.mode() & 0o7777),
            "permissions grant access to other users"
        );
        errors += 1;
    }
    errors
}

/// Resolves a user name (or numeric uid spelled as text) to a uid.
fn lookup_user(name: &str) -> Option<u32> {
    let cname = CString::new(name).ok()?;
    let pw = unsafe { libc::getpwnam(cname.as_ptr()) };
    if !pw.is_null() {
        return Some(unsafe { (*pw).pw_uid });
    }
    // A user name could be all digits, so fall back to an id lookup.
    let uid = name.parse::<u32>().ok()?;
    let pw = unsafe { libc::getpwuid(uid) };
    if pw.is_null() {
        None
    } else {
        Some(uid)
    }
}

/// Resolves a group name (or numeric gid spelled as text) to a gid.
fn lookup_group(name: &str) -> Option<u32> {
    let cname = CString::new(name).ok()?;
    let gr = unsafe { libc::getgrnam(cname.as_ptr()) };
    if !gr.is_null() {
        return Some(unsafe { (*gr).gr_gid });
    }
    let gid = name.parse::<u32>().ok()?;
    let gr = unsafe { libc::getgrgid(gid) };
    if gr.is_null() {
        None
    } else {
        Some(gid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 32 × 0x42, base64-encoded.
    pub(crate) const TEST_KEY_B64: &str = "QkJCQkJCQkJCQkJCQkJCQkJCQkJCQkJCQkJCQkJCQkI=";
    pub(crate) const TEST_UUID: &str = "6ba7b810-9dad-11d1-80b4-00c04fd430c8";

    #[test]
    fn test_parse_size_suffixes() {
        assert_eq!(parse_size("128").unwrap(), 128);
        assert_eq!(parse_size("128M").unwrap(), 128 * 1024 * 1024);
        assert_eq!(parse_size("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_size("2g").unwrap(), 2 * 1024 * 1024 * 1024);
        assert!(parse_size("lots").is_err());
        assert!(parse_size("").is_err());
    }

    #[test]
    fn test_parse_duration_suffixes() {
        assert_eq!(parse_duration("30").unwrap(), 30);
        assert_eq!(parse_duration("30s").unwrap(), 30);
        assert_eq!(parse_duration("5m").unwrap(), 300);
        assert_eq!(parse_duration("5M").unwrap(), 300);
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_keystore_parse() {
        let content = format!(
            "# comment line\n\n{TEST_UUID},{TEST_KEY_B64},test key\n"
        );
        let ks = KeyStore::parse(&content).unwrap();
        let uuid = Uuid::parse_str(TEST_UUID).unwrap();
        assert_eq!(ks.current_uuid(), uuid);
        assert_eq!(ks.key(&uuid).unwrap(), &[0x42u8; 32]);
    }

    #[test]
    fn test_keystore_last_record_is_current() {
        let content = format!(
            "6ba7b810-9dad-11d1-80b4-00c04fd430c8,{TEST_KEY_B64},old\n\
             6ba7b811-9dad-11d1-80b4-00c04fd430c8,{TEST_KEY_B64},new\n"
        );
        let ks = KeyStore::parse(&content).unwrap();
        assert_eq!(
            ks.current_uuid(),
            Uuid::parse_str("6ba7b811-9dad-11d1-80b4-00c04fd430c8").unwrap()
        );
        assert_eq!(ks.keys.len(), 2);
    }

    #[test]
    fn test_keystore_rejects_bad_records() {
        assert!(KeyStore::parse("").is_err());
        assert!(KeyStore::parse("just-one-field\n").is_err());
        assert!(KeyStore::parse(&format!("{TEST_UUID},{TEST_KEY_B64}\n")).is_err());
        assert!(KeyStore::parse(&format!("not-a-uuid,{TEST_KEY_B64},x\n")).is_err());
        assert!(KeyStore::parse(&format!("{TEST_UUID},c2hvcnQ=,x\n")).is_err());
    }
}
