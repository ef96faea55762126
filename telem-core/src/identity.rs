//! Machine identity: the persistent 32-character id injected into every staged record.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{error, info};

/// Length of a machine id in characters.
pub const MACHINE_ID_LEN: usize = 32;

/// Id used when neither an override nor the id file is available.
pub const SENTINEL_MACHINE_ID: &str = "0";

/// Default id file location.
pub const DEFAULT_MACHINE_ID_FILE: &str = "/var/lib/telemetry/machine_id";

/// Default static override location.
pub const DEFAULT_MACHINE_ID_OVERRIDE_FILE: &str = "/etc/telemetrics/opt-in-static-machine-id";

/// Ids older than this are regenerated (3 days).
pub const DEFAULT_MACHINE_ID_EXPIRY: Duration = Duration::from_secs(3 * 24 * 60 * 60);

/// Fresh random id: 16 bytes from the OS as lowercase hex.
pub fn generate_machine_id() -> String {
    let mut bytes = [0u8; MACHINE_ID_LEN / 2];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Read at most 32 bytes from `path`, cut at the first newline and trimmed.
///
/// `Ok(None)` if the file is missing or holds no id. Bytes that are not UTF-8
/// are an error rather than being replaced.
pub fn read_id_file(path: &Path) -> Result<Option<String>, MachineIdError> {
    let file = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(MachineIdError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    let mut raw = Vec::with_capacity(MACHINE_ID_LEN);
    file.take(MACHINE_ID_LEN as u64)
        .read_to_end(&mut raw)
        .map_err(|e| MachineIdError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
    if let Some(nl) = raw.iter().position(|&b| b == b'\n') {
        raw.truncate(nl);
    }
    let id = std::str::from_utf8(&raw)
        .map_err(|_| MachineIdError::Encoding {
            path: path.to_path_buf(),
        })?
        .trim()
        .to_string();
    Ok(if id.is_empty() { None } else { Some(id) })
}

/// Read the static override once at start-up. Errors are logged and treated as absent.
pub fn read_override(path: &Path) -> Option<String> {
    match read_id_file(path) {
        Ok(id) => id,
        Err(e) => {
            error!("unable to read static machine id: {e}");
            None
        }
    }
}

/// What `refresh_if_needed` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Created(String),
    Regenerated(String),
    Fresh,
}

/// The on-disk machine id and its expiry policy.
#[derive(Debug, Clone)]
pub struct MachineIdStore {
    path: PathBuf,
    expiry: Duration,
}

impl MachineIdStore {
    pub fn new(path: impl Into<PathBuf>, expiry: Duration) -> Self {
        Self {
            path: path.into(),
            expiry,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_id(&self) -> Result<Option<String>, MachineIdError> {
        read_id_file(&self.path)
    }

    /// Generate a new id and overwrite the file with it.
    pub fn generate_and_persist(&self) -> Result<String, MachineIdError> {
        let id = generate_machine_id();
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| MachineIdError::Write {
                    path: self.path.clone(),
                    source: e,
                })?;
            }
        }
        fs::write(&self.path, &id).map_err(|e| MachineIdError::Write {
            path: self.path.clone(),
            source: e,
        })?;
        Ok(id)
    }

    /// Create the id if absent, regenerate it if older than the expiry window.
    pub fn refresh_if_needed(&self) -> Result<RefreshOutcome, MachineIdError> {
        let meta = match fs::metadata(&self.path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "machine id file does not exist");
                return self.generate_and_persist().map(RefreshOutcome::Created);
            }
            Err(e) => return Err(MachineIdError::Stat { path: self.path.clone(), source: e }),
        };
        let modified = meta
            .modified()
            .map_err(|e| MachineIdError::Stat { path: self.path.clone(), source: e })?;
        // A timestamp in the future counts as fresh.
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);
        if age > self.expiry {
            info!(path = %self.path.display(), "machine id file has expired");
            return self.generate_and_persist().map(RefreshOutcome::Regenerated);
        }
        Ok(RefreshOutcome::Fresh)
    }
}

/// Supplies the id substituted into records: override first, then the id file.
#[derive(Debug, Clone)]
pub struct MachineIdSource {
    override_id: Option<String>,
    store: MachineIdStore,
}

impl MachineIdSource {
    pub fn new(store: MachineIdStore, override_id: Option<String>) -> Self {
        let override_id = override_id.map(|id| id.chars().take(MACHINE_ID_LEN).collect());
        Self { override_id, store }
    }

    pub fn store(&self) -> &MachineIdStore {
        &self.store
    }

    /// Current id, falling back to the sentinel if the id file cannot be read.
    pub fn current(&self) -> String {
        if let Some(id) = &self.override_id {
            return id.clone();
        }
        match self.store.read_id() {
            Ok(Some(id)) => id,
            Ok(None) => {
                error!(path = %self.store.path.display(), "could not open machine id file");
                SENTINEL_MACHINE_ID.to_string()
            }
            Err(e) => {
                error!("could not read machine id: {e}");
                SENTINEL_MACHINE_ID.to_string()
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MachineIdError {
    #[error("unable to read machine id file {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("unable to write machine id file {}: {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },
    #[error("unable to stat machine id file {}: {source}", .path.display())]
    Stat { path: PathBuf, source: io::Error },
    #[error("machine id file {} is not valid UTF-8", .path.display())]
    Encoding { path: PathBuf },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn age_file(path: &Path, by: Duration) {
        let f = fs::File::options().write(true).open(path).unwrap();
        f.set_modified(SystemTime::now() - by).unwrap();
    }

    #[test]
    fn generated_ids_are_32_hex_chars() {
        let a = generate_machine_id();
        let b = generate_machine_id();
        assert_eq!(a.len(), MACHINE_ID_LEN);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(a, b);
    }

    #[test]
    fn missing_file_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub/machine_id");
        let store = MachineIdStore::new(path, DEFAULT_MACHINE_ID_EXPIRY);
        assert_eq!(store.read_id().unwrap(), None);
        let RefreshOutcome::Created(id) = store.refresh_if_needed().unwrap() else {
            panic!("expected Created");
        };
        assert_eq!(store.read_id().unwrap(), Some(id));
    }

    #[test]
    fn expired_file_is_regenerated() {
        let dir = tempfile::tempdir().unwrap();
        let store = MachineIdStore::new(dir.path().join("machine_id"), Duration::from_secs(60));
        let old = store.generate_and_persist().unwrap();
        age_file(store.path(), Duration::from_secs(3600));
        let before = fs::metadata(store.path()).unwrap().modified().unwrap();

        let RefreshOutcome::Regenerated(new) = store.refresh_if_needed().unwrap() else {
            panic!("expected Regenerated");
        };
        assert_eq!(new.len(), MACHINE_ID_LEN);
        assert_ne!(new, old);
        assert_eq!(fs::read_to_string(store.path()).unwrap(), new);
        let after = fs::metadata(store.path()).unwrap().modified().unwrap();
        assert!(after > before);
    }

    #[test]
    fn fresh_file_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let store = MachineIdStore::new(dir.path().join("machine_id"), Duration::from_secs(3600));
        let id = store.generate_and_persist().unwrap();
        assert_eq!(store.refresh_if_needed().unwrap(), RefreshOutcome::Fresh);
        assert_eq!(fs::read_to_string(store.path()).unwrap(), id);
    }

    #[test]
    fn read_cuts_at_newline_and_32_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id");
        fs::write(&path, "static-id\nsecond line").unwrap();
        assert_eq!(read_id_file(&path).unwrap().as_deref(), Some("static-id"));
        fs::write(&path, "a".repeat(40)).unwrap();
        assert_eq!(read_id_file(&path).unwrap(), Some("a".repeat(32)));
        fs::write(&path, "\n").unwrap();
        assert_eq!(read_id_file(&path).unwrap(), None);
    }

    #[test]
    fn source_prefers_override_then_file_then_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let store = MachineIdStore::new(dir.path().join("machine_id"), DEFAULT_MACHINE_ID_EXPIRY);

        let source = MachineIdSource::new(store.clone(), None);
        assert_eq!(source.current(), SENTINEL_MACHINE_ID);

        let id = store.generate_and_persist().unwrap();
        assert_eq!(source.current(), id);

        let pinned = MachineIdSource::new(store, Some("pinned".into()));
        assert_eq!(pinned.current(), "pinned");
    }

    #[test]
    fn override_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_override(&dir.path().join("nope")), None);
    }

    #[test]
    fn override_with_invalid_bytes_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("static");
        fs::write(&path, [0xffu8; 32]).unwrap();
        assert!(matches!(
            read_id_file(&path),
            Err(MachineIdError::Encoding { .. })
        ));
        assert_eq!(read_override(&path), None);

        let store = MachineIdStore::new(dir.path().join("machine_id"), DEFAULT_MACHINE_ID_EXPIRY);
        let source = MachineIdSource::new(store, read_override(&path));
        assert_eq!(source.current(), SENTINEL_MACHINE_ID);
    }

    #[test]
    fn long_multibyte_override_is_cut_on_char_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let store = MachineIdStore::new(dir.path().join("machine_id"), DEFAULT_MACHINE_ID_EXPIRY);
        let source = MachineIdSource::new(store, Some("\u{fffd}".repeat(20)));
        assert_eq!(source.current(), "\u{fffd}".repeat(MACHINE_ID_LEN));
    }
}
