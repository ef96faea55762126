//! Stager: persist a decoded record as a uniquely named file in the spool directory.

use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::record::DecodedRecord;

/// Random characters in a staged file name.
const STAGED_NAME_LEN: usize = 6;

/// Default spool directory read by the uploader.
pub const DEFAULT_SPOOL_DIR: &str = "/var/spool/telemetry";

/// Writes records into one spool directory.
#[derive(Debug, Clone)]
pub struct Stager {
    spool_dir: PathBuf,
}

impl Stager {
    pub fn new(spool_dir: impl Into<PathBuf>) -> Self {
        Self {
            spool_dir: spool_dir.into(),
        }
    }

    pub fn spool_dir(&self) -> &Path {
        &self.spool_dir
    }

    /// Create a new uniquely named file and write the record into it.
    ///
    /// The file is created exclusively under its final name. If any write fails the file
    /// is removed before returning, so the uploader never sees a partial record.
    pub fn stage(&self, record: &DecodedRecord) -> Result<PathBuf, StageError> {
        let tmp = tempfile::Builder::new()
            .prefix("")
            .rand_bytes(STAGED_NAME_LEN)
            .tempfile_in(&self.spool_dir)
            .map_err(|e| StageError::Create {
                dir: self.spool_dir.clone(),
                source: e,
            })?;
        debug!(path = %tmp.path().display(), "staging record");

        let write = || -> io::Result<()> {
            let mut out = BufWriter::new(tmp.as_file());
            record.write_staged(&mut out)?;
            out.flush()?;
            Ok(())
        };
        if let Err(e) = write() {
            // Dropping `tmp` unlinks the file.
            return Err(StageError::Write {
                path: tmp.path().to_path_buf(),
                source: e,
            });
        }

        let (_file, path) = tmp.keep().map_err(|e| StageError::Write {
            path: e.file.path().to_path_buf(),
            source: e.error,
        })?;
        Ok(path)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("error opening staging file in {}: {source}", .dir.display())]
    Create { dir: PathBuf, source: io::Error },
    #[error("error writing staging file {}: {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },
}
