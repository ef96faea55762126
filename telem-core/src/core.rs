//! Host-driven API: the host accepts streams and reports readiness; `TelemCore` frames,
//! decodes and stages one record per connection.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::framer::{FrameError, PeekRead};
use crate::identity::MachineIdSource;
use crate::protocol::HeaderSchema;
use crate::record::DecodedRecord;
use crate::stage::{StageError, Stager};
use crate::table::ConnectionTable;
use crate::wire::{decode_record, DecodeError};

/// Result of serving one readable connection. The connection is gone in every case.
#[derive(Debug, PartialEq, Eq)]
pub enum ClientOutcome {
    /// Record written to the spool directory.
    Staged(PathBuf),
    /// Peer closed without sending anything.
    Closed,
    /// Transport, validation or staging failure; already logged.
    Dropped,
}

/// Turns a complete raw record into a staged file.
#[derive(Debug, Clone)]
pub struct RecordProcessor {
    schema: HeaderSchema,
    stager: Stager,
    machine_id: MachineIdSource,
}

impl RecordProcessor {
    pub fn new(schema: HeaderSchema, stager: Stager, machine_id: MachineIdSource) -> Self {
        Self {
            schema,
            stager,
            machine_id,
        }
    }

    pub fn schema(&self) -> &HeaderSchema {
        &self.schema
    }

    pub fn machine_id(&self) -> &MachineIdSource {
        &self.machine_id
    }

    /// Decode `raw`, put the daemon's machine id in place, and stage it.
    pub fn process(&self, raw: &[u8]) -> Result<PathBuf, ProcessError> {
        let mut record: DecodedRecord = decode_record(raw, &self.schema)?;
        if self.schema.machine_id_index().is_some() {
            record.substitute_machine_id(&self.machine_id.current());
        }
        Ok(self.stager.stage(&record)?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("incorrect record: {0}")]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Stage(#[from] StageError),
}

/// Connection table plus record pipeline. Driven from a single thread.
#[derive(Debug)]
pub struct TelemCore<S> {
    table: ConnectionTable<S>,
    processor: RecordProcessor,
}

impl<S: PeekRead> TelemCore<S> {
    pub fn new(processor: RecordProcessor) -> Self {
        let max = processor.schema().max_record_size();
        Self {
            table: ConnectionTable::new(max),
            processor,
        }
    }

    /// Bound how long one client may take to deliver its whole record.
    pub fn with_frame_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.table.set_frame_timeout(timeout);
        self
    }

    pub fn table(&self) -> &ConnectionTable<S> {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut ConnectionTable<S> {
        &mut self.table
    }

    pub fn processor(&self) -> &RecordProcessor {
        &self.processor
    }

    /// Register a newly accepted stream. Returns its index.
    pub fn on_accept(&mut self, stream: S) -> usize {
        let index = self.table.register(stream);
        debug!(index, clients = self.table.len(), "client added");
        index
    }

    /// Serve the readable connection at `index`, then remove it.
    ///
    /// Later connections shift down by one; callers walking indices should go from high
    /// to low. Panics if `index` is out of range.
    pub fn on_readable(&mut self, index: usize) -> ClientOutcome {
        let outcome = self.serve(index);
        info!(index, ?outcome, "removing client");
        self.table.unregister(index);
        outcome
    }

    fn serve(&mut self, index: usize) -> ClientOutcome {
        let Some(entry) = self.table.get_mut(index) else {
            return ClientOutcome::Dropped;
        };
        let raw = match entry.conn.read_record(&mut entry.stream) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                info!(index, "no data to receive from client");
                return ClientOutcome::Closed;
            }
            Err(e @ FrameError::ClosedEarly { .. }) => {
                debug!(index, "end of transmission: {e}");
                return ClientOutcome::Dropped;
            }
            Err(e) => {
                error!(index, "failed to receive record: {e}");
                return ClientOutcome::Dropped;
            }
        };
        match self.processor.process(&raw) {
            Ok(path) => {
                debug!(index, path = %path.display(), "record processed");
                ClientOutcome::Staged(path)
            }
            Err(e) => {
                error!(index, "record dropped: {e}");
                ClientOutcome::Dropped
            }
        }
    }
}
