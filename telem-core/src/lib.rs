//! Local telemetry collection core.
//! Host-driven: the host owns the listening socket and the wait primitive; this crate
//! frames, decodes and stages one record per accepted connection.

pub mod core;
pub mod framer;
pub mod identity;
pub mod protocol;
pub mod record;
pub mod stage;
pub mod table;
pub mod wire;

pub use crate::core::{ClientOutcome, ProcessError, RecordProcessor, TelemCore};
pub use framer::{Connection, FrameError, FrameState, PeekRead};
pub use identity::{MachineIdError, MachineIdSource, MachineIdStore, RefreshOutcome};
pub use protocol::{HeaderSchema, SchemaError};
pub use record::{DecodedRecord, Header};
pub use stage::{StageError, Stager};
pub use table::{ConnectionTable, Entry, Readiness};
pub use wire::{decode_record, encode_frame, DecodeError, FrameEncodeError};
