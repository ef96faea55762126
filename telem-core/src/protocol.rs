//! Telemetry record wire protocol: constants, size limits and the header schema.

use serde::Deserialize;

/// Width of the `record_size` prefix and of the header-block length field.
pub const RECORD_SIZE_LEN: usize = 4;

/// Magic that opens an optional config tag. Little-endian `u32` of `"_cfg"`.
pub const CFG_PREFIX_MAGIC: [u8; 4] = *b"_cfg";

/// Width of the config tag magic on the wire.
pub const CFG_PREFIX_LENGTH: usize = CFG_PREFIX_MAGIC.len();

/// Marker written before the config path in a staged record.
pub const CFG_PREFIX_MARKER: &str = "_cfg_file=";

/// Longest config path a client may embed.
pub const PATH_MAX: usize = 4096;

/// Largest payload a client may submit.
pub const MAX_PAYLOAD_LENGTH: usize = 8192;

/// Per-header allowance used when bounding a frame.
pub const HEADER_LINE_ALLOWANCE: usize = 80;

/// Name of the header whose value is replaced by the daemon's machine id.
pub const MACHINE_ID_HEADER: &str = "machine_id";

/// Header names every record carries, in wire order.
pub const DEFAULT_HEADERS: [&str; 15] = [
    "record_format_version",
    "classification",
    "severity",
    MACHINE_ID_HEADER,
    "creation_timestamp",
    "arch",
    "host_type",
    "build",
    "kernel_version",
    "payload_format_version",
    "system_name",
    "board_name",
    "cpu_model",
    "bios_version",
    "event_id",
];

/// Largest legal `record_size` for a schema of `header_count` headers.
///
/// The size field is attacker-controlled, so it is checked against this bound
/// before any buffer is allocated.
pub const fn max_record_size(header_count: usize) -> usize {
    2 * RECORD_SIZE_LEN
        + CFG_PREFIX_LENGTH
        + PATH_MAX
        + MAX_PAYLOAD_LENGTH
        + header_count * HEADER_LINE_ALLOWANCE
}

/// Ordered list of header names a record must carry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "Vec<String>")]
pub struct HeaderSchema {
    names: Vec<String>,
}

impl HeaderSchema {
    /// Validate and build a schema from names in wire order.
    pub fn new<I, N>(names: I) -> Result<Self, SchemaError>
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        if names.is_empty() {
            return Err(SchemaError::Empty);
        }
        for (i, name) in names.iter().enumerate() {
            if name.is_empty() {
                return Err(SchemaError::EmptyName(i));
            }
            if name.contains(':') || name.contains('\n') {
                return Err(SchemaError::InvalidName(name.clone()));
            }
            if names[..i].contains(name) {
                return Err(SchemaError::Duplicate(name.clone()));
            }
        }
        Ok(Self { names })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Position of the machine-id header, if the schema carries one.
    pub fn machine_id_index(&self) -> Option<usize> {
        self.names.iter().position(|n| n == MACHINE_ID_HEADER)
    }

    /// `record_size` bound for this schema.
    pub fn max_record_size(&self) -> usize {
        max_record_size(self.names.len())
    }
}

impl Default for HeaderSchema {
    fn default() -> Self {
        Self {
            names: DEFAULT_HEADERS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl TryFrom<Vec<String>> for HeaderSchema {
    type Error = SchemaError;

    fn try_from(names: Vec<String>) -> Result<Self, Self::Error> {
        Self::new(names)
    }
}

/// Invalid header schema.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("header schema is empty")]
    Empty,
    #[error("header name at position {0} is empty")]
    EmptyName(usize),
    #[error("header name {0:?} contains ':' or a newline")]
    InvalidName(String),
    #[error("header name {0:?} appears more than once")]
    Duplicate(String),
}
