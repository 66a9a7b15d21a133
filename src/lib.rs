//! fbi-rs: a disk-resident Hamming range index over 128-bit sketches.
//!
//! Every configured partition is the full dataset sorted by the code rotated
//! to a different starting bit, plus a sampled trie over that order. A query
//! is planned into per-partition candidate ranges and only those ranges are
//! read back from disk.

pub mod build;
pub mod engine;
pub mod index;
pub mod io;
pub mod plan;
pub mod planner;
pub mod record;
pub mod scanner;
pub mod stats;
pub mod topology;
pub mod trie;
pub mod window;

pub use build::BuildOptions;
pub use engine::{Engine, EngineOptions, RunReport};
pub use index::{Index, TrieNode};
pub use plan::{Plan, Range, Selection};
pub use planner::{Algorithm, Planner};
pub use record::{hamming, rotated_cmp, Code, Record};
pub use scanner::{DataFile, ScanReport, ScanStatus, Scanner};
pub use stats::{Coverage, Summary};
pub use topology::{PartitionSpec, Topology};
pub use trie::TrieBuilder;
pub use window::Window;

use std::path::PathBuf;


/// Opaque record key stored next to every code.
pub type Key = u32;

/// Width of a sketch in bits.
pub const DATA_BIT: usize = 128;
/// Width of one code chunk in bits.
pub const CHUNK_BIT: usize = 8;
/// Number of chunks in a code.
pub const DATA_CHUNK: usize = DATA_BIT / CHUNK_BIT;
/// Bytes of code in a record.
pub const DATA_SIZE: usize = DATA_CHUNK;
/// Bytes of key in a record.
pub const KEY_SIZE: usize = std::mem::size_of::<Key>();
/// Bytes per on-disk record.
pub const RECORD_SIZE: usize = DATA_SIZE + KEY_SIZE;
/// Upper bound on matches collected from a single scanned range.
pub const MAX_SCAN_RESULT: usize = 500;

/// Errors that can occur when building, opening or querying an index.
#[derive(thiserror::Error, Debug)]
pub enum FbiError {
    /// Returned when an invalid parameter or option is supplied.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// Returned when the topology descriptor cannot be parsed or is inconsistent.
    #[error("invalid topology descriptor: {0}")]
    InvalidTopology(String),
    /// Returned when a configured file cannot be opened.
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Returned when a plan needs a partition that has no sample index.
    #[error("partition {partition} has no sample index")]
    MissingPartition { partition: usize },
    /// Returned when a data file does not match the records its index describes.
    #[error("malformed data file {path}: {detail}")]
    MalformedData { path: PathBuf, detail: String },
    /// Returned when partitions disagree on the number of samples.
    #[error("partition {partition} holds {got} samples, expected {expected}")]
    InconsistentPartitions {
        partition: usize,
        expected: usize,
        got: usize,
    },
    /// Returned when no layout of the requested segment count exists.
    #[error("cannot lay out {partitions} segments at {skip}-bit granularity")]
    Unplannable { partitions: usize, skip: usize },
    /// Returned when a persisted sample index is inconsistent or corrupt.
    #[error("invalid persisted index: {0}")]
    InvalidPersistence(&'static str),
    /// Returned when reading or writing files fails.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
