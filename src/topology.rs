//! The text descriptor naming every configured partition.
//!
//! ```text
//! 16 4 1000
//! /data/fbi
//! 0 0 data.0 sample.0
//! 64 1 data.64 sample.64
//! ```
//!
//! The header holds the code width, key width and sample rate, then the base
//! directory. Each following line is `partition disk data_file index_file`
//! with file names relative to the base directory.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{FbiError, DATA_BIT, DATA_SIZE, KEY_SIZE};

/// One configured partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSpec {
    /// Bit offset the partition's data is sorted from.
    pub partition: usize,
    /// Logical storage device, used to group batch reads.
    pub disk: usize,
    pub data_path: PathBuf,
    pub index_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub data_bytes: usize,
    pub key_bytes: usize,
    pub sample_rate: usize,
    pub base_dir: PathBuf,
    pub partitions: Vec<PartitionSpec>,
}

fn parse_number<T: FromStr>(token: &str, what: &str) -> Result<T, FbiError> {
    token
        .parse()
        .map_err(|_| FbiError::InvalidTopology(format!("{what} `{token}` is not a number")))
}

impl Topology {
    /// An empty topology for records of this crate's layout.
    pub fn new<P: Into<PathBuf>>(sample_rate: usize, base_dir: P) -> Self {
        Self {
            data_bytes: DATA_SIZE,
            key_bytes: KEY_SIZE,
            sample_rate,
            base_dir: base_dir.into(),
            partitions: Vec::new(),
        }
    }

    /// Parse descriptor text. The base directory is kept as written.
    pub fn parse(text: &str) -> Result<Self, FbiError> {
        let mut tokens = text.split_whitespace();
        let mut header = |what: &str| {
            tokens
                .next()
                .ok_or_else(|| FbiError::InvalidTopology(format!("missing {what}")))
        };
        let data_bytes = parse_number(header("code width")?, "code width")?;
        let key_bytes = parse_number(header("key width")?, "key width")?;
        let sample_rate = parse_number(header("sample rate")?, "sample rate")?;
        let base_dir = PathBuf::from(header("base directory")?);

        let rest: Vec<&str> = tokens.collect();
        let lines = rest.chunks_exact(4);
        if !lines.remainder().is_empty() {
            return Err(FbiError::InvalidTopology(format!(
                "incomplete partition entry `{}`",
                lines.remainder().join(" ")
            )));
        }
        let partitions = lines
            .map(|line| {
                Ok(PartitionSpec {
                    partition: parse_number(line[0], "partition id")?,
                    disk: parse_number(line[1], "disk id")?,
                    data_path: PathBuf::from(line[2]),
                    index_path: PathBuf::from(line[3]),
                })
            })
            .collect::<Result<Vec<_>, FbiError>>()?;

        let topology = Self {
            data_bytes,
            key_bytes,
            sample_rate,
            base_dir,
            partitions,
        };
        topology.validate()?;
        Ok(topology)
    }

    /// Load a descriptor file, resolving a relative base directory against
    /// the directory holding the descriptor.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, FbiError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| FbiError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let mut topology = Self::parse(&text)?;
        if topology.base_dir.is_relative() {
            if let Some(parent) = path.parent() {
                topology.base_dir = parent.join(&topology.base_dir);
            }
        }
        Ok(topology)
    }

    pub fn validate(&self) -> Result<(), FbiError> {
        if self.data_bytes != DATA_SIZE {
            return Err(FbiError::InvalidTopology(format!(
                "code width {} does not match the supported {DATA_SIZE} bytes",
                self.data_bytes
            )));
        }
        if self.key_bytes != KEY_SIZE {
            return Err(FbiError::InvalidTopology(format!(
                "key width {} does not match the supported {KEY_SIZE} bytes",
                self.key_bytes
            )));
        }
        if self.sample_rate == 0 {
            return Err(FbiError::InvalidTopology(
                "sample rate must be positive".to_string(),
            ));
        }
        if self.partitions.is_empty() {
            return Err(FbiError::InvalidTopology(
                "no partitions configured".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for spec in &self.partitions {
            if spec.partition >= DATA_BIT {
                return Err(FbiError::InvalidTopology(format!(
                    "partition {} is outside 0..{DATA_BIT}",
                    spec.partition
                )));
            }
            if !seen.insert(spec.partition) {
                return Err(FbiError::InvalidTopology(format!(
                    "partition {} is configured twice",
                    spec.partition
                )));
            }
        }
        Ok(())
    }

    pub fn data_path(&self, spec: &PartitionSpec) -> PathBuf {
        self.base_dir.join(&spec.data_path)
    }

    pub fn index_path(&self, spec: &PartitionSpec) -> PathBuf {
        self.base_dir.join(&spec.index_path)
    }

    /// Render the descriptor text.
    pub fn to_descriptor_string(&self) -> Result<String, FbiError> {
        let token = |path: &Path| -> Result<String, FbiError> {
            let text = path.to_str().ok_or_else(|| {
                FbiError::InvalidTopology(format!("path {} is not UTF-8", path.display()))
            })?;
            if text.is_empty() || text.chars().any(char::is_whitespace) {
                return Err(FbiError::InvalidTopology(format!(
                    "path `{text}` cannot be written to a descriptor"
                )));
            }
            Ok(text.to_string())
        };

        let mut out = format!(
            "{} {} {}\n{}\n",
            self.data_bytes,
            self.key_bytes,
            self.sample_rate,
            token(&self.base_dir)?
        );
        for spec in &self.partitions {
            out.push_str(&format!(
                "{} {} {} {}\n",
                spec.partition,
                spec.disk,
                token(&spec.data_path)?,
                token(&spec.index_path)?
            ));
        }
        Ok(out)
    }

    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<(), FbiError> {
        self.validate()?;
        fs::write(path, self.to_descriptor_string()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIPTOR: &str = "16 4 1000\n/srv/fbi\n0 0 data.0 sample.0\n64 1 data.64 sample.64\n";

    fn expect_invalid(text: &str) -> String {
        match Topology::parse(text) {
            Err(FbiError::InvalidTopology(message)) => message,
            other => panic!("expected InvalidTopology for {text:?}, got {other:?}"),
        }
    }

    #[test]
    fn parses_header_and_partitions() {
        let topology = Topology::parse(DESCRIPTOR).unwrap();
        assert_eq!(topology.sample_rate, 1000);
        assert_eq!(topology.base_dir, PathBuf::from("/srv/fbi"));
        assert_eq!(topology.partitions.len(), 2);
        let second = &topology.partitions[1];
        assert_eq!(second.partition, 64);
        assert_eq!(second.disk, 1);
        assert_eq!(
            topology.data_path(second),
            PathBuf::from("/srv/fbi/data.64")
        );
        assert_eq!(
            topology.index_path(second),
            PathBuf::from("/srv/fbi/sample.64")
        );
    }

    #[test]
    fn descriptor_text_roundtrips() {
        let topology = Topology::parse(DESCRIPTOR).unwrap();
        let text = topology.to_descriptor_string().unwrap();
        assert_eq!(text, DESCRIPTOR);
        assert_eq!(Topology::parse(&text).unwrap(), topology);
    }

    #[test]
    fn relative_base_dir_follows_the_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.txt");
        fs::write(&path, "16 4 1\nparts\n3 0 d i\n").unwrap();
        let topology = Topology::load_from_path(&path).unwrap();
        assert_eq!(topology.base_dir, dir.path().join("parts"));
        assert_eq!(
            topology.data_path(&topology.partitions[0]),
            dir.path().join("parts").join("d")
        );
    }

    #[test]
    fn rejects_malformed_descriptors() {
        assert!(expect_invalid("16 4").contains("sample rate"));
        assert!(expect_invalid("8 4 1 /x 0 0 d i").contains("code width"));
        assert!(expect_invalid("16 8 1 /x 0 0 d i").contains("key width"));
        assert!(expect_invalid("16 4 0 /x 0 0 d i").contains("sample rate"));
        assert!(expect_invalid("16 4 1 /x").contains("no partitions"));
        assert!(expect_invalid("16 4 1 /x 0 0 d i 5 0 d").contains("incomplete"));
        assert!(expect_invalid("16 4 1 /x 128 0 d i").contains("outside"));
        assert!(expect_invalid("16 4 1 /x 0 0 d i 0 1 e j").contains("twice"));
        assert!(expect_invalid("16 4 x /x 0 0 d i").contains("not a number"));
    }

    #[test]
    fn missing_descriptor_is_an_open_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Topology::load_from_path(dir.path().join("absent.txt")),
            Err(FbiError::Open { .. })
        ));
    }

    #[test]
    fn paths_with_spaces_cannot_be_saved() {
        let mut topology = Topology::new(1, "/srv");
        topology.partitions.push(PartitionSpec {
            partition: 0,
            disk: 0,
            data_path: PathBuf::from("my data"),
            index_path: PathBuf::from("sample.0"),
        });
        assert!(topology.to_descriptor_string().is_err());
    }
}
