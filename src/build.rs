//! Local construction of partition data files and sample indexes.

use std::fs;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::index::Index;
use crate::io::{sample_codes, write_records};
use crate::record::{rotated_cmp, Code, Record};
use crate::topology::{PartitionSpec, Topology};
use crate::trie::TrieBuilder;
use crate::{FbiError, DATA_BIT};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOptions {
    /// Records per sample.
    pub sample_rate: usize,
    /// Bits consumed per trie level.
    pub sample_skip: u32,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            sample_rate: 1000,
            sample_skip: 2,
        }
    }
}

impl BuildOptions {
    pub fn validate(&self) -> Result<(), FbiError> {
        if self.sample_rate == 0 {
            return Err(FbiError::InvalidConfig("sample rate must be positive"));
        }
        // the trie builder owns the sample skip rules
        TrieBuilder::new(0, self.sample_skip).map(|_| ())
    }
}

/// Sort records into the order of partition `partition`.
pub fn sort_for_partition(records: &mut [Record], partition: u32) {
    records.par_sort_by(|a, b| rotated_cmp(&a.code, &b.code, partition));
}

/// Sample index over codes already sorted for `partition`, one sample per
/// `sample_rate` codes.
pub fn index_from_sorted<'a, I>(
    codes: I,
    partition: u32,
    options: &BuildOptions,
) -> Result<Index, FbiError>
where
    I: IntoIterator<Item = &'a Code>,
{
    options.validate()?;
    let mut builder = TrieBuilder::new(partition, options.sample_skip)?;
    for code in codes.into_iter().step_by(options.sample_rate) {
        builder.insert(code);
    }
    Ok(builder.finish())
}

/// Sample index over an existing sorted data file.
pub fn index_from_data_file<P: AsRef<Path>>(
    path: P,
    partition: u32,
    options: &BuildOptions,
) -> Result<Index, FbiError> {
    options.validate()?;
    let samples = sample_codes(path, options.sample_rate)?;
    let single = BuildOptions {
        sample_rate: 1,
        ..*options
    };
    index_from_sorted(&samples, partition, &single)
}

/// Sort a copy of `records` for `partition`, write it to `data_path` and its
/// sample index to `index_path`.
pub fn build_partition(
    records: &[Record],
    partition: usize,
    options: &BuildOptions,
    data_path: &Path,
    index_path: &Path,
) -> Result<Index, FbiError> {
    if partition >= DATA_BIT {
        return Err(FbiError::InvalidConfig("partition must lie inside the code"));
    }
    let mut sorted = records.to_vec();
    sort_for_partition(&mut sorted, partition as u32);
    write_records(data_path, &sorted)?;
    let index = index_from_sorted(sorted.iter().map(|r| &r.code), partition as u32, options)?;
    index.save_to_path(index_path)?;
    Ok(index)
}

/// Build every `(partition, disk)` of `layout` under `dir`, partitions in
/// parallel, and describe the result.
pub fn build_database(
    records: &[Record],
    layout: &[(usize, usize)],
    dir: &Path,
    options: &BuildOptions,
) -> Result<Topology, FbiError> {
    options.validate()?;
    fs::create_dir_all(dir)?;

    let mut topology = Topology::new(options.sample_rate, dir);
    topology.partitions = layout
        .iter()
        .map(|&(partition, disk)| PartitionSpec {
            partition,
            disk,
            data_path: PathBuf::from(format!("data.{partition}")),
            index_path: PathBuf::from(format!("sample.{partition}")),
        })
        .collect();
    topology.validate()?;

    topology
        .partitions
        .par_iter()
        .map(|spec| -> Result<(), FbiError> {
            let index = build_partition(
                records,
                spec.partition,
                options,
                &topology.data_path(spec),
                &topology.index_path(spec),
            )?;
            info!(
                partition = spec.partition,
                samples = index.max(),
                nodes = index.nodes().len(),
                "built partition"
            );
            Ok(())
        })
        .collect::<Result<(), FbiError>>()?;

    Ok(topology)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{find_unsorted, read_records};
    use rand::prelude::*;

    fn random_records(n: usize, seed: u64) -> Vec<Record> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n).map(|i| Record::new(rng.gen(), i as u32)).collect()
    }

    #[test]
    fn built_partitions_are_sorted_and_sampled() {
        let dir = tempfile::tempdir().unwrap();
        let records = random_records(500, 1);
        let options = BuildOptions {
            sample_rate: 7,
            sample_skip: 4,
        };
        let topology = build_database(&records, &[(0, 0), (40, 1)], dir.path(), &options).unwrap();
        assert_eq!(topology.sample_rate, 7);
        for spec in &topology.partitions {
            let data = topology.data_path(spec);
            assert!(find_unsorted(&data, spec.partition as u32, 1).unwrap().is_empty());
            let stored = read_records(&data, None).unwrap();
            assert_eq!(stored.len(), 500);

            let index = Index::load_from_path(topology.index_path(spec)).unwrap();
            assert_eq!(index.first_offset() as usize, spec.partition);
            // ceil(500 / 7) samples
            assert_eq!(index.max(), 72);
            let rebuilt = index_from_data_file(&data, spec.partition as u32, &options).unwrap();
            assert_eq!(rebuilt, index);
        }
    }

    #[test]
    fn build_rejects_bad_options() {
        let dir = tempfile::tempdir().unwrap();
        let records = random_records(10, 2);
        let zero_rate = BuildOptions {
            sample_rate: 0,
            sample_skip: 4,
        };
        assert!(build_database(&records, &[(0, 0)], dir.path(), &zero_rate).is_err());
        let odd_skip = BuildOptions {
            sample_rate: 1,
            sample_skip: 5,
        };
        assert!(build_database(&records, &[(0, 0)], dir.path(), &odd_skip).is_err());
        assert!(build_database(&records, &[(128, 0)], dir.path(), &BuildOptions::default()).is_err());
    }
}
