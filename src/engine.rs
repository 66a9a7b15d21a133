use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::index::Index;
use crate::plan::{Plan, Range};
use crate::planner::{Algorithm, Planner};
use crate::record::Code;
use crate::scanner::{check_geometry, DataFile, ScanReport, ScanStatus, Scanner};
use crate::stats::Coverage;
use crate::topology::Topology;
use crate::{FbiError, Key, DATA_BIT};

/// Scan buffer geometry and file open mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineOptions {
    /// Bytes of each scan buffer; at least three blocks.
    pub buffer_size: usize,
    /// Storage block size reads are aligned to.
    pub block_size: usize,
    /// Bypass the page cache where supported.
    pub direct_io: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            buffer_size: 10 * 1024 * 1024,
            block_size: 512,
            direct_io: false,
        }
    }
}

impl EngineOptions {
    pub fn validate(&self) -> Result<(), FbiError> {
        check_geometry(self.buffer_size, self.block_size)
    }
}

/// Keys found for one query together with how the scans ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Sorted, without duplicates.
    pub keys: Vec<Key>,
    pub ranges: usize,
    pub scanned: usize,
    pub capped: usize,
    pub failed: usize,
    pub truncated: usize,
}

impl RunReport {
    fn absorb(&mut self, scan: &ScanReport) {
        self.ranges += 1;
        self.scanned += scan.scanned;
        match scan.status {
            ScanStatus::Exhausted => {}
            ScanStatus::Capped => self.capped += 1,
            ScanStatus::ReadFailed => self.failed += 1,
            ScanStatus::Truncated => self.truncated += 1,
        }
    }

    /// Every planned range was read to its end.
    pub fn is_complete(&self) -> bool {
        self.capped == 0 && self.failed == 0 && self.truncated == 0
    }
}

/// One range of one query, ordered for sequential reads on a disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Access {
    partition: usize,
    range: Range,
    query: usize,
}

/// All configured partitions of one dataset, opened for querying.
#[derive(Debug)]
pub struct Engine {
    sample_rate: usize,
    samples: usize,
    indexes: Vec<Option<Index>>,
    files: Vec<Option<DataFile>>,
    disks: Vec<usize>,
    hits: Vec<AtomicU64>,
    options: EngineOptions,
}

impl Engine {
    /// Open the engine described by a topology descriptor file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, FbiError> {
        Self::open_with(path, EngineOptions::default())
    }

    pub fn open_with<P: AsRef<Path>>(path: P, options: EngineOptions) -> Result<Self, FbiError> {
        let topology = Topology::load_from_path(path)?;
        Self::from_topology(&topology, options)
    }

    /// Open every partition of `topology`. Fails unless every data file and
    /// sample index loads, each data file holds the records its index was
    /// sampled from, and all partitions hold the same number of samples.
    pub fn from_topology(topology: &Topology, options: EngineOptions) -> Result<Self, FbiError> {
        topology.validate()?;
        options.validate()?;

        let mut indexes: Vec<Option<Index>> = (0..DATA_BIT).map(|_| None).collect();
        let mut files: Vec<Option<DataFile>> = (0..DATA_BIT).map(|_| None).collect();
        let mut disks = vec![0usize; DATA_BIT];
        let mut samples: Option<usize> = None;

        for spec in &topology.partitions {
            let data_path = topology.data_path(spec);
            let file = DataFile::open(&data_path, options.direct_io)?;
            let index = Index::load_from_path(topology.index_path(spec))?;
            if index.first_offset() as usize != spec.partition {
                return Err(FbiError::InvalidTopology(format!(
                    "partition {} points at an index built for bit {}",
                    spec.partition,
                    index.first_offset()
                )));
            }
            check_record_count(&data_path, file.records(), index.max(), topology.sample_rate)?;
            match samples {
                None => samples = Some(index.max()),
                Some(expected) if expected != index.max() => {
                    return Err(FbiError::InconsistentPartitions {
                        partition: spec.partition,
                        expected,
                        got: index.max(),
                    });
                }
                Some(_) => {}
            }
            debug!(
                partition = spec.partition,
                disk = spec.disk,
                nodes = index.nodes().len(),
                "loaded partition"
            );
            indexes[spec.partition] = Some(index);
            files[spec.partition] = Some(file);
            disks[spec.partition] = spec.disk;
        }

        let samples = samples.unwrap_or(0);
        info!(
            partitions = topology.partitions.len(),
            samples,
            sample_rate = topology.sample_rate,
            "engine opened"
        );
        Ok(Self {
            sample_rate: topology.sample_rate,
            samples,
            indexes,
            files,
            disks,
            hits: (0..DATA_BIT).map(|_| AtomicU64::new(0)).collect(),
            options,
        })
    }

    pub fn sample_rate(&self) -> usize {
        self.sample_rate
    }

    /// Samples per partition.
    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Configured partition ids in ascending order.
    pub fn partitions(&self) -> Vec<usize> {
        self.indexes
            .iter()
            .enumerate()
            .filter(|(_, index)| index.is_some())
            .map(|(partition, _)| partition)
            .collect()
    }

    pub fn index(&self, partition: usize) -> Option<&Index> {
        self.indexes.get(partition).and_then(Option::as_ref)
    }

    pub fn planner(&self) -> Planner<'_> {
        Planner::new(&self.indexes)
    }

    /// Plan `query` with inclusive Hamming radius `distance`.
    pub fn plan(
        &self,
        query: &Code,
        algorithm: Algorithm,
        distance: u32,
        skip: u32,
    ) -> Result<Plan, FbiError> {
        self.planner().plan(query, algorithm, distance, skip)
    }

    /// Records a plan will scan.
    pub fn cost(&self, plan: &Plan) -> usize {
        plan.cost() * self.sample_rate
    }

    /// Per-partition position counters sized to this engine.
    pub fn new_coverage(&self) -> Coverage {
        let sizes: Vec<usize> = self
            .indexes
            .iter()
            .map(|index| index.as_ref().map_or(0, Index::max))
            .collect();
        Coverage::new(&sizes)
    }

    fn scanner(&self) -> Result<Scanner, FbiError> {
        Scanner::new(self.options.buffer_size, self.options.block_size)
    }

    fn file(&self, partition: usize) -> &DataFile {
        match &self.files[partition] {
            Some(file) => file,
            None => panic!("plan selects unconfigured partition {partition}"),
        }
    }

    /// Keys within inclusive radius `distance` of `query` among the ranges of
    /// `plan`, sorted and without duplicates.
    pub fn run(&self, query: &Code, distance: u32, plan: &Plan) -> Result<Vec<Key>, FbiError> {
        Ok(self.run_with_report(query, distance, plan)?.keys)
    }

    pub fn run_with_report(
        &self,
        query: &Code,
        distance: u32,
        plan: &Plan,
    ) -> Result<RunReport, FbiError> {
        let mut scanner = self.scanner()?;
        let threshold = distance.saturating_add(1);
        let mut report = RunReport::default();
        for (partition, selection) in plan.iter() {
            let file = self.file(partition);
            self.hits[partition].fetch_add(1, Ordering::Relaxed);
            for range in selection {
                let scan = scanner.scan(file, query, *range, self.sample_rate, threshold, |key| {
                    report.keys.push(key)
                });
                report.absorb(&scan);
            }
        }
        report.keys.sort_unstable();
        report.keys.dedup();
        Ok(report)
    }

    /// Plan and run many queries at once.
    ///
    /// Queries are planned in parallel with radius `plan_distance`. Their
    /// ranges are then grouped by disk and each disk's ranges read in
    /// partition and offset order, disks in parallel, keeping keys within
    /// radius `distance`.
    pub fn batch(
        &self,
        queries: &[Code],
        algorithm: Algorithm,
        plan_distance: u32,
        distance: u32,
        skip: u32,
    ) -> Result<Vec<Vec<Key>>, FbiError> {
        let reports = self.batch_with_report(queries, algorithm, plan_distance, distance, skip)?;
        Ok(reports.into_iter().map(|report| report.keys).collect())
    }

    /// [`Engine::batch`] with one report per query.
    pub fn batch_with_report(
        &self,
        queries: &[Code],
        algorithm: Algorithm,
        plan_distance: u32,
        distance: u32,
        skip: u32,
    ) -> Result<Vec<RunReport>, FbiError> {
        let plans = queries
            .par_iter()
            .map(|query| self.plan(query, algorithm, plan_distance, skip))
            .collect::<Result<Vec<_>, FbiError>>()?;

        let mut per_disk: BTreeMap<usize, Vec<Access>> = BTreeMap::new();
        for (query, plan) in plans.iter().enumerate() {
            for (partition, selection) in plan.iter() {
                self.hits[partition].fetch_add(1, Ordering::Relaxed);
                per_disk
                    .entry(self.disks[partition])
                    .or_default()
                    .extend(selection.iter().map(|&range| Access {
                        partition,
                        range,
                        query,
                    }));
            }
        }
        debug!(
            queries = queries.len(),
            disks = per_disk.len(),
            accesses = per_disk.values().map(Vec::len).sum::<usize>(),
            "batch planned"
        );

        let sinks: Vec<Mutex<RunReport>> = queries
            .iter()
            .map(|_| Mutex::new(RunReport::default()))
            .collect();
        let threshold = distance.saturating_add(1);
        per_disk
            .into_par_iter()
            .map(|(disk, mut accesses)| -> Result<(), FbiError> {
                accesses.sort_unstable();
                let mut scanner = self.scanner()?;
                for access in &accesses {
                    let sink = &sinks[access.query];
                    let scan = scanner.scan(
                        self.file(access.partition),
                        &queries[access.query],
                        access.range,
                        self.sample_rate,
                        threshold,
                        |key| sink.lock().keys.push(key),
                    );
                    sink.lock().absorb(&scan);
                }
                debug!(disk, accesses = accesses.len(), "disk scanned");
                Ok(())
            })
            .collect::<Result<(), FbiError>>()?;

        let mut results: Vec<RunReport> = sinks.into_iter().map(Mutex::into_inner).collect();
        results.par_iter_mut().for_each(|report| {
            report.keys.sort_unstable();
            report.keys.dedup();
        });
        Ok(results)
    }

    /// Lifetime count of plans that scanned each partition.
    pub fn hit_stats(&self) -> Vec<u64> {
        self.hits
            .iter()
            .map(|hits| hits.load(Ordering::Relaxed))
            .collect()
    }
}

/// A data file of `records` records sampled every `sample_rate` records
/// yields exactly `samples` samples.
fn check_record_count(
    path: &Path,
    records: usize,
    samples: usize,
    sample_rate: usize,
) -> Result<(), FbiError> {
    let fits = match samples {
        0 => records == 0,
        _ => records > (samples - 1) * sample_rate && records <= samples * sample_rate,
    };
    if fits {
        Ok(())
    } else {
        Err(FbiError::MalformedData {
            path: path.to_path_buf(),
            detail: format!(
                "{records} records cannot yield {samples} samples at one per {sample_rate}"
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_are_valid() {
        let options = EngineOptions::default();
        assert!(options.validate().is_ok());
        assert_eq!(options.buffer_size, 10 * 1024 * 1024);
        assert!(!options.direct_io);
    }

    #[test]
    fn options_round_trip_through_json() {
        let options = EngineOptions {
            buffer_size: 1 << 20,
            block_size: 4096,
            direct_io: true,
        };
        let text = serde_json::to_string(&options).unwrap();
        assert!(text.contains("\"block_size\":4096"));
        let restored: EngineOptions = serde_json::from_str(&text).unwrap();
        assert_eq!(restored, options);
    }

    #[test]
    fn options_reject_small_buffers() {
        let options = EngineOptions {
            buffer_size: 1024,
            block_size: 512,
            direct_io: false,
        };
        assert!(matches!(options.validate(), Err(FbiError::InvalidConfig(_))));
    }

    #[test]
    fn run_report_tracks_incomplete_scans() {
        let mut report = RunReport::default();
        report.absorb(&ScanReport {
            status: ScanStatus::Exhausted,
            scanned: 10,
            matched: 1,
        });
        assert!(report.is_complete());
        report.absorb(&ScanReport {
            status: ScanStatus::Capped,
            scanned: 600,
            matched: 500,
        });
        assert!(!report.is_complete());
        report.absorb(&ScanReport {
            status: ScanStatus::Truncated,
            scanned: 0,
            matched: 0,
        });
        assert_eq!(report.truncated, 1);
        assert_eq!(report.ranges, 3);
        assert_eq!(report.scanned, 610);
        assert_eq!(report.capped, 1);
    }

    #[test]
    fn record_count_must_match_samples() {
        let path = Path::new("data.0");
        assert!(check_record_count(path, 1000, 250, 4).is_ok());
        assert!(check_record_count(path, 997, 250, 4).is_ok());
        assert!(check_record_count(path, 996, 250, 4).is_err());
        assert!(check_record_count(path, 1001, 250, 4).is_err());
        assert!(check_record_count(path, 0, 0, 4).is_ok());
        assert!(matches!(
            check_record_count(path, 500, 1000, 1),
            Err(FbiError::MalformedData { .. })
        ));
    }

    #[test]
    fn accesses_sort_by_partition_then_offset() {
        let mut accesses = vec![
            Access { partition: 64, range: Range::new(0, 5), query: 0 },
            Access { partition: 0, range: Range::new(30, 5), query: 1 },
            Access { partition: 0, range: Range::new(10, 5), query: 2 },
        ];
        accesses.sort_unstable();
        let order: Vec<usize> = accesses.iter().map(|a| a.query).collect();
        assert_eq!(order, vec![2, 1, 0]);
    }
}
