//! Query planning: which ranges of which partitions to scan.
//!
//! A code within Hamming radius `r` of the query agrees exactly with it on at
//! least one of any `r + 1` disjoint bit segments. Every planner except the
//! exhaustive one picks such segments, and narrows each through the sample
//! index of the partition starting at that segment. The best-effort planner
//! takes its segments from the configured partitions instead, and can miss
//! codes inside the radius.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::index::Index;
use crate::plan::{Plan, Selection};
use crate::record::Code;
use crate::{FbiError, DATA_BIT};

/// Planning strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    /// Scan the whole of the first configured partition.
    Exhaustive,
    /// Narrow every configured partition by the bits up to the next one.
    ///
    /// Ignores the radius; see [`Planner::best_effort`].
    BestEffort,
    /// Split the code into equal segments starting at bit 0.
    Uniform,
    /// Choose the segment layout with the smallest total scan cost.
    Optimal,
}

impl Algorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::Exhaustive => "exhaustive",
            Algorithm::BestEffort => "best-effort",
            Algorithm::Uniform => "uniform",
            Algorithm::Optimal => "optimal",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Algorithm {
    type Err = FbiError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "exhaustive" | "linear" | "0" => Ok(Algorithm::Exhaustive),
            "best-effort" | "all" | "1" => Ok(Algorithm::BestEffort),
            "uniform" | "equal" | "2" => Ok(Algorithm::Uniform),
            "optimal" | "smart" | "3" => Ok(Algorithm::Optimal),
            _ => Err(FbiError::InvalidConfig("unknown planning algorithm")),
        }
    }
}

/// One segment of a circular layout, in units of the layout granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub boundary: usize,
    pub width: usize,
}

/// A circular layout of boundaries with its total cost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub start: usize,
    pub cost: usize,
    pub segments: Vec<Segment>,
}

const UNREACHABLE: usize = usize::MAX;

/// Cut a circle of `size` positions into exactly `parts` contiguous segments,
/// each starting at a `good` position, minimising the summed `cost(boundary,
/// width)`.
///
/// Segments are listed from `start`, the smallest boundary; the last one
/// wraps round to `start`. Ties keep the smallest `start`, and within a
/// `start` the nearest next boundary. Returns `None` when fewer than `parts`
/// positions are good.
pub fn partition_circle<F>(size: usize, parts: usize, good: &[bool], cost: F) -> Option<Layout>
where
    F: Fn(usize, usize) -> usize,
{
    assert_eq!(good.len(), size, "one flag per position");
    if parts == 0 || parts > size {
        return None;
    }

    // table[c][n]: cheapest way to lay c + 1 segments from n back to start
    let mut table = vec![vec![UNREACHABLE; size]; parts];
    let mut next = vec![vec![0usize; size]; parts];
    let mut best: Option<Layout> = None;

    for start in 0..=size - parts {
        if !good[start] {
            continue;
        }
        for row in table.iter_mut() {
            row.fill(UNREACHABLE);
        }

        for n in start + parts - 1..size {
            if good[n] {
                table[0][n] = cost(n, size - n + start);
            }
        }

        for c in 1..parts {
            let last = size - 1 - c;
            for n in start + parts - 1 - c..=last {
                if !good[n] {
                    continue;
                }
                let mut cheapest = UNREACHABLE;
                let mut follow = 0;
                for m in n + 1..=last + 1 {
                    if !good[m] || table[c - 1][m] == UNREACHABLE {
                        continue;
                    }
                    let total = cost(n, m - n).saturating_add(table[c - 1][m]);
                    if total < cheapest {
                        cheapest = total;
                        follow = m;
                    }
                }
                table[c][n] = cheapest;
                next[c][n] = follow;
            }
        }

        let total = table[parts - 1][start];
        if total == UNREACHABLE || best.as_ref().map_or(false, |b| total >= b.cost) {
            continue;
        }

        let mut segments = Vec::with_capacity(parts);
        let mut k = start;
        for level in (0..parts).rev() {
            if level == 0 {
                segments.push(Segment {
                    boundary: k,
                    width: size - k + start,
                });
            } else {
                let m = next[level][k];
                segments.push(Segment {
                    boundary: k,
                    width: m - k,
                });
                k = m;
            }
        }
        best = Some(Layout {
            start,
            cost: total,
            segments,
        });
    }

    best
}

/// Plans queries against one slot per partition id, `None` where no sample
/// index is configured.
#[derive(Debug, Clone, Copy)]
pub struct Planner<'a> {
    indexes: &'a [Option<Index>],
}

impl<'a> Planner<'a> {
    /// # Panics
    ///
    /// Panics unless there are `DATA_BIT` slots and at least one is configured.
    pub fn new(indexes: &'a [Option<Index>]) -> Self {
        assert_eq!(indexes.len(), DATA_BIT, "one slot per partition");
        assert!(
            indexes.iter().any(Option::is_some),
            "planning needs at least one configured partition"
        );
        Self { indexes }
    }

    fn configured(&self) -> impl Iterator<Item = (usize, &'a Index)> + 'a {
        let indexes: &'a [Option<Index>] = self.indexes;
        indexes
            .iter()
            .enumerate()
            .filter_map(|(partition, index)| index.as_ref().map(|index| (partition, index)))
    }

    /// Plan a query with inclusive Hamming radius `distance`.
    ///
    /// `skip` is the boundary granularity in bits of the optimal planner and
    /// is ignored by the others.
    pub fn plan(
        &self,
        query: &Code,
        algorithm: Algorithm,
        distance: u32,
        skip: u32,
    ) -> Result<Plan, FbiError> {
        let parts = distance as usize + 1;
        let plan = match algorithm {
            Algorithm::Exhaustive => self.exhaustive(),
            Algorithm::BestEffort => self.best_effort(query),
            Algorithm::Uniform => self.uniform(query, parts)?,
            Algorithm::Optimal => self.optimal(query, parts, skip)?,
        };
        debug!(
            algorithm = %algorithm,
            distance,
            partitions = plan.iter().count(),
            cost = plan.cost(),
            "planned query"
        );
        Ok(plan)
    }

    /// The whole of the first configured partition.
    pub fn exhaustive(&self) -> Plan {
        let mut plan = Plan::new();
        if let Some((partition, index)) = self.configured().next() {
            plan.set(partition, index.all());
        }
        plan
    }

    /// Every configured partition, narrowed by the bits up to the next
    /// configured partition (wrapping round to the first).
    ///
    /// # Accuracy
    ///
    /// The segments are fixed by the configured partitions, not by the
    /// radius. With fewer than `r + 1` configured partitions a code within
    /// radius `r` can differ from the query in every segment and is then
    /// missed. Narrowing also only keeps codes whose segment falls inside
    /// the sample bracket the trie returns, so the plan trades recall for
    /// fewer scanned records.
    pub fn best_effort(&self, query: &Code) -> Plan {
        let good: Vec<(usize, &Index)> = self.configured().collect();
        let mut plan = Plan::new();
        for (i, &(partition, index)) in good.iter().enumerate() {
            let gap = match good.get(i + 1) {
                Some(&(following, _)) => following - partition,
                None => DATA_BIT - partition + good[0].0,
            };
            trace!(partition, bits = gap, "best-effort segment");
            plan.set(
                partition,
                Selection::single(index.lookup_one(query, gap as u32)),
            );
        }
        plan
    }

    /// `parts` contiguous segments starting at bit 0, the first
    /// `DATA_BIT % parts` of them one bit wider than the rest.
    pub fn uniform(&self, query: &Code, parts: usize) -> Result<Plan, FbiError> {
        if parts == 0 || parts > DATA_BIT {
            return Err(FbiError::Unplannable { partitions: parts, skip: 1 });
        }
        let wide = DATA_BIT % parts;
        let mut bits = DATA_BIT / parts + 1;
        let mut cur = 0usize;
        let mut plan = Plan::new();
        for i in 0..parts {
            if i == wide {
                bits -= 1;
            }
            let index = self.indexes[cur]
                .as_ref()
                .ok_or(FbiError::MissingPartition { partition: cur })?;
            plan.set(cur, Selection::single(index.lookup_one(query, bits as u32)));
            cur += bits;
        }
        Ok(plan)
    }

    /// The cheapest layout of `parts` segments whose boundaries are
    /// multiples of `skip` bits.
    pub fn optimal(&self, query: &Code, parts: usize, skip: u32) -> Result<Plan, FbiError> {
        let skip_bits = skip as usize;
        if skip_bits == 0 || DATA_BIT % skip_bits != 0 {
            return Err(FbiError::InvalidConfig(
                "optimal planning granularity must divide the code width",
            ));
        }
        let size = DATA_BIT / skip_bits;

        let mut good = vec![false; size];
        let mut lookups: Vec<Vec<Selection>> = vec![Vec::new(); size];
        for (i, flag) in good.iter_mut().enumerate() {
            if let Some(index) = &self.indexes[i * skip_bits] {
                if skip % index.sample_skip() != 0 {
                    return Err(FbiError::InvalidConfig(
                        "optimal planning granularity must be a multiple of every sample skip",
                    ));
                }
                *flag = true;
                lookups[i] = index.lookup_series(query, skip, size);
            }
        }

        let layout = partition_circle(size, parts, &good, |n, width| {
            lookups[n][width - 1].cost()
        })
        .ok_or(FbiError::Unplannable {
            partitions: parts,
            skip: skip_bits,
        })?;

        let mut plan = Plan::new();
        for segment in &layout.segments {
            plan.set(
                segment.boundary * skip_bits,
                lookups[segment.boundary][segment.width - 1].clone(),
            );
        }
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::rotated_cmp;
    use crate::trie::TrieBuilder;
    use rand::prelude::*;

    fn sorted_codes(codes: &[Code], first: u32) -> Vec<Code> {
        let mut sorted = codes.to_vec();
        sorted.sort_by(|a, b| rotated_cmp(a, b, first));
        sorted
    }

    fn build_indexes(codes: &[Code], partitions: &[usize], skip: u32) -> Vec<Option<Index>> {
        let mut indexes: Vec<Option<Index>> = (0..DATA_BIT).map(|_| None).collect();
        for &partition in partitions {
            let mut builder = TrieBuilder::new(partition as u32, skip).unwrap();
            for code in sorted_codes(codes, partition as u32) {
                builder.insert(&code);
            }
            indexes[partition] = Some(builder.finish());
        }
        indexes
    }

    fn random_codes(n: usize, seed: u64) -> Vec<Code> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n).map(|_| rng.gen()).collect()
    }

    /// Every layout of `parts` good boundaries, by enumeration.
    fn brute_force<F: Fn(usize, usize) -> usize>(
        size: usize,
        parts: usize,
        good: &[bool],
        cost: &F,
    ) -> Option<usize> {
        fn walk<F: Fn(usize, usize) -> usize>(
            chosen: &mut Vec<usize>,
            from: usize,
            size: usize,
            parts: usize,
            good: &[bool],
            cost: &F,
            best: &mut Option<usize>,
        ) {
            if chosen.len() == parts {
                let mut total = 0usize;
                for (i, &b) in chosen.iter().enumerate() {
                    let width = match chosen.get(i + 1) {
                        Some(&next) => next - b,
                        None => size - b + chosen[0],
                    };
                    total += cost(b, width);
                }
                *best = Some(best.map_or(total, |b| b.min(total)));
                return;
            }
            for b in from..size {
                if good[b] {
                    chosen.push(b);
                    walk(chosen, b + 1, size, parts, good, cost, best);
                    chosen.pop();
                }
            }
        }
        let mut best = None;
        walk(&mut Vec::new(), 0, size, parts, good, cost, &mut best);
        best
    }

    #[test]
    fn partition_circle_hand_computed_layout() {
        // four configured boundaries on a circle of eight positions
        let good = [true, false, true, false, true, false, true, false];
        let mut costs = [[1000usize; 8]; 8];
        costs[0][1] = 50;
        costs[0][3] = 20;
        costs[0][5] = 8;
        costs[2][1] = 40;
        costs[2][3] = 10;
        costs[2][5] = 5;
        costs[4][1] = 30;
        costs[4][3] = 12;
        costs[4][5] = 3;
        costs[6][1] = 60;
        costs[6][3] = 25;
        costs[6][5] = 9;
        let cost = |n: usize, w: usize| costs[n][w - 1];

        // (0,4): 20 + 12 beats (2,6): 10 + 25 and (4,6): 30 + 9
        let layout = partition_circle(8, 2, &good, cost).unwrap();
        assert_eq!(layout.start, 0);
        assert_eq!(layout.cost, 32);
        assert_eq!(
            layout.segments,
            vec![
                Segment { boundary: 0, width: 4 },
                Segment { boundary: 4, width: 4 },
            ]
        );
        assert_eq!(brute_force(8, 2, &good, &cost), Some(32));
    }

    #[test]
    fn partition_circle_matches_brute_force() {
        let mut rng = StdRng::seed_from_u64(0xD9);
        for _ in 0..200 {
            let size = 8;
            let good: Vec<bool> = (0..size).map(|_| rng.gen_bool(0.6)).collect();
            let parts = rng.gen_range(1..=4);
            let table: Vec<Vec<usize>> = (0..size)
                .map(|_| (0..size).map(|_| rng.gen_range(0..100)).collect())
                .collect();
            let cost = |n: usize, w: usize| table[n][w - 1];
            let layout = partition_circle(size, parts, &good, cost);
            let expected = brute_force(size, parts, &good, &cost);
            assert_eq!(layout.as_ref().map(|l| l.cost), expected);
            if let Some(layout) = layout {
                assert_eq!(layout.segments.len(), parts);
                assert_eq!(layout.segments.iter().map(|s| s.width).sum::<usize>(), size);
                assert!(layout.segments.iter().all(|s| good[s.boundary]));
                let recomputed: usize = layout.segments.iter().map(|s| cost(s.boundary, s.width)).sum();
                assert_eq!(recomputed, layout.cost);
            }
        }
    }

    #[test]
    fn partition_circle_keeps_the_first_of_equal_layouts() {
        let good = [true; 8];
        let layout = partition_circle(8, 3, &good, |_, _| 1).unwrap();
        assert_eq!(layout.start, 0);
        assert_eq!(
            layout.segments,
            vec![
                Segment { boundary: 0, width: 1 },
                Segment { boundary: 1, width: 1 },
                Segment { boundary: 2, width: 6 },
            ]
        );
    }

    #[test]
    fn partition_circle_needs_enough_boundaries() {
        let good = [true, false, false, false, true, false, false, false];
        assert!(partition_circle(8, 3, &good, |_, _| 1).is_none());
        assert!(partition_circle(8, 0, &good, |_, _| 1).is_none());
        assert!(partition_circle(8, 2, &good, |_, _| 1).is_some());
    }

    #[test]
    fn algorithm_parses_names_and_numbers() {
        assert_eq!("smart".parse::<Algorithm>().unwrap(), Algorithm::Optimal);
        assert_eq!("Uniform".parse::<Algorithm>().unwrap(), Algorithm::Uniform);
        assert_eq!("1".parse::<Algorithm>().unwrap(), Algorithm::BestEffort);
        assert_eq!("linear".parse::<Algorithm>().unwrap(), Algorithm::Exhaustive);
        assert!("fastest".parse::<Algorithm>().is_err());
        assert_eq!(Algorithm::BestEffort.to_string(), "best-effort");
    }

    #[test]
    fn algorithm_serializes_as_its_name() {
        for algorithm in [
            Algorithm::Exhaustive,
            Algorithm::BestEffort,
            Algorithm::Uniform,
            Algorithm::Optimal,
        ] {
            let text = serde_json::to_string(&algorithm).unwrap();
            assert_eq!(text, format!("\"{algorithm}\""));
            assert_eq!(serde_json::from_str::<Algorithm>(&text).unwrap(), algorithm);
        }
    }

    #[test]
    fn exhaustive_covers_the_first_configured_partition() {
        let codes = random_codes(200, 1);
        let indexes = build_indexes(&codes, &[32, 96], 4);
        let plan = Planner::new(&indexes).exhaustive();
        let used: Vec<usize> = plan.iter().map(|(p, _)| p).collect();
        assert_eq!(used, vec![32]);
        assert_eq!(plan.cost(), 200);
    }

    #[test]
    fn planners_keep_the_query_position() {
        let codes = random_codes(3000, 2);
        let partitions: Vec<usize> = (0..DATA_BIT).step_by(16).collect();
        let indexes = build_indexes(&codes, &partitions, 4);
        let planner = Planner::new(&indexes);
        let query = codes[1234];
        for algorithm in [
            Algorithm::Exhaustive,
            Algorithm::BestEffort,
            Algorithm::Uniform,
            Algorithm::Optimal,
        ] {
            for distance in [0u32, 1, 3] {
                let plan = planner.plan(&query, algorithm, distance, 16).unwrap();
                assert!(!plan.is_empty());
                // the query itself must fall inside some planned range
                let found = plan.iter().any(|(partition, selection)| {
                    let sorted = sorted_codes(&codes, partition as u32);
                    let position = sorted.iter().position(|c| *c == query).unwrap();
                    selection.iter().any(|r| r.contains(position))
                });
                assert!(found, "{algorithm} at distance {distance} lost the query");
            }
        }
    }

    #[test]
    fn optimal_plan_is_no_worse_than_uniform() {
        let codes = random_codes(4000, 3);
        let partitions: Vec<usize> = (0..DATA_BIT).step_by(16).collect();
        let indexes = build_indexes(&codes, &partitions, 4);
        let planner = Planner::new(&indexes);
        let mut rng = StdRng::seed_from_u64(4);
        for _ in 0..20 {
            let query: Code = rng.gen();
            let uniform = planner.plan(&query, Algorithm::Uniform, 1, 16).unwrap();
            let optimal = planner.plan(&query, Algorithm::Optimal, 1, 16).unwrap();
            assert_eq!(optimal.iter().count(), 2);
            assert!(optimal.cost() <= uniform.cost());
        }
    }

    #[test]
    fn planning_is_idempotent() {
        let codes = random_codes(1000, 5);
        let indexes = build_indexes(&codes, &[0, 32, 64, 96], 4);
        let planner = Planner::new(&indexes);
        let query = random_codes(1, 6)[0];
        for algorithm in [Algorithm::BestEffort, Algorithm::Uniform, Algorithm::Optimal] {
            let a = planner.plan(&query, algorithm, 1, 32).unwrap();
            let b = planner.plan(&query, algorithm, 1, 32).unwrap();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn uniform_requires_configured_boundaries() {
        let codes = random_codes(100, 7);
        let indexes = build_indexes(&codes, &[0, 64], 4);
        let planner = Planner::new(&indexes);
        let query = codes[0];
        assert!(planner.plan(&query, Algorithm::Uniform, 1, 16).is_ok());
        match planner.plan(&query, Algorithm::Uniform, 2, 16) {
            Err(FbiError::MissingPartition { partition }) => assert_eq!(partition, 44),
            other => panic!("expected MissingPartition, got {other:?}"),
        }
    }

    #[test]
    fn optimal_reports_unplannable_layouts() {
        let codes = random_codes(100, 8);
        let indexes = build_indexes(&codes, &[0, 64], 4);
        let planner = Planner::new(&indexes);
        let query = codes[0];
        assert!(matches!(
            planner.plan(&query, Algorithm::Optimal, 2, 16),
            Err(FbiError::Unplannable { partitions: 3, skip: 16 })
        ));
        assert!(matches!(
            planner.plan(&query, Algorithm::Optimal, 0, 3),
            Err(FbiError::InvalidConfig(_))
        ));
        assert!(matches!(
            planner.plan(&query, Algorithm::Optimal, 0, 2),
            Err(FbiError::InvalidConfig(_))
        ));
    }

    #[test]
    #[should_panic]
    fn planner_without_partitions_panics() {
        let indexes: Vec<Option<Index>> = (0..DATA_BIT).map(|_| None).collect();
        let _ = Planner::new(&indexes);
    }
}
