use serde::{Deserialize, Serialize};

use crate::plan::Plan;

/// Running count, mean and spread of a series of observations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    count: usize,
    sum: f64,
    sum2: f64,
    min: f64,
    max: f64,
}

impl Default for Summary {
    fn default() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            sum2: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

impl Summary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.sum2 += value * value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// Zero when empty.
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// Sample standard deviation; zero with fewer than two observations.
    pub fn std_dev(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        let n = self.count as f64;
        ((self.sum2 - self.sum * self.sum / n) / (n - 1.0)).max(0.0).sqrt()
    }

    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }
}

impl Extend<f64> for Summary {
    fn extend<I: IntoIterator<Item = f64>>(&mut self, iter: I) {
        for value in iter {
            self.push(value);
        }
    }
}

/// Per partition, how many plans covered each sample position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Coverage {
    slots: Vec<Vec<u32>>,
}

impl Coverage {
    /// `sizes[p]` is the sample count of partition `p`, zero when unconfigured.
    pub fn new(sizes: &[usize]) -> Self {
        Self {
            slots: sizes.iter().map(|&size| vec![0; size]).collect(),
        }
    }

    /// Count every position a plan selects.
    ///
    /// # Panics
    ///
    /// Panics if the plan selects positions outside a partition.
    pub fn record(&mut self, plan: &Plan) {
        for (partition, selection) in plan.iter() {
            let counts = &mut self.slots[partition];
            for range in selection {
                for count in &mut counts[range.offset..range.end()] {
                    *count += 1;
                }
            }
        }
    }

    pub fn partition(&self, partition: usize) -> &[u32] {
        &self.slots[partition]
    }

    /// Non-zero counts in partition then position order.
    pub fn nonzero(&self) -> impl Iterator<Item = u32> + '_ {
        self.slots
            .iter()
            .flat_map(|counts| counts.iter().copied())
            .filter(|&count| count != 0)
    }
}
