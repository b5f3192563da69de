/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    errors::HarnessError,
    result_log::{parse_wait_marker, END, START, WAIT_MARKER},
};
use anyhow::Context;
use regex::Regex;
use serde::Serialize;
use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};
use tracing::warn;

/// A sample value: signed decimals and scientific notation are matched whole so that they are
/// either read correctly or rejected, never split into unrelated numbers.
const DECIMAL_PATTERN: &str = r"[-+]?\d+(?:\.\d+)?(?:[eE][-+]?\d+)?";

/// Which of the two values on a data line is reduced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    Throughput,
    Latency,
}
impl Column {
    fn index(self) -> usize {
        match self {
            Column::Throughput => 0,
            Column::Latency => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ReducedStat {
    pub mean: f64,
    pub std_dev: f64,
}
impl ReducedStat {
    /// Mean and population standard deviation. `None` for an empty sample set.
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }

        let n = samples.len() as f64;
        let mean = samples.iter().sum::<f64>() / n;
        let variance = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        Some(Self {
            mean,
            std_dev: variance.sqrt(),
        })
    }
}

/// One closed segment of a result log.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// False for samples written before the first `wait with` marker.
    pub marked: bool,
    /// The wait interval read from the marker, if it could be read.
    pub wait_us: Option<u64>,
    pub samples: usize,
    pub stat: Option<ReducedStat>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Reduction {
    pub segments: Vec<Segment>,
}
impl Reduction {
    /// Statistics of the non-empty segments, in log order.
    pub fn present(&self) -> Vec<ReducedStat> {
        self.segments.iter().filter_map(|segment| segment.stat).collect()
    }

    pub fn means(&self) -> Vec<f64> {
        self.present().iter().map(|stat| stat.mean).collect()
    }

    pub fn std_devs(&self) -> Vec<f64> {
        self.present().iter().map(|stat| stat.std_dev).collect()
    }

    /// One slot per `wait with` marker, `None` where the segment received no samples. Unlike
    /// [`Reduction::present`] the slots stay aligned with the sweep points.
    pub fn aligned(&self) -> Vec<Option<ReducedStat>> {
        self.segments
            .iter()
            .filter(|segment| segment.marked)
            .map(|segment| segment.stat)
            .collect()
    }

    /// Wait intervals of the marker-opened segments, in the same order as [`Reduction::aligned`].
    pub fn waits_us(&self) -> Vec<Option<u64>> {
        self.segments
            .iter()
            .filter(|segment| segment.marked)
            .map(|segment| segment.wait_us)
            .collect()
    }
}

struct Accumulator {
    marked: bool,
    wait_us: Option<u64>,
    samples: Vec<f64>,
}
impl Accumulator {
    fn close(self) -> Option<Segment> {
        // a preamble without samples is not a segment
        if !self.marked && self.samples.is_empty() {
            return None;
        }
        Some(Segment {
            marked: self.marked,
            wait_us: self.wait_us,
            samples: self.samples.len(),
            stat: ReducedStat::from_samples(&self.samples),
        })
    }
}

/// Reduces a result log in a single forward pass. Only the samples of the segment being read are
/// held in memory.
pub fn reduce<R: BufRead>(reader: R, column: Column) -> anyhow::Result<Reduction> {
    let decimal = Regex::new(DECIMAL_PATTERN).context("Invalid sample pattern")?;
    let mut reduction = Reduction::default();
    let mut current: Option<Accumulator> = None;

    for (index, line) in reader.lines().enumerate() {
        let line = line.context("Unable to read result log")?;
        let trimmed = line.trim();

        if trimmed.is_empty() {
            continue;
        } else if line.contains(WAIT_MARKER) {
            if let Some(segment) = current.take().and_then(Accumulator::close) {
                reduction.segments.push(segment);
            }
            let wait_us = parse_wait_marker(trimmed);
            if wait_us.is_none() {
                warn!("Unreadable wait interval on line {}: {:?}", index + 1, trimmed);
            }
            current = Some(Accumulator {
                marked: true,
                wait_us,
                samples: vec![],
            });
        } else if trimmed == END {
            if let Some(segment) = current.take().and_then(Accumulator::close) {
                reduction.segments.push(segment);
            }
        } else if line.contains(START) {
            continue;
        } else {
            let value = parse_sample(&decimal, trimmed, column).ok_or_else(|| HarnessError::ParseAnomaly {
                line: index + 1,
                content: trimmed.to_string(),
            })?;
            current
                .get_or_insert_with(|| Accumulator {
                    marked: false,
                    wait_us: None,
                    samples: vec![],
                })
                .samples
                .push(value);
        }
    }

    if let Some(unterminated) = current {
        warn!(
            "Result log ends without `{}`, discarding {} trailing sample(s)",
            END,
            unterminated.samples.len()
        );
    }

    Ok(reduction)
}

pub fn reduce_file(path: &Path, column: Column) -> anyhow::Result<Reduction> {
    let file = File::open(path).context(format!("Unable to open result log {}", path.display()))?;
    reduce(BufReader::new(file), column).context(format!("Unable to reduce {}", path.display()))
}

/// Extracts the first two decimal values of a data line and returns the selected one. Negative
/// or non-finite values make the line malformed.
fn parse_sample(decimal: &Regex, line: &str, column: Column) -> Option<f64> {
    let values = decimal
        .find_iter(line)
        .take(2)
        .map(|m| m.as_str().parse::<f64>().ok().filter(|v| v.is_finite() && *v >= 0.0))
        .collect::<Option<Vec<_>>>()?;

    if values.len() < 2 {
        return None;
    }
    values.get(column.index()).copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const SCENARIO: &str =
        "wait with 0us\n240.954 2.1\n240.677 2.0\nwait with 100us\n140.954 4.1\nend\n";

    fn reduce_str(log: &str, column: Column) -> anyhow::Result<Reduction> {
        reduce(Cursor::new(log), column)
    }

    fn assert_close(actual: &[f64], expected: &[f64]) {
        assert_eq!(actual.len(), expected.len(), "{actual:?} != {expected:?}");
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1e-9, "{actual:?} != {expected:?}");
        }
    }

    #[test]
    fn latency_column_of_the_reference_log() -> anyhow::Result<()> {
        let reduction = reduce_str(SCENARIO, Column::Latency)?;
        assert_close(&reduction.means(), &[2.05, 4.1]);
        assert_close(&reduction.std_devs(), &[0.05, 0.0]);
        assert_eq!(reduction.waits_us(), vec![Some(0), Some(100)]);
        Ok(())
    }

    #[test]
    fn throughput_column_of_the_reference_log() -> anyhow::Result<()> {
        let reduction = reduce_str(SCENARIO, Column::Throughput)?;
        assert_close(&reduction.means(), &[240.8155, 140.954]);
        assert_close(&reduction.std_devs(), &[0.1385, 0.0]);
        Ok(())
    }

    #[test]
    fn one_stat_per_segment() -> anyhow::Result<()> {
        let mut log = String::from("start\n");
        for (k, wait) in [0, 2500, 5000, 10000].iter().enumerate() {
            log.push_str(&format!("wait with {wait}us\n"));
            for m in 0..5 {
                log.push_str(&format!("{}.0 {}.5\n", 100 * (k + 1) + m, k));
            }
        }
        log.push_str("end\n");

        let reduction = reduce_str(&log, Column::Throughput)?;
        assert_close(&reduction.means(), &[102.0, 202.0, 302.0, 402.0]);
        assert_eq!(reduction.std_devs().len(), 4);
        assert!(reduction.segments.iter().all(|segment| segment.samples == 5));

        let latency = reduce_str(&log, Column::Latency)?;
        assert_close(&latency.means(), &[0.5, 1.5, 2.5, 3.5]);
        assert_close(&latency.std_devs(), &[0.0, 0.0, 0.0, 0.0]);
        Ok(())
    }

    #[test]
    fn reducing_twice_is_identical() -> anyhow::Result<()> {
        assert_eq!(
            reduce_str(SCENARIO, Column::Latency)?,
            reduce_str(SCENARIO, Column::Latency)?
        );
        Ok(())
    }

    #[test]
    fn start_and_end_only_is_empty() -> anyhow::Result<()> {
        let reduction = reduce_str("start\nend\n", Column::Latency)?;
        assert!(reduction.means().is_empty());
        assert!(reduction.std_devs().is_empty());
        assert!(reduction.aligned().is_empty());
        Ok(())
    }

    #[test]
    fn single_sample_has_no_deviation() -> anyhow::Result<()> {
        let reduction = reduce_str("start\nwait with 0us\n3.5 7.25\nend\n", Column::Latency)?;
        assert_close(&reduction.means(), &[7.25]);
        assert_close(&reduction.std_devs(), &[0.0]);
        Ok(())
    }

    #[test]
    fn empty_segments_shrink_the_compact_series_but_keep_their_slot() -> anyhow::Result<()> {
        let log = "start\nwait with 0us\n1.0 2.0\nwait with 100us\nwait with 200us\n3.0 4.0\nend\n";
        let reduction = reduce_str(log, Column::Latency)?;

        // closed non-empty segments = sweep points - empty segments
        assert_close(&reduction.means(), &[2.0, 4.0]);

        let aligned = reduction.aligned();
        assert_eq!(aligned.len(), 3);
        assert_eq!(aligned[1], None);
        assert_eq!(aligned[2].map(|stat| stat.mean), Some(4.0));
        assert_eq!(reduction.waits_us(), vec![Some(0), Some(100), Some(200)]);
        Ok(())
    }

    #[test]
    fn tolerates_whitespace_and_blank_lines() -> anyhow::Result<()> {
        let log = "start\n\nwait with 0us   \n  240.954\t2.1   \n\n240.677     2.0\r\nend  \n";
        let reduction = reduce_str(log, Column::Latency)?;
        assert_close(&reduction.means(), &[2.05]);
        Ok(())
    }

    #[test]
    fn values_may_be_separated_by_any_non_digits() -> anyhow::Result<()> {
        let reduction = reduce_str("wait with 0us\n240 ops/s, 2.5 ms\nend\n", Column::Latency)?;
        assert_close(&reduction.means(), &[2.5]);
        Ok(())
    }

    #[test]
    fn samples_before_the_first_marker_form_an_unlabelled_segment() -> anyhow::Result<()> {
        let log = "start\n10.0 1.0\nwait with 0us\n20.0 2.0\nend\n";
        let reduction = reduce_str(log, Column::Throughput)?;
        assert_close(&reduction.means(), &[10.0, 20.0]);
        assert_eq!(reduction.aligned().len(), 1);
        assert!(!reduction.segments[0].marked);
        Ok(())
    }

    #[test]
    fn unterminated_segment_is_discarded() -> anyhow::Result<()> {
        let log = "start\nwait with 0us\n1.0 2.0\nwait with 100us\n3.0 4.0\n";
        let reduction = reduce_str(log, Column::Latency)?;
        assert_close(&reduction.means(), &[2.0]);
        Ok(())
    }

    #[test]
    fn malformed_line_is_reported_with_its_position() {
        let err = reduce_str("start\nwait with 0us\n1.0 2.0\nconnection refused\nend\n", Column::Latency)
            .expect_err("malformed line should fail");
        match err.downcast_ref::<HarnessError>() {
            Some(HarnessError::ParseAnomaly { line, content }) => {
                assert_eq!(*line, 4);
                assert_eq!(content, "connection refused");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn scientific_notation_is_read_whole() -> anyhow::Result<()> {
        let reduction = reduce_str("wait with 0us\n1.2e+03 4\n1.0E3 2e0\nend\n", Column::Throughput)?;
        assert_close(&reduction.means(), &[1100.0]);
        let reduction = reduce_str("wait with 0us\n1.2e+03 4\n1.0E3 2e0\nend\n", Column::Latency)?;
        assert_close(&reduction.means(), &[3.0]);
        Ok(())
    }

    #[test]
    fn negative_or_overflowing_values_are_malformed() {
        for line in ["240.9 -2.1", "-240.9 2.1", "1e999 2.0"] {
            let log = format!("wait with 0us\n{line}\nend\n");
            let err = reduce_str(&log, Column::Latency).expect_err("value should be rejected");
            match err.downcast_ref::<HarnessError>() {
                Some(HarnessError::ParseAnomaly { line: number, content }) => {
                    assert_eq!(*number, 2);
                    assert_eq!(content, line);
                }
                other => panic!("unexpected error {:?}", other),
            }
        }
    }

    #[test]
    fn a_single_value_is_malformed() {
        assert!(reduce_str("wait with 0us\n42\nend\n", Column::Throughput).is_err());
    }

    #[test]
    fn reduces_files() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("lat_res3");
        std::fs::write(&path, SCENARIO)?;
        let reduction = reduce_file(&path, Column::Latency)?;
        assert_close(&reduction.means(), &[2.05, 4.1]);

        assert!(reduce_file(&dir.path().join("missing"), Column::Latency).is_err());
        Ok(())
    }
}
