/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::reduce::{reduce_file, Column, ReducedStat, Reduction};
use anyhow::Context;
use colored::Colorize;
use itertools::Itertools;
use serde::Serialize;
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use term_table::{row::Row, table_cell::TableCell, Table, TableStyle};
use tracing::warn;

/// A labelled pair of result logs, written on the command line as `LABEL=LAT_LOG,RPS_LOG`.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesSpec {
    pub label: String,
    pub latency_log: PathBuf,
    pub throughput_log: PathBuf,
}
impl FromStr for SeriesSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (label, logs) = s
            .split_once('=')
            .ok_or_else(|| format!("expected LABEL=LAT_LOG,RPS_LOG, found {s:?}"))?;
        let (latency_log, throughput_log) = logs
            .split_once(',')
            .ok_or_else(|| format!("expected two comma separated logs, found {logs:?}"))?;

        let (label, latency_log, throughput_log) =
            (label.trim(), latency_log.trim(), throughput_log.trim());
        if label.is_empty() || latency_log.is_empty() || throughput_log.is_empty() {
            return Err(format!("label and both logs are required, found {s:?}"));
        }

        Ok(Self {
            label: label.to_string(),
            latency_log: PathBuf::from(latency_log),
            throughput_log: PathBuf::from(throughput_log),
        })
    }
}

/// Reduced statistics of one log, ready for plotting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesStats {
    pub means: Vec<f64>,
    pub std_devs: Vec<f64>,
    pub waits_us: Vec<Option<u64>>,
    pub aligned: Vec<Option<ReducedStat>>,
}
impl From<&Reduction> for SeriesStats {
    fn from(reduction: &Reduction) -> Self {
        Self {
            means: reduction.means(),
            std_devs: reduction.std_devs(),
            waits_us: reduction.waits_us(),
            aligned: reduction.aligned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Series {
    pub label: String,
    pub latency: SeriesStats,
    pub throughput: SeriesStats,
}

/// Reduces the latency column of the latency log and the throughput column of the throughput
/// log. A pair whose logs are both missing is skipped; a pair with only one log is an error.
pub fn reduce_pair(spec: &SeriesSpec) -> anyhow::Result<Option<Series>> {
    if !spec.latency_log.exists() && !spec.throughput_log.exists() {
        warn!(
            "Skipping {}: neither {} nor {} exists",
            spec.label,
            spec.latency_log.display(),
            spec.throughput_log.display()
        );
        return Ok(None);
    }

    let latency = reduce_file(&spec.latency_log, Column::Latency)?;
    let throughput = reduce_file(&spec.throughput_log, Column::Throughput)?;
    Ok(Some(Series {
        label: spec.label.clone(),
        latency: SeriesStats::from(&latency),
        throughput: SeriesStats::from(&throughput),
    }))
}

fn format_stat(stat: Option<&Option<ReducedStat>>) -> String {
    match stat {
        Some(Some(stat)) => format!("{:.3} ± {:.3}", stat.mean, stat.std_dev),
        _ => "--".to_string(),
    }
}

/// Renders one row per sweep point and series. Missing segments show as `--`.
pub fn render_table(series: &[Series]) -> String {
    let mut rows = vec![Row::new(vec![
        TableCell::new("Series".bold()),
        TableCell::new("Wait (us)".bold()),
        TableCell::new("Throughput".bold()),
        TableCell::new("Latency".bold()),
    ])];

    for series in series {
        let points = series.latency.aligned.len().max(series.throughput.aligned.len());
        for i in 0..points {
            let wait = series
                .throughput
                .waits_us
                .get(i)
                .or_else(|| series.latency.waits_us.get(i))
                .copied()
                .flatten()
                .map(|wait| wait.to_string())
                .unwrap_or_else(|| "?".to_string());

            rows.push(Row::new(vec![
                TableCell::new(&series.label),
                TableCell::new(wait),
                TableCell::new(format_stat(series.throughput.aligned.get(i))),
                TableCell::new(format_stat(series.latency.aligned.get(i))),
            ]));
        }
    }

    Table::builder()
        .rows(rows)
        .style(TableStyle::rounded())
        .build()
        .render()
}

pub fn write_json(path: &Path, series: &[Series]) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(series)?;
    fs::write(path, json).context(format!("Unable to write {}", path.display()))?;
    println!(
        "> exported {} to {}",
        series.iter().map(|series| series.label.as_str()).join(", ").green(),
        path.display()
    );
    Ok(())
}
