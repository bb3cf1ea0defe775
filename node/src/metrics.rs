// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

//! Per-round CSV metrics sinks.
//!
//! One file per process run, headers written on creation. The in-process
//! `metrics` facade counters live next to the code they count; this module
//! only owns the CSV artifacts the operators consume.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{Local, SecondsFormat, Utc};

/// A sink accepting one row of already-formatted fields.
pub trait MetricsSink: Send + 'static {
    fn append_row(&mut self, fields: &[String]) -> Result<()>;
}

/// CSV file sink. Fields are joined with commas; none of the emitted values
/// contain separators.
pub struct CsvSink {
    path: PathBuf,
    file: File,
}

impl CsvSink {
    pub fn create<P: AsRef<Path>>(
        dir: P,
        name: &str,
        headers: &[&str],
    ) -> Result<Self> {
        std::fs::create_dir_all(dir.as_ref())?;

        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let path = dir.as_ref().join(format!("metrics_{name}_{stamp}.csv"));

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        writeln!(file, "{}", headers.join(","))?;

        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricsSink for CsvSink {
    fn append_row(&mut self, fields: &[String]) -> Result<()> {
        writeln!(self.file, "{}", fields.join(","))?;
        self.file.flush()?;
        Ok(())
    }
}

fn fmt_opt(v: Option<f64>) -> String {
    v.map(|v| format!("{v:.6}")).unwrap_or_default()
}

/// One aggregator round worth of metrics.
#[derive(Debug, Default, Clone)]
pub struct AggregatorRound {
    pub round: u64,
    pub num_agents: usize,
    pub global_recall: Option<f64>,
    pub aggregation_time_secs: f64,
    pub models_received: u32,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub rounds_without_improvement: u32,
    pub best_recall: Option<f64>,
}

/// Aggregator-side round log with cumulative totals.
pub struct AggregatorMetrics<S: MetricsSink = CsvSink> {
    sink: S,
    cumulative_models: u64,
    cumulative_bytes_received: u64,
    cumulative_bytes_sent: u64,
}

const AGGREGATOR_HEADERS: &[&str] = &[
    "timestamp",
    "round",
    "num_agents",
    "global_recall",
    "aggregation_time",
    "total_models_received",
    "total_bytes_received",
    "total_bytes_sent",
    "rounds_without_improvement",
    "best_recall",
];

impl AggregatorMetrics<CsvSink> {
    pub fn create<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let sink = CsvSink::create(dir, "aggregator", AGGREGATOR_HEADERS)?;
        tracing::info!(event = "metrics_csv", path = %sink.path().display());
        Ok(Self::with_sink(sink))
    }
}

impl<S: MetricsSink> AggregatorMetrics<S> {
    pub fn with_sink(sink: S) -> Self {
        Self {
            sink,
            cumulative_models: 0,
            cumulative_bytes_received: 0,
            cumulative_bytes_sent: 0,
        }
    }

    pub fn log_round(&mut self, row: &AggregatorRound) -> Result<()> {
        self.cumulative_models += row.models_received as u64;
        self.cumulative_bytes_received += row.bytes_received;
        self.cumulative_bytes_sent += row.bytes_sent;

        self.sink.append_row(&[
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            row.round.to_string(),
            row.num_agents.to_string(),
            fmt_opt(row.global_recall),
            format!("{:.4}", row.aggregation_time_secs),
            self.cumulative_models.to_string(),
            self.cumulative_bytes_received.to_string(),
            self.cumulative_bytes_sent.to_string(),
            row.rounds_without_improvement.to_string(),
            fmt_opt(row.best_recall),
        ])
    }
}

/// One agent round worth of metrics.
#[derive(Debug, Default, Clone)]
pub struct AgentRound {
    pub round: u64,
    pub global_accuracy: Option<f64>,
    pub local_accuracy: Option<f64>,
    pub num_messages: u32,
    pub bytes_global: u64,
    pub bytes_local: u64,
    pub wait_global_secs: f64,
    pub round_time_secs: f64,
}

const AGENT_HEADERS: &[&str] = &[
    "timestamp",
    "round",
    "global_accuracy",
    "local_accuracy",
    "num_messages",
    "bytes_global",
    "bytes_local",
    "bytes_round_total",
    "bytes_cumulative",
    "latency_wait_global",
    "round_time",
];

/// Agent-side round log with a cumulative byte counter.
pub struct AgentMetrics<S: MetricsSink = CsvSink> {
    sink: S,
    cumulative_bytes: u64,
}

impl AgentMetrics<CsvSink> {
    pub fn create<P: AsRef<Path>>(dir: P, agent_name: &str) -> Result<Self> {
        let sink = CsvSink::create(dir, agent_name, AGENT_HEADERS)?;
        tracing::info!(event = "metrics_csv", path = %sink.path().display());
        Ok(Self::with_sink(sink))
    }
}

impl<S: MetricsSink> AgentMetrics<S> {
    pub fn with_sink(sink: S) -> Self {
        Self {
            sink,
            cumulative_bytes: 0,
        }
    }

    pub fn log_round(&mut self, row: &AgentRound) -> Result<()> {
        let round_total = row.bytes_global + row.bytes_local;
        self.cumulative_bytes += round_total;

        self.sink.append_row(&[
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            row.round.to_string(),
            fmt_opt(row.global_accuracy),
            fmt_opt(row.local_accuracy),
            row.num_messages.to_string(),
            row.bytes_global.to_string(),
            row.bytes_local.to_string(),
            round_total.to_string(),
            self.cumulative_bytes.to_string(),
            format!("{:.4}", row.wait_global_secs),
            format!("{:.4}", row.round_time_secs),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct VecSink(Vec<Vec<String>>);

    impl MetricsSink for VecSink {
        fn append_row(&mut self, fields: &[String]) -> Result<()> {
            self.0.push(fields.to_vec());
            Ok(())
        }
    }

    #[test]
    fn aggregator_rows_accumulate() {
        let mut log = AggregatorMetrics::with_sink(VecSink::default());

        log.log_round(&AggregatorRound {
            round: 1,
            num_agents: 3,
            models_received: 3,
            bytes_received: 100,
            bytes_sent: 50,
            ..Default::default()
        })
        .unwrap();
        log.log_round(&AggregatorRound {
            round: 2,
            num_agents: 3,
            models_received: 2,
            bytes_received: 80,
            bytes_sent: 40,
            global_recall: Some(0.75),
            ..Default::default()
        })
        .unwrap();

        let rows = &log.sink.0;
        assert_eq!(rows.len(), 2);
        // cumulative models and bytes
        assert_eq!(rows[1][5], "5");
        assert_eq!(rows[1][6], "180");
        assert_eq!(rows[1][7], "90");
        assert_eq!(rows[1][3], "0.750000");
        // no recall in round 1 leaves the field empty
        assert_eq!(rows[0][3], "");
    }

    #[test]
    fn csv_file_gets_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = AgentMetrics::create(dir.path(), "agent_a").unwrap();

        log.log_round(&AgentRound {
            round: 1,
            bytes_global: 10,
            bytes_local: 5,
            ..Default::default()
        })
        .unwrap();

        let content = std::fs::read_to_string(log.sink.path()).unwrap();
        let mut lines = content.lines();
        assert!(lines.next().unwrap().starts_with("timestamp,round,"));
        let row = lines.next().unwrap();
        assert!(row.contains(",15,")); // round total
    }
}
