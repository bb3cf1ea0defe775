// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use std::fmt::Formatter;
use std::path::PathBuf;
use std::time::Duration;

use election::config::{
    DEFAULT_EARLY_STOPPING_MIN_DELTA, DEFAULT_EARLY_STOPPING_PATIENCE,
    DEFAULT_MAX_ROUNDS, DEFAULT_ROTATION_DELAY_SECS,
    DEFAULT_ROTATION_INTERVAL, DEFAULT_ROTATION_MIN_ROUNDS,
};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone)]
pub struct Params {
    /// IP advertised to agents in welcome and rotation messages.
    pub advertise_ip: String,

    /// Participation handshake endpoint.
    pub reg_port: u16,

    /// Model-upload/polling/recall endpoint.
    pub recv_port: u16,

    /// Default agent push-listener port handed out in welcomes outside
    /// simulation mode.
    pub exch_port: u16,

    /// Directory endpoint.
    pub db_ip: String,
    pub db_port: u16,

    /// Polling mode; push mode when false.
    pub polling: bool,

    /// Minimum buffered updates a timed-out round still aggregates.
    pub aggregation_threshold: usize,

    /// How long the barrier waits for uploads.
    #[serde(with = "humantime_serde")]
    pub aggregation_timeout: Duration,

    /// Idle interval of the round loop.
    #[serde(with = "humantime_serde")]
    pub round_interval: Duration,

    /// Rotation cadence.
    pub rotation_min_rounds: u64,
    pub rotation_interval: u64,
    #[serde(with = "humantime_serde")]
    pub rotation_delay: Duration,

    /// Termination judges.
    pub max_rounds: u64,
    pub early_stopping_patience: u32,
    pub early_stopping_min_delta: f64,

    /// Where the round metrics CSV lands.
    pub metrics_dir: PathBuf,

    /// Node config file rewritten on demotion.
    pub config_path: PathBuf,

    /// Bound on concurrently served connections per listener.
    pub max_inflight: usize,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            advertise_ip: "127.0.0.1".into(),
            reg_port: 8765,
            recv_port: 4321,
            exch_port: 7890,
            db_ip: "127.0.0.1".into(),
            db_port: 9017,
            polling: true,
            aggregation_threshold: 1,
            aggregation_timeout: Duration::from_secs(30),
            round_interval: Duration::from_secs(5),
            rotation_min_rounds: DEFAULT_ROTATION_MIN_ROUNDS,
            rotation_interval: DEFAULT_ROTATION_INTERVAL,
            rotation_delay: Duration::from_secs(DEFAULT_ROTATION_DELAY_SECS),
            max_rounds: DEFAULT_MAX_ROUNDS,
            early_stopping_patience: DEFAULT_EARLY_STOPPING_PATIENCE,
            early_stopping_min_delta: DEFAULT_EARLY_STOPPING_MIN_DELTA,
            metrics_dir: PathBuf::from("./metrics"),
            config_path: PathBuf::from("./rotor.toml"),
            max_inflight: 64,
        }
    }
}

impl Params {
    pub fn db_addr(&self) -> String {
        format!("{}:{}", self.db_ip, self.db_port)
    }
}

impl std::fmt::Display for Params {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "advertise: {}, reg: {}, recv: {}, db: {}, polling: {}, \
             rotation every {} round(s), max_rounds: {}",
            self.advertise_ip,
            self.reg_port,
            self.recv_port,
            self.db_addr(),
            self.polling,
            self.rotation_interval,
            self.max_rounds
        )
    }
}
