// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use std::fmt::Formatter;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone)]
pub struct Params {
    pub agent_name: String,

    /// IP this agent advertises to the directory and the aggregator; the
    /// winner check during rotation compares against it.
    pub advertise_ip: String,

    /// Registration endpoint of the current aggregator.
    pub aggr_ip: String,
    pub reg_port: u16,

    /// Own push-listener port; 0 picks an ephemeral port.
    pub exch_port: u16,

    /// Directory endpoint.
    pub db_ip: String,
    pub db_port: u16,

    pub polling: bool,
    pub simulation: bool,

    /// Whether this agent's weights may seed the global model when it is
    /// the first participant.
    pub init_weights: bool,

    /// Discovery tuning.
    #[serde(with = "humantime_serde")]
    pub registration_grace_period: Duration,
    pub expected_num_agents: u32,
    pub election_min_agents: u32,

    /// Consecutive silent polls before the agent gives the aggregator up
    /// for dead and exits for re-discovery.
    pub max_polling_failures: u32,

    /// Cadence of the model-exchange loop.
    #[serde(with = "humantime_serde")]
    pub exchange_tick: Duration,

    pub metrics_dir: PathBuf,

    /// Node config file rewritten on role change.
    pub config_path: PathBuf,

    /// Bound on concurrently served push connections.
    pub max_inflight: usize,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            agent_name: "agent".into(),
            advertise_ip: "127.0.0.1".into(),
            aggr_ip: "127.0.0.1".into(),
            reg_port: 8765,
            exch_port: 0,
            db_ip: "127.0.0.1".into(),
            db_port: 9017,
            polling: true,
            simulation: false,
            init_weights: true,
            registration_grace_period: Duration::from_secs(30),
            expected_num_agents: 0,
            election_min_agents: 1,
            max_polling_failures: 6,
            exchange_tick: Duration::from_secs(5),
            metrics_dir: PathBuf::from("./metrics"),
            config_path: PathBuf::from("./rotor.toml"),
            max_inflight: 16,
        }
    }
}

impl Params {
    pub fn db_addr(&self) -> String {
        format!("{}:{}", self.db_ip, self.db_port)
    }

    pub fn reg_addr(&self) -> String {
        format!("{}:{}", self.aggr_ip, self.reg_port)
    }
}

impl std::fmt::Display for Params {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "name: {}, advertise: {}, aggregator: {}, db: {}, polling: {}",
            self.agent_name,
            self.advertise_ip,
            self.reg_addr(),
            self.db_addr(),
            self.polling
        )
    }
}
