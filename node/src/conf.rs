// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

//! Node configuration file and the persisted role token.
//!
//! The process is spawned by an external supervisor that only reads the
//! `role` key; the node itself rewrites that key (and the aggregator
//! address) when a rotation changes its role, then exits for respawn.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Agent,
    Aggregator,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Agent => "agent",
            Role::Aggregator => "aggregator",
        }
    }
}

/// Default log_level.
const DEFAULT_LOG_LEVEL: &str = "info";

/// Default log_type.
const DEFAULT_LOG_TYPE: &str = "coloured";

#[derive(Serialize, Deserialize, Clone, Default)]
pub struct Config {
    log_level: Option<String>,
    log_type: Option<String>,

    role: Option<Role>,
    agent_name: Option<String>,

    /// Advertised IP override; the detected interface IP is used when
    /// unset.
    device_ip: Option<String>,

    aggr_ip: Option<String>,
    reg_port: Option<u16>,
    recv_port: Option<u16>,
    exch_port: Option<u16>,

    db_ip: Option<String>,
    db_port: Option<u16>,

    polling: Option<bool>,
    simulation: Option<bool>,
    init_weights_flag: Option<bool>,

    aggregation_threshold: Option<usize>,
    #[serde(default, with = "humantime_serde::option")]
    aggregation_timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    round_interval: Option<Duration>,

    rotation_min_rounds: Option<u64>,
    rotation_interval: Option<u64>,
    #[serde(default, with = "humantime_serde::option")]
    rotation_delay: Option<Duration>,

    max_rounds: Option<u64>,
    early_stopping_patience: Option<u32>,
    early_stopping_min_delta: Option<f64>,

    #[serde(default, with = "humantime_serde::option")]
    registration_grace_period: Option<Duration>,
    expected_num_agents: Option<u32>,
    election_min_agents: Option<u32>,
    max_polling_failures: Option<u32>,

    agent_ttl_seconds: Option<u64>,

    db_data_path: Option<PathBuf>,
    db_model_path: Option<PathBuf>,
    metrics_dir: Option<PathBuf>,
}

impl From<&ArgMatches> for Config {
    fn from(matches: &ArgMatches) -> Self {
        let mut config = matches
            .get_one::<String>("config")
            .map_or(Config::default(), |conf_path| {
                let toml = std::fs::read_to_string(conf_path).unwrap();
                toml::from_str(&toml).unwrap()
            });

        // Overwrite config log-level
        if let Some(log_level) = matches.get_one::<String>("log-level") {
            config.log_level = Some(log_level.into());
        }

        // Overwrite config log-type
        if let Some(log_type) = matches.get_one::<String>("log-type") {
            config.log_type = Some(log_type.into());
        }

        // Overwrite the persisted role
        if let Some(role) = matches.get_one::<String>("role") {
            config.role = Some(match role.as_str() {
                "aggregator" => Role::Aggregator,
                _ => Role::Agent,
            });
        }

        config
    }
}

impl Config {
    pub fn inject_args(command: Command) -> Command {
        command
            .arg(
                Arg::new("log-level")
                    .long("log-level")
                    .value_name("LOG")
                    .value_parser(["error", "warn", "info", "debug", "trace"])
                    .help("Output log level"),
            )
            .arg(
                Arg::new("log-type")
                    .long("log-type")
                    .value_name("LOG_TYPE")
                    .value_parser(["coloured", "plain", "json"])
                    .help("Change the log format accordingly"),
            )
            .arg(
                Arg::new("role")
                    .long("role")
                    .value_name("ROLE")
                    .value_parser(["agent", "aggregator"])
                    .help(
                        "Role override; the persisted role applies when \
                         omitted",
                    ),
            )
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let toml = std::fs::read_to_string(path.as_ref()).with_context(
            || format!("cannot read config {:?}", path.as_ref()),
        )?;
        Ok(toml::from_str(&toml)?)
    }

    pub fn role(&self) -> Role {
        self.role.unwrap_or_default()
    }

    pub fn log_type(&self) -> String {
        match &self.log_type {
            None => DEFAULT_LOG_TYPE.into(),
            Some(log_type) => log_type.into(),
        }
    }

    pub fn log_level(&self) -> tracing::Level {
        let log_level = match &self.log_level {
            None => DEFAULT_LOG_LEVEL,
            Some(log_level) => log_level,
        };
        log_level.parse().unwrap_or_else(|e| {
            panic!("Invalid log-level specified '{log_level}' - {e}")
        })
    }

    pub fn agent_name(&self) -> String {
        self.agent_name.clone().unwrap_or_else(|| "agent".into())
    }

    pub fn device_ip(&self) -> Option<String> {
        // A placeholder left by templated deployments counts as unset.
        self.device_ip
            .clone()
            .filter(|ip| !ip.is_empty() && ip != "CHANGE_ME")
    }

    pub fn aggr_ip(&self) -> String {
        self.aggr_ip.clone().unwrap_or_else(|| "127.0.0.1".into())
    }

    pub fn reg_port(&self) -> u16 {
        self.reg_port.unwrap_or(8765)
    }

    pub fn recv_port(&self) -> u16 {
        self.recv_port.unwrap_or(4321)
    }

    pub fn exch_port(&self) -> u16 {
        self.exch_port.unwrap_or(7890)
    }

    pub fn db_ip(&self) -> String {
        self.db_ip.clone().unwrap_or_else(|| "127.0.0.1".into())
    }

    pub fn db_port(&self) -> u16 {
        self.db_port.unwrap_or(9017)
    }

    pub fn polling(&self) -> bool {
        self.polling.unwrap_or(true)
    }

    pub fn simulation(&self) -> bool {
        self.simulation.unwrap_or(false)
    }

    pub fn init_weights_flag(&self) -> bool {
        self.init_weights_flag.unwrap_or(true)
    }

    pub fn registration_grace_period(&self) -> Duration {
        self.registration_grace_period
            .unwrap_or(Duration::from_secs(30))
    }

    pub fn expected_num_agents(&self) -> u32 {
        self.expected_num_agents.unwrap_or(0)
    }

    pub fn election_min_agents(&self) -> u32 {
        self.election_min_agents.unwrap_or(1)
    }

    pub fn max_polling_failures(&self) -> u32 {
        self.max_polling_failures.unwrap_or(6)
    }

    pub fn agent_ttl(&self) -> Duration {
        Duration::from_secs(self.agent_ttl_seconds.unwrap_or(300))
    }

    pub fn metrics_dir(&self) -> PathBuf {
        self.metrics_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("./metrics"))
    }

    pub fn aggregator_params(
        &self,
        config_path: PathBuf,
        advertise_ip: String,
    ) -> crate::aggregator::conf::Params {
        let defaults = crate::aggregator::conf::Params::default();
        crate::aggregator::conf::Params {
            advertise_ip,
            reg_port: self.reg_port(),
            recv_port: self.recv_port(),
            exch_port: self.exch_port(),
            db_ip: self.db_ip(),
            db_port: self.db_port(),
            polling: self.polling(),
            aggregation_threshold: self
                .aggregation_threshold
                .unwrap_or(defaults.aggregation_threshold),
            aggregation_timeout: self
                .aggregation_timeout
                .unwrap_or(defaults.aggregation_timeout),
            round_interval: self
                .round_interval
                .unwrap_or(defaults.round_interval),
            rotation_min_rounds: self
                .rotation_min_rounds
                .unwrap_or(defaults.rotation_min_rounds),
            rotation_interval: self
                .rotation_interval
                .unwrap_or(defaults.rotation_interval),
            rotation_delay: self
                .rotation_delay
                .unwrap_or(defaults.rotation_delay),
            max_rounds: self.max_rounds.unwrap_or(defaults.max_rounds),
            early_stopping_patience: self
                .early_stopping_patience
                .unwrap_or(defaults.early_stopping_patience),
            early_stopping_min_delta: self
                .early_stopping_min_delta
                .unwrap_or(defaults.early_stopping_min_delta),
            metrics_dir: self.metrics_dir(),
            config_path,
            max_inflight: defaults.max_inflight,
        }
    }

    pub fn agent_params(
        &self,
        config_path: PathBuf,
        advertise_ip: String,
    ) -> crate::agent::conf::Params {
        let defaults = crate::agent::conf::Params::default();
        crate::agent::conf::Params {
            agent_name: self.agent_name(),
            advertise_ip,
            aggr_ip: self.aggr_ip(),
            reg_port: self.reg_port(),
            exch_port: self.exch_port(),
            db_ip: self.db_ip(),
            db_port: self.db_port(),
            polling: self.polling(),
            simulation: self.simulation(),
            init_weights: self.init_weights_flag(),
            registration_grace_period: self.registration_grace_period(),
            expected_num_agents: self.expected_num_agents(),
            election_min_agents: self.election_min_agents(),
            max_polling_failures: self.max_polling_failures(),
            metrics_dir: self.metrics_dir(),
            config_path,
            exchange_tick: defaults.exchange_tick,
            max_inflight: defaults.max_inflight,
        }
    }

    pub fn directory_params(&self) -> crate::directory::conf::Params {
        let defaults = crate::directory::conf::Params::default();
        crate::directory::conf::Params {
            listen_ip: "0.0.0.0".into(),
            listen_port: self.db_port(),
            data_path: self
                .db_data_path
                .clone()
                .unwrap_or(defaults.data_path),
            model_path: self
                .db_model_path
                .clone()
                .unwrap_or(defaults.model_path),
            agent_ttl: self.agent_ttl(),
            max_inflight: defaults.max_inflight,
        }
    }
}

/// Rewrites the role token (and, when given, the aggregator address) in the
/// node config, preserving every other key in the file.
pub fn persist_role(
    path: &Path,
    role: Role,
    aggr_ip: Option<&str>,
) -> Result<()> {
    let mut table: toml::Table = match std::fs::read_to_string(path) {
        Ok(content) => toml::from_str(&content)?,
        Err(_) => toml::Table::new(),
    };

    table.insert("role".into(), toml::Value::String(role.as_str().into()));
    if let Some(ip) = aggr_ip {
        table.insert("aggr_ip".into(), toml::Value::String(ip.into()));
    }

    std::fs::write(path, toml::to_string(&table)?)
        .with_context(|| format!("cannot persist role to {path:?}"))?;

    Ok(())
}

/// Persists the new role and terminates the process so the external
/// spawner can restart it under the proper entry point.
pub fn request_role_change(path: &Path, role: Role, aggr_ip: Option<&str>) -> ! {
    if let Err(e) = persist_role(path, role, aggr_ip) {
        error!(event = "role_persist_failed", err = %e);
    }

    info!(event = "role_change", role = role.as_str());
    std::process::exit(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persist_role_keeps_other_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rotor.toml");
        std::fs::write(&path, "db_ip = \"10.0.0.2\"\nrole = \"aggregator\"\n")
            .unwrap();

        persist_role(&path, Role::Agent, Some("10.0.0.9")).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.role(), Role::Agent);
        assert_eq!(config.aggr_ip(), "10.0.0.9");
        assert_eq!(config.db_ip(), "10.0.0.2");
    }

    #[test]
    fn placeholder_device_ip_counts_as_unset() {
        let config: Config =
            toml::from_str("device_ip = \"CHANGE_ME\"").unwrap();
        assert_eq!(config.device_ip(), None);

        let config: Config = toml::from_str("device_ip = \"10.1.2.3\"").unwrap();
        assert_eq!(config.device_ip(), Some("10.1.2.3".into()));
    }

    #[test]
    fn durations_accept_humantime() {
        let config: Config = toml::from_str(
            "aggregation_timeout = \"30s\"\nregistration_grace_period = \"1m\"",
        )
        .unwrap();

        assert_eq!(
            config.aggregation_timeout,
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            config.registration_grace_period(),
            Duration::from_secs(60)
        );
    }
}
