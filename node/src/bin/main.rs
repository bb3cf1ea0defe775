// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Arg, ArgMatches, Command};
use rotor_node::agent::AgentSrv;
use rotor_node::aggregator::AggregatorSrv;
use rotor_node::conf::{Config, Role};
use rotor_node::network::{detect_local_ip, TcpChannel};
use rotor_node::trainer::{EchoTrainer, MeanAggregate};
use rotor_node::{LongLivedService, Node};

pub fn main() -> anyhow::Result<()> {
    let args = args();
    let config = Config::from(&args);

    configure_log(&config)?;

    // The role-change path rewrites this file on rotation hand-off.
    let config_path = args
        .get_one::<String>("config")
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);

    let advertise_ip = config.device_ip().unwrap_or_else(detect_local_ip);
    tracing::info!(
        event = "node_starting",
        role = config.role().as_str(),
        ip = %advertise_ip
    );

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(async {
            // The transport layer is the one-shot TCP request/reply channel.
            type Services = dyn LongLivedService<TcpChannel>;

            // The bring-up collaborators are injected here; an embedding ML
            // application constructs the services with its own trainer and
            // aggregation callback instead.
            let service: Box<Services> = match config.role() {
                Role::Aggregator => Box::new(AggregatorSrv::new(
                    config.aggregator_params(
                        config_path.clone(),
                        advertise_ip.clone(),
                    ),
                    Arc::new(MeanAggregate),
                )?),
                Role::Agent => Box::new(AgentSrv::new(
                    config
                        .agent_params(config_path.clone(), advertise_ip.clone()),
                    Arc::new(EchoTrainer::default()),
                )?),
            };

            // node spawn_all is the entry point
            if let Err(e) =
                Node::new(TcpChannel::default()).spawn_all(vec![service]).await
            {
                tracing::error!("node terminated with err: {}", e);
                Err(e)
            } else {
                Ok(())
            }
        })
}

fn default_config_path() -> PathBuf {
    let mut path = dirs::home_dir().expect("OS not supported");
    path.push(".rotor");
    path.push("rotor.toml");
    path
}

fn args() -> ArgMatches {
    let command = Command::new("rotor")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Rotor contributors.")
        .about("Rotor federated-learning node.")
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .value_name("CONFIG_TOML")
                .help("Configuration file path")
                .required(false),
        );

    let command = Config::inject_args(command);
    command.get_matches()
}

fn configure_log(config: &Config) -> anyhow::Result<()> {
    let log = config.log_level();

    // Generate a subscriber with the desired log level.
    let subscriber =
        tracing_subscriber::fmt::Subscriber::builder().with_max_level(log);

    // Set the subscriber as global.
    // so this subscriber will be used as the default in all threads for the
    // remainder of the duration of the program, similar to how `loggers`
    // work in the `log` crate.
    match config.log_type().as_str() {
        "json" => {
            let subscriber = subscriber.json().flatten_event(true).finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        "plain" => {
            let subscriber = subscriber.with_ansi(false).finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        "coloured" => {
            let subscriber = subscriber.finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        _ => unreachable!(),
    };

    Ok(())
}
