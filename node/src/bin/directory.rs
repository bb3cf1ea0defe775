// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use clap::{Arg, ArgMatches, Command};
use rotor_node::conf::Config;
use rotor_node::directory::DirectorySrv;
use rotor_node::network::TcpChannel;
use rotor_node::{LongLivedService, Node};

pub fn main() -> anyhow::Result<()> {
    let args = args();
    let config = Config::from(&args);

    configure_log(&config)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(async {
            type Services = dyn LongLivedService<TcpChannel>;

            let srv =
                DirectorySrv::create_or_open(config.directory_params()).await?;
            let service_list: Vec<Box<Services>> = vec![Box::new(srv)];

            if let Err(e) =
                Node::new(TcpChannel::default()).spawn_all(service_list).await
            {
                tracing::error!("directory terminated with err: {}", e);
                Err(e)
            } else {
                Ok(())
            }
        })
}

fn args() -> ArgMatches {
    let command = Command::new("rotor-directory")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Rotor contributors.")
        .about("Rotor shared directory server.")
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

    let subscriber =
        tracing_subscriber::fmt::Subscriber::builder().with_max_level(log);

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
