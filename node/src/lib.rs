// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

pub mod agent;
pub mod aggregator;
pub mod conf;
pub mod directory;
pub mod metrics;
pub mod network;
pub mod trainer;

use std::sync::Arc;

use async_trait::async_trait;
use rand::RngCore;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinSet;
use tracing::{error, info};

pub use crate::network::Channel;

/// Mints a fresh component id. Ids are regenerated on every process start;
/// only the node's IP is stable across restarts.
pub fn generate_component_id(prefix: &str) -> String {
    let mut raw = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut raw);
    format!("{}-{}", prefix, hex::encode(raw))
}

/// Service processes inbound protocol messages and drives its own background
/// routines until the process terminates.
///
/// A service is allowed to open outbound calls through the shared channel as
/// well.
#[async_trait]
pub trait LongLivedService<C: Channel>: Send + Sync {
    async fn execute(&mut self, channel: Arc<C>) -> anyhow::Result<usize>;

    /// Returns service name.
    fn name(&self) -> &'static str;
}

/// A node hosts the role services of one process over a shared outbound
/// channel.
pub struct Node<C: Channel> {
    channel: Arc<C>,
}

impl<C: Channel> Clone for Node<C> {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel.clone(),
        }
    }
}

impl<C: Channel> Node<C> {
    pub fn new(c: C) -> Self {
        Self {
            channel: Arc::new(c),
        }
    }

    pub fn channel(&self) -> Arc<C> {
        self.channel.clone()
    }

    /// Sets up and runs a list of services.
    pub async fn spawn_all(
        &self,
        service_list: Vec<Box<dyn LongLivedService<C>>>,
    ) -> anyhow::Result<()> {
        // Spawn all services and join-wait for their termination.
        let mut set = JoinSet::new();
        set.spawn(async {
            signal(SignalKind::interrupt())?.recv().await;
            Ok(2)
        });

        for mut s in service_list.into_iter() {
            let c = self.channel.clone();

            let name = s.name();
            info!("starting service {}", name);

            set.spawn(async move { s.execute(c).await });
        }

        // Wait for all spawned services to terminate with a result code or
        // an error. Result code 2 means abort all services; it is produced
        // by the SIGINT handler.
        while let Some(res) = set.join_next().await {
            if let Ok(r) = res {
                match r {
                    Ok(rcode) => {
                        if rcode == 2 {
                            set.abort_all();
                        }
                    }
                    Err(e) => {
                        error!("service terminated with err {}", e);
                    }
                }
            }
        }

        info!("shutdown ...");

        Ok(())
    }
}
