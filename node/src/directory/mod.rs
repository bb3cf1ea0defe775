// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

pub mod blob;
pub mod conf;
pub mod db;

use std::sync::Arc;

use async_trait::async_trait;
use election::winner::select_winner;
use node_data::message::{payload, Message, Payload};
use node_data::model::ModelType;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::network::{serve, RequestHandler};
use crate::{Channel, LongLivedService};

use self::blob::BlobStore;
use self::conf::Params;
use self::db::Store;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("no candidates provided")]
    NoCandidates,
    #[error("request kind not served by the directory")]
    UnexpectedKind,
    #[error("a storage error occurred {0}")]
    Storage(anyhow::Error),
}

impl From<anyhow::Error> for DirectoryError {
    fn from(err: anyhow::Error) -> Self {
        Self::Storage(err)
    }
}

/// The directory service: the shared membership/coordination store behind a
/// one-message-in/one-reply-out endpoint.
pub struct DirectorySrv {
    conf: Params,
    handler: Option<Arc<DirectoryHandler>>,
}

impl DirectorySrv {
    pub async fn create_or_open(conf: Params) -> anyhow::Result<Self> {
        info!("DirectorySrv::create_or_open with conf {}", conf);

        let store = Store::create_or_open(&conf.data_path).await?;
        let blobs = BlobStore::new(&conf.model_path)?;

        Ok(Self {
            handler: Some(Arc::new(DirectoryHandler {
                store,
                blobs,
                conf: conf.clone(),
            })),
            conf,
        })
    }

    /// Handler backed by an in-memory store, for tests.
    pub async fn in_memory(conf: Params) -> anyhow::Result<Arc<DirectoryHandler>> {
        let store = Store::in_memory().await?;
        let blobs = BlobStore::new(&conf.model_path)?;
        Ok(Arc::new(DirectoryHandler { store, blobs, conf }))
    }
}

#[async_trait]
impl<C: Channel> LongLivedService<C> for DirectorySrv {
    async fn execute(&mut self, _channel: Arc<C>) -> anyhow::Result<usize> {
        let handler = self
            .handler
            .take()
            .ok_or_else(|| anyhow::anyhow!("directory already started"))?;

        let addr = format!("{}:{}", self.conf.listen_ip, self.conf.listen_port);
        let listener = TcpListener::bind(&addr).await?;
        info!(event = "directory_listening", addr);

        serve(listener, handler, self.conf.max_inflight).await
    }

    /// Returns service name.
    fn name(&self) -> &'static str {
        "directory"
    }
}

pub struct DirectoryHandler {
    store: Store,
    blobs: BlobStore,
    conf: Params,
}

#[async_trait]
impl RequestHandler for DirectoryHandler {
    async fn handle(&self, msg: Message) -> Option<Message> {
        let reply = match self.dispatch(&msg).await {
            Ok(reply) => reply,
            Err(e) => {
                error!(event = "request_failed", topic = ?msg.topic(), err = %e);
                Message::new_error(e.to_string())
            }
        };
        Some(reply)
    }
}

impl DirectoryHandler {
    pub fn store(&self) -> &Store {
        &self.store
    }

    async fn dispatch(&self, msg: &Message) -> Result<Message, DirectoryError> {
        match &msg.payload {
            Payload::PushModel(p) => self.handle_push_model(p).await,
            Payload::RegisterAgent(p) => self.handle_register(p).await,
            Payload::GetAggregator => self.handle_get_aggregator().await,
            Payload::ElectAggregator(p) => self.handle_elect(p).await,
            Payload::UpdateAggregator(p) => self.handle_update(p).await,
            Payload::ClearAggregator => {
                self.store.clear_current_aggregator().await?;
                Ok(Message::from_marker(Payload::Cleared))
            }
            Payload::GetAgentsCount => {
                self.evict_stale().await;
                let count = self.store.agents_count().await?;
                Ok(Message {
                    payload: Payload::AgentsCount(payload::AgentsCount {
                        count,
                    }),
                    metadata: None,
                })
            }
            Payload::GetAllAgents => {
                self.evict_stale().await;
                let scores = self
                    .store
                    .all_agents()
                    .await?
                    .into_iter()
                    .map(|a| (a.agent_id, a.score))
                    .collect();
                Ok(Message {
                    payload: Payload::Agents(payload::Agents { scores }),
                    metadata: None,
                })
            }
            Payload::InitBarrier(p) => {
                self.store
                    .init_barrier(p.round, p.threshold, &p.aggregator_id, p.state)
                    .await?;
                Ok(Message::from_marker(Payload::Confirmation))
            }
            Payload::UpdateBarrierState(p) => {
                self.store.update_barrier_state(p.state).await?;
                Ok(Message::from_marker(Payload::Confirmation))
            }
            Payload::ResetBarrier => {
                self.store.reset_barrier_agents().await?;
                Ok(Message::from_marker(Payload::Confirmation))
            }
            _ => Err(DirectoryError::UnexpectedKind),
        }
    }

    async fn handle_push_model(
        &self,
        p: &payload::PushModel,
    ) -> Result<Message, DirectoryError> {
        // Payload on disk before the row: a row pointing at a missing blob
        // would be unreadable forever.
        self.blobs
            .store(&p.model_id, &p.model)
            .await
            .map_err(DirectoryError::Storage)?;

        match p.model_type {
            ModelType::Local => {
                let performance = p.meta_value("accuracy").unwrap_or(0.0);
                let num_samples =
                    p.meta_value("num_samples").unwrap_or(0.0) as i64;

                self.store
                    .insert_local_model(
                        &p.model_id,
                        p.gen_time,
                        &p.component_id,
                        p.round,
                        performance,
                        num_samples,
                    )
                    .await?;

                self.store
                    .record_barrier_arrival(&p.component_id, p.round)
                    .await?;
            }
            ModelType::Cluster => {
                let num_samples =
                    p.meta_value("num_samples").unwrap_or(0.0) as i64;

                self.store
                    .insert_cluster_model(
                        &p.model_id,
                        p.gen_time,
                        &p.component_id,
                        p.round,
                        num_samples,
                    )
                    .await?;
            }
        }

        info!(
            event = "model_pushed",
            model_id = %p.model_id,
            model_type = p.model_type.as_str(),
            round = p.round
        );

        Ok(Message::from_marker(Payload::Confirmation))
    }

    async fn handle_register(
        &self,
        p: &payload::RegisterAgent,
    ) -> Result<Message, DirectoryError> {
        info!(
            event = "agent_registration",
            agent_id = %p.agent_id,
            ip = %p.ip,
            port = p.port,
            score = p.score
        );

        self.store
            .upsert_agent(&p.agent_id, &p.ip, p.port, p.score)
            .await?;

        Ok(Message::from_marker(Payload::Registered))
    }

    async fn handle_get_aggregator(&self) -> Result<Message, DirectoryError> {
        match self.store.current_aggregator().await? {
            Some(row) => Ok(Message {
                payload: Payload::AggregatorInfo(payload::AggregatorInfo {
                    aggregator_id: row.aggregator_id,
                    ip: row.ip,
                    port: row.port,
                }),
                metadata: None,
            }),
            None => Ok(Message::from_marker(Payload::NoAggregator)),
        }
    }

    async fn handle_elect(
        &self,
        p: &payload::ElectAggregator,
    ) -> Result<Message, DirectoryError> {
        self.evict_stale().await;

        if p.scores.is_empty() {
            warn!(event = "election_failed", reason = "no_candidates");
            return Ok(election_failed("no_candidates"));
        }

        let (winner_id, winner_score) =
            select_winner(&p.scores).ok_or(DirectoryError::NoCandidates)?;
        let winner_id = winner_id.to_string();

        let Some(winner) = self.store.agent_by_id(&winner_id).await? else {
            warn!(
                event = "election_failed",
                reason = "winner_not_found",
                winner_id = %winner_id
            );
            return Ok(election_failed("winner_not_found"));
        };

        self.store
            .set_current_aggregator(&winner.agent_id, &winner.ip, winner.port)
            .await?;

        info!(
            event = "aggregator_elected",
            winner_id = %winner_id,
            score = winner_score,
            ip = %winner.ip,
            port = winner.port
        );

        Ok(Message {
            payload: Payload::Elected(payload::Elected {
                aggregator_id: winner.agent_id,
                ip: winner.ip,
                port: winner.port,
                score: winner_score,
            }),
            metadata: None,
        })
    }

    async fn handle_update(
        &self,
        p: &payload::AggregatorInfo,
    ) -> Result<Message, DirectoryError> {
        self.store
            .set_current_aggregator(&p.aggregator_id, &p.ip, p.port)
            .await?;
        Ok(Message::from_marker(Payload::Updated))
    }

    /// The maintenance pass piggybacks on membership reads; a failure here
    /// must not fail the read itself.
    async fn evict_stale(&self) {
        if let Err(e) = self.store.evict_stale_agents(self.conf.agent_ttl).await
        {
            warn!(event = "eviction_failed", err = %e);
        }
    }
}

fn election_failed(reason: &str) -> Message {
    Message {
        payload: Payload::ElectionFailed(payload::ElectionFailed {
            reason: reason.into(),
        }),
        metadata: None,
    }
}
