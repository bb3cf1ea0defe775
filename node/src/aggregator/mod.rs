// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

pub mod conf;
mod round;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use election::judge::TerminationJudges;
use election::winner::RotationCadence;
use metrics::counter;
use node_data::message::{payload, Message, Payload};
use node_data::model::{generate_model_id, ModelType, AGGREGATOR_PREFIX};
use node_data::get_current_timestamp;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::conf::Role;
use crate::metrics::AggregatorMetrics;
use crate::network::{resolve, serve, RequestHandler};
use crate::trainer::AggregateFn;
use crate::{generate_component_id, Channel, LongLivedService};

use self::conf::Params;
use self::state::{AgentEntry, State};

/// The aggregator service: accepts participation handshakes, collects local
/// updates, aggregates, distributes, and drives rotation and termination.
pub struct AggregatorSrv {
    conf: Params,
    state: Arc<Mutex<State>>,
    agg_fn: Arc<dyn AggregateFn>,
    metrics_log: Arc<std::sync::Mutex<AggregatorMetrics>>,
}

impl AggregatorSrv {
    pub fn new(
        conf: Params,
        agg_fn: Arc<dyn AggregateFn>,
    ) -> anyhow::Result<Self> {
        info!("AggregatorSrv::new with conf {}", conf);

        let id = generate_component_id(AGGREGATOR_PREFIX);
        let judges = TerminationJudges::new(
            conf.max_rounds,
            conf.early_stopping_patience,
            conf.early_stopping_min_delta,
        );
        let cadence =
            RotationCadence::new(conf.rotation_min_rounds, conf.rotation_interval);

        let metrics_log = AggregatorMetrics::create(&conf.metrics_dir)?;

        Ok(Self {
            state: Arc::new(Mutex::new(State::new(id, judges, cadence))),
            agg_fn,
            metrics_log: Arc::new(std::sync::Mutex::new(metrics_log)),
            conf,
        })
    }

    /// Shared state handle, exposed for integration tests.
    pub fn state(&self) -> Arc<Mutex<State>> {
        self.state.clone()
    }
}

#[async_trait]
impl<C: Channel> LongLivedService<C> for AggregatorSrv {
    async fn execute(&mut self, channel: Arc<C>) -> anyhow::Result<usize> {
        let reg_listener =
            TcpListener::bind(("0.0.0.0", self.conf.reg_port)).await?;
        let recv_listener =
            TcpListener::bind(("0.0.0.0", self.conf.recv_port)).await?;
        info!(
            event = "aggregator_listening",
            reg_port = self.conf.reg_port,
            recv_port = self.conf.recv_port
        );

        // Publish the serving endpoint: the directory record written by the
        // election carries the winner's registration address as agents knew
        // it, the promoted process confirms it here.
        let aggregator_id = self.state.lock().await.id.clone();
        publish_endpoint(&*channel, &self.conf, &aggregator_id).await;

        let handler = Arc::new(AggHandler {
            conf: self.conf.clone(),
            state: self.state.clone(),
            channel: channel.clone(),
            metrics_log: self.metrics_log.clone(),
        });

        let reg_loop =
            serve(reg_listener, handler.clone(), self.conf.max_inflight);
        let recv_loop =
            serve(recv_listener, handler.clone(), self.conf.max_inflight);
        let round_loop = round::run(
            self.conf.clone(),
            self.state.clone(),
            self.agg_fn.clone(),
            channel,
            self.metrics_log.clone(),
        );

        tokio::select! {
            res = reg_loop => res,
            res = recv_loop => res,
            res = round_loop => res,
        }
    }

    /// Returns service name.
    fn name(&self) -> &'static str {
        "aggregator"
    }
}

async fn publish_endpoint<C: Channel>(
    channel: &C,
    conf: &Params,
    aggregator_id: &str,
) {
    let Some(addr) = resolve(&conf.db_addr()) else {
        warn!(event = "bad_directory_addr", addr = %conf.db_addr());
        return;
    };

    let msg = Message::new_update_aggregator(payload::AggregatorInfo {
        aggregator_id: aggregator_id.into(),
        ip: conf.advertise_ip.clone(),
        port: conf.reg_port,
    });

    match channel.call(addr, &msg).await {
        Some(reply) if matches!(reply.payload, Payload::Updated) => {
            info!(event = "endpoint_published", ip = %conf.advertise_ip);
        }
        other => {
            warn!(event = "endpoint_publish_failed", reply = ?other.map(|m| m.topic()));
        }
    }
}

struct AggHandler<C: Channel> {
    conf: Params,
    state: Arc<Mutex<State>>,
    channel: Arc<C>,
    metrics_log: Arc<std::sync::Mutex<AggregatorMetrics>>,
}

#[async_trait]
impl<C: Channel> RequestHandler for AggHandler<C> {
    async fn handle(&self, msg: Message) -> Option<Message> {
        let reply = match &msg.payload {
            Payload::Participate(p) => self.handle_participate(p).await,
            Payload::ModelUpload(p) => self.handle_upload(p).await,
            Payload::Polling(p) => self.handle_polling(p).await,
            Payload::RecallUpload(p) => self.handle_recall(p).await,
            _ => {
                error!(event = "invalid_inbound", topic = ?msg.topic());
                Message::new_error("unhandled message payload")
            }
        };
        Some(reply)
    }
}

impl<C: Channel> AggHandler<C> {
    /// Participation handshake. The very first handshake of round 0 fixes
    /// the model template and opens round 1.
    async fn handle_participate(&self, p: &payload::Participate) -> Message {
        let exch_port = if p.simulation {
            info!(event = "simulation_run", agent_id = %p.agent_id);
            p.exch_port
        } else {
            self.conf.exch_port
        };

        let (first, welcome) = {
            let mut state = self.state.lock().await;

            state.add_agent(AgentEntry {
                agent_id: p.agent_id.clone(),
                agent_name: p.agent_name.clone(),
                ip: p.agent_ip.clone(),
                exch_port,
            });
            info!(
                event = "agent_joined",
                agent_id = %p.agent_id,
                ip = %p.agent_ip,
                agents = state.num_agents()
            );

            let first = state.round() == 0 && !state.has_template();
            if first {
                state.initialize_model_info(&p.model, p.init_weights);
                state.increment_round();
            }

            // No cluster model yet is fine: the agent proceeds on an empty
            // set and waits for the first distribution.
            let model_id = state
                .latest_cluster_model_id()
                .unwrap_or_default()
                .to_string();
            let model = state.cluster_model().cloned().unwrap_or_default();
            state.bytes_sent += model.byte_size() as u64;

            let welcome = payload::Welcome {
                aggregator_id: state.id.clone(),
                model_id,
                model,
                round: state.round(),
                agent_id: p.agent_id.clone(),
                exch_port,
                recv_port: self.conf.recv_port,
                aggregator_ip: self.conf.advertise_ip.clone(),
            };
            (first, welcome)
        };

        if first {
            self.push_local_to_directory(
                &p.agent_id, &p.model_id, &p.model, p.gen_time, &p.meta,
            )
            .await;
        }

        info!(event = "welcome_sent", agent_id = %p.agent_id);
        Message::new_welcome(welcome)
    }

    /// Local model upload: buffered for the round and mirrored to the
    /// directory.
    async fn handle_upload(&self, p: &payload::ModelUpload) -> Message {
        {
            let mut state = self.state.lock().await;
            state.buffer_update(p.model.clone());
            state.bytes_received += p.model.byte_size() as u64;

            info!(
                event = "local_model_received",
                agent_id = %p.agent_id,
                buffered = state.buffer_len()
            );
        }
        counter!("rotor_models_buffered").increment(1);

        self.push_local_to_directory(
            &p.agent_id, &p.model_id, &p.model, p.gen_time, &p.meta,
        )
        .await;

        Message::from_marker(Payload::Ack)
    }

    /// Polling reply priority: termination, then rotation, then a fresh
    /// cluster model, then a plain ack.
    async fn handle_polling(&self, p: &payload::Polling) -> Message {
        let mut state = self.state.lock().await;

        if let Some(termination) = state.pending_termination() {
            info!(event = "termination_sent", agent_id = %p.agent_id);
            return Message::new_termination(termination.clone());
        }

        if let Some(notice) = state.pending_rotation().cloned() {
            if state.num_agents() == 0 {
                warn!(event = "rotation_cancelled", reason = "no agents");
                state.clear_pending_rotation();
                return Message::from_marker(Payload::Ack);
            }

            // Re-sent idempotently to already-notified agents.
            let complete = state.mark_rotation_notified(&p.agent_id);
            info!(
                event = "rotation_sent",
                agent_id = %p.agent_id,
                complete
            );

            if complete {
                if notice.winner_id == state.id {
                    info!(event = "rotation_won", winner = %notice.winner_id);
                    state.clear_pending_rotation();
                } else {
                    self.demote(&state, &notice);
                }
            }

            return Message::new_rotation(notice);
        }

        if state.round() > p.round {
            if let (Some(model), Some(model_id)) = (
                state.cluster_model().cloned(),
                state
                    .latest_cluster_model_id()
                    .map(str::to_string),
            ) {
                state.bytes_sent += model.byte_size() as u64;
                info!(event = "cluster_model_sent", agent_id = %p.agent_id);
                counter!("rotor_polling_distributions").increment(1);

                return Message::new_cluster_model(payload::ClusterModel {
                    aggregator_id: state.id.clone(),
                    model_id,
                    round: state.round(),
                    model,
                });
            }
        }

        Message::from_marker(Payload::Ack)
    }

    async fn handle_recall(&self, p: &payload::RecallUpload) -> Message {
        let mut state = self.state.lock().await;
        info!(
            event = "recall_received",
            agent_id = %p.agent_id,
            recall = p.recall,
            round = p.round
        );

        if state.observe_recall(&p.agent_id, p.recall).is_some() {
            state.check_termination();
        }

        Message::from_marker(Payload::Ack)
    }

    /// This aggregator lost the rotation: flush a last metrics row, persist
    /// the agent role pointing at the winner and leave the process. The
    /// exit is deferred a moment so the in-flight rotation reply reaches
    /// its poller.
    fn demote(&self, state: &State, notice: &payload::Rotation) {
        info!(
            event = "rotation_lost",
            winner_ip = %notice.winner_ip,
            round = state.round()
        );

        if let Ok(mut log) = self.metrics_log.lock() {
            let row = crate::metrics::AggregatorRound {
                round: state.round(),
                num_agents: state.num_agents(),
                global_recall: state.last_global_recall,
                rounds_without_improvement: state
                    .judges
                    .rounds_without_improvement(),
                best_recall: Some(state.judges.best_recall()),
                ..Default::default()
            };
            if let Err(e) = log.log_round(&row) {
                error!(event = "metrics_flush_failed", err = %e);
            }
        }

        let config_path = self.conf.config_path.clone();
        let winner_ip = notice.winner_ip.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            crate::conf::request_role_change(
                &config_path,
                Role::Agent,
                Some(&winner_ip),
            );
        });
    }

    async fn push_local_to_directory(
        &self,
        agent_id: &str,
        model_id: &str,
        model: &node_data::model::ModelSet,
        gen_time: u64,
        meta: &[(String, f64)],
    ) {
        let round = self.state.lock().await.round();

        let push = payload::PushModel {
            component_id: agent_id.into(),
            round,
            model_type: ModelType::Local,
            model: model.clone(),
            model_id: model_id.into(),
            gen_time,
            meta: meta.to_vec(),
        };

        round::push_to_directory(&*self.channel, &self.conf, push).await;
    }
}

/// Mints the id for the cluster model the aggregator is about to publish.
pub(super) fn mint_cluster_model_id(aggregator_id: &str) -> String {
    generate_model_id(
        AGGREGATOR_PREFIX,
        aggregator_id,
        get_current_timestamp(),
    )
}
