// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

pub mod conf;
pub mod state;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use election::winner::draw_score;
use metrics::counter;
use node_data::get_current_timestamp;
use node_data::message::{payload, Message, Payload};
use node_data::model::{generate_model_id, ModelSet, AGENT_PREFIX};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::conf::Role;
use crate::metrics::{AgentMetrics, AgentRound};
use crate::network::{resolve, serve, RequestHandler};
use crate::trainer::{Evaluation, TrainerHandle};
use crate::{generate_component_id, Channel, LongLivedService};

use self::conf::Params;
use self::state::{ClientState, StateMachine};

/// How long the trainer loop sleeps between readiness checks.
const TRAINER_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Participation handshake retry budget.
const PARTICIPATE_RETRIES: u32 = 12;

/// Liveness probe retries toward a suspected-dead aggregator.
const PROBE_RETRIES: u32 = 3;
const PROBE_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Pause between registered-agents checks during the grace window.
const GRACE_CHECK_INTERVAL: Duration = Duration::from_secs(3);

/// Grace for a freshly elected winner to start serving.
const WINNER_STARTUP_DELAY: Duration = Duration::from_secs(10);

/// Pause letting a racing election settle before re-reading the winner.
const ELECTION_SETTLE_DELAY: Duration = Duration::from_secs(2);

/// A trained local model staged for upload.
#[derive(Debug, Clone)]
struct LocalUpdate {
    model_id: String,
    model: ModelSet,
    evaluation: Evaluation,
}

/// Mutable agent runtime state behind the coarse lock.
struct Shared {
    id: String,
    round: u64,
    fsm: StateMachine,

    /// Latest adopted global model, consumed by the trainer loop.
    global_model: Option<ModelSet>,
    /// A global model that arrived while the agent was busy; adopted at
    /// the next opportunity.
    pending_global: Option<payload::ClusterModel>,
    local: Option<LocalUpdate>,
    last_eval: Option<Evaluation>,

    aggr_ip: String,
    /// The aggregator's upload/poll port, learned from the welcome.
    msend_port: u16,
    /// Own push-listener port.
    exch_port: u16,

    polling_failures: u32,

    // per-round metrics accounting
    bytes_global: u64,
    bytes_local: u64,
    num_messages: u32,
    wait_started: Option<Instant>,
    round_started: Option<Instant>,
}

/// The agent service: registers with the directory, discovers (or elects)
/// the aggregator, then cycles train -> upload -> poll until rotation or
/// termination moves it on.
pub struct AgentSrv {
    core: Arc<AgentCore>,
}

struct AgentCore {
    conf: Params,
    trainer: Arc<dyn TrainerHandle>,
    shared: Mutex<Shared>,
    metrics_log: std::sync::Mutex<AgentMetrics>,
}

impl AgentSrv {
    pub fn new(
        conf: Params,
        trainer: Arc<dyn TrainerHandle>,
    ) -> anyhow::Result<Self> {
        info!("AgentSrv::new with conf {}", conf);

        let metrics_log =
            AgentMetrics::create(&conf.metrics_dir, &conf.agent_name)?;

        let shared = Shared {
            id: generate_component_id(AGENT_PREFIX),
            round: 0,
            fsm: StateMachine::default(),
            global_model: None,
            pending_global: None,
            local: None,
            last_eval: None,
            aggr_ip: conf.aggr_ip.clone(),
            msend_port: 0,
            exch_port: conf.exch_port,
            polling_failures: 0,
            bytes_global: 0,
            bytes_local: 0,
            num_messages: 0,
            wait_started: None,
            round_started: None,
        };

        Ok(Self {
            core: Arc::new(AgentCore {
                conf,
                trainer,
                shared: Mutex::new(shared),
                metrics_log: std::sync::Mutex::new(metrics_log),
            }),
        })
    }
}

#[async_trait]
impl<C: Channel> LongLivedService<C> for AgentSrv {
    async fn execute(&mut self, channel: Arc<C>) -> anyhow::Result<usize> {
        let core = self.core.clone();

        // The push listener must exist before the handshake advertises its
        // port.
        let push_listener = if core.conf.polling {
            None
        } else {
            let listener =
                TcpListener::bind(("0.0.0.0", core.conf.exch_port)).await?;
            let port = listener.local_addr()?.port();
            core.shared.lock().await.exch_port = port;
            info!(event = "push_listener_bound", port);
            Some(listener)
        };

        core.bootstrap(&*channel).await?;

        let exchange = core.exchange_loop(channel.clone());
        let training = core.trainer_loop(channel.clone());
        let push = async {
            match push_listener {
                Some(listener) => {
                    let handler = Arc::new(PushHandler { core: core.clone() });
                    serve(listener, handler, core.conf.max_inflight).await
                }
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            res = exchange => res,
            res = training => res,
            res = push => res,
        }
    }

    /// Returns service name.
    fn name(&self) -> &'static str {
        "agent"
    }
}

impl AgentCore {
    // ---- bootstrap & discovery -------------------------------------------

    async fn bootstrap<C: Channel>(&self, channel: &C) -> anyhow::Result<()> {
        self.register_in_directory(channel).await;
        self.grace_wait(channel).await;

        // A pre-existing directory entry is probed for liveness; a winner
        // fresh out of an election is not (it has not started serving yet).
        let mut target = None;
        if let Some(info) = self.get_aggregator(channel).await {
            if self.probe(channel, &info).await {
                target = Some((info.ip, info.port));
            } else if info.ip == self.conf.advertise_ip {
                info!(event = "self_promotion", reason = "registered but not serving");
                crate::conf::request_role_change(
                    &self.conf.config_path,
                    Role::Aggregator,
                    Some(&self.conf.advertise_ip),
                );
            } else {
                warn!(event = "stale_aggregator", ip = %info.ip);
                self.clear_aggregator(channel).await;
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }

        loop {
            let (ip, port) = match target.take() {
                Some(t) => t,
                None => {
                    let Some(info) = self.elect(channel).await else {
                        anyhow::bail!("election failed, cannot proceed");
                    };
                    if info.ip == self.conf.advertise_ip {
                        info!(event = "self_promotion", reason = "won election");
                        crate::conf::request_role_change(
                            &self.conf.config_path,
                            Role::Aggregator,
                            Some(&self.conf.advertise_ip),
                        );
                    }
                    info!(event = "election_lost", winner_ip = %info.ip);
                    tokio::time::sleep(WINNER_STARTUP_DELAY).await;
                    (info.ip, info.port)
                }
            };

            self.shared.lock().await.aggr_ip = ip.clone();

            if self.participate(channel, &ip, port).await.is_ok() {
                return Ok(());
            }

            // The recorded aggregator never answered: clear it, refresh the
            // registration and run discovery again from scratch.
            warn!(event = "aggregator_silent", ip = %ip);
            self.clear_aggregator(channel).await;
            self.register_in_directory(channel).await;
        }
    }

    async fn register_in_directory<C: Channel>(&self, channel: &C) {
        let score = draw_score(&mut rand::thread_rng());
        let agent_id = self.shared.lock().await.id.clone();

        info!(
            event = "registering",
            agent_id = %agent_id,
            ip = %self.conf.advertise_ip,
            score
        );

        let msg = Message::new_register_agent(payload::RegisterAgent {
            agent_id,
            ip: self.conf.advertise_ip.clone(),
            port: self.conf.reg_port,
            score,
        });

        match self.dir_call(channel, msg).await {
            Some(reply) if matches!(reply.payload, Payload::Registered) => {
                info!(event = "registered")
            }
            other => {
                warn!(event = "registration_unconfirmed", reply = ?other.map(|m| m.topic()))
            }
        }
    }

    /// Waits out the registration grace window, breaking early once the
    /// expected number of peers showed up.
    async fn grace_wait<C: Channel>(&self, channel: &C) {
        let grace = self.conf.registration_grace_period;
        let expected = self.conf.expected_num_agents;
        info!(event = "grace_wait", period = ?grace, expected);

        let started = Instant::now();
        while started.elapsed() < grace {
            tokio::time::sleep(GRACE_CHECK_INTERVAL).await;

            let count = match self
                .dir_call(channel, Message::from_marker(Payload::GetAgentsCount))
                .await
            {
                Some(Message {
                    payload: Payload::AgentsCount(c),
                    ..
                }) => c.count,
                _ => continue,
            };

            info!(
                event = "grace_progress",
                registered = count,
                elapsed = ?started.elapsed()
            );

            if expected > 0 && count >= expected {
                info!(event = "grace_complete", reason = "all expected present");
                return;
            }
        }
        info!(event = "grace_complete", reason = "period elapsed");
    }

    async fn get_aggregator<C: Channel>(
        &self,
        channel: &C,
    ) -> Option<payload::AggregatorInfo> {
        match self
            .dir_call(channel, Message::from_marker(Payload::GetAggregator))
            .await?
            .payload
        {
            Payload::AggregatorInfo(info) => {
                info!(event = "aggregator_found", ip = %info.ip, port = info.port);
                Some(info)
            }
            Payload::NoAggregator => {
                info!(event = "no_aggregator");
                None
            }
            _ => None,
        }
    }

    /// Reachability probe with retries; a fresh winner gets time to start.
    async fn probe<C: Channel>(
        &self,
        channel: &C,
        info: &payload::AggregatorInfo,
    ) -> bool {
        let Some(addr) = resolve(&format!("{}:{}", info.ip, info.port)) else {
            return false;
        };

        for attempt in 1..=PROBE_RETRIES {
            if channel.reachable(addr).await {
                info!(event = "aggregator_alive", attempt);
                return true;
            }
            if attempt < PROBE_RETRIES {
                tokio::time::sleep(PROBE_RETRY_DELAY).await;
            }
        }

        warn!(event = "aggregator_unreachable", ip = %info.ip);
        false
    }

    async fn clear_aggregator<C: Channel>(&self, channel: &C) {
        match self
            .dir_call(channel, Message::from_marker(Payload::ClearAggregator))
            .await
        {
            Some(reply) if matches!(reply.payload, Payload::Cleared) => {
                info!(event = "aggregator_cleared")
            }
            other => {
                warn!(event = "clear_unconfirmed", reply = ?other.map(|m| m.topic()))
            }
        }
    }

    /// Runs an election through the directory and returns the settled
    /// winner. The follow-up read skips the liveness probe deliberately.
    async fn elect<C: Channel>(
        &self,
        channel: &C,
    ) -> Option<payload::AggregatorInfo> {
        let mut candidates = self.get_all_agents(channel).await;

        if (candidates.len() as u32) < self.conf.election_min_agents {
            warn!(
                event = "few_candidates",
                count = candidates.len(),
                minimum = self.conf.election_min_agents
            );
            tokio::time::sleep(GRACE_CHECK_INTERVAL).await;
            candidates = self.get_all_agents(channel).await;
        }

        if candidates.is_empty() {
            error!(event = "election_impossible", reason = "no candidates");
            return None;
        }

        info!(event = "election_start", candidates = candidates.len());
        match self
            .dir_call(channel, Message::new_elect_aggregator(candidates))
            .await
        {
            Some(Message {
                payload: Payload::Elected(e),
                ..
            }) => {
                info!(event = "election_result", ip = %e.ip, score = e.score)
            }
            Some(Message {
                payload: Payload::ElectionFailed(f),
                ..
            }) => {
                warn!(event = "election_failed", reason = %f.reason);
                return None;
            }
            other => {
                warn!(event = "election_unconfirmed", reply = ?other.map(|m| m.topic()))
            }
        }

        // Racing electors may have produced a different winner; the
        // directory's record is the authoritative one.
        tokio::time::sleep(ELECTION_SETTLE_DELAY).await;
        self.get_aggregator(channel).await
    }

    async fn get_all_agents<C: Channel>(
        &self,
        channel: &C,
    ) -> Vec<(String, u8)> {
        match self
            .dir_call(channel, Message::from_marker(Payload::GetAllAgents))
            .await
        {
            Some(Message {
                payload: Payload::Agents(a),
                ..
            }) => a.scores,
            _ => Vec::new(),
        }
    }

    /// Sends the participation handshake, backing off between attempts, and
    /// applies the welcome.
    async fn participate<C: Channel>(
        &self,
        channel: &C,
        ip: &str,
        port: u16,
    ) -> anyhow::Result<()> {
        let template = self.trainer.initial_model().await?;
        let addr = resolve(&format!("{ip}:{port}"))
            .ok_or_else(|| anyhow::anyhow!("bad aggregator address"))?;

        let msg = {
            let shared = self.shared.lock().await;
            Message::new_participate(payload::Participate {
                agent_name: self.conf.agent_name.clone(),
                agent_id: shared.id.clone(),
                model_id: generate_model_id(
                    AGENT_PREFIX,
                    &shared.id,
                    get_current_timestamp(),
                ),
                model: template,
                init_weights: self.conf.init_weights,
                simulation: self.conf.simulation,
                exch_port: shared.exch_port,
                gen_time: get_current_timestamp(),
                meta: Vec::new(),
                agent_ip: self.conf.advertise_ip.clone(),
            })
        };

        for attempt in 1..=PARTICIPATE_RETRIES {
            if let Some(reply) = channel.call(addr, &msg).await {
                if let Payload::Welcome(w) = reply.payload {
                    self.apply_welcome(*w).await;
                    return Ok(());
                }
                warn!(event = "unexpected_handshake_reply", attempt);
            }
            // Aggressive retry budget: the aggregator may still be starting.
            let backoff = Duration::from_secs(u64::from(attempt.min(10)));
            info!(event = "participate_retry", attempt, backoff = ?backoff);
            tokio::time::sleep(backoff).await;
        }

        anyhow::bail!("no welcome from the aggregator after retries")
    }

    async fn apply_welcome(&self, w: payload::Welcome) {
        let mut shared = self.shared.lock().await;

        shared.round = w.round;
        shared.msend_port = w.recv_port;
        // The aggregator's echo of the id is authoritative.
        shared.id = w.agent_id;
        shared.round_started = Some(Instant::now());

        info!(
            event = "welcome_received",
            aggregator_id = %w.aggregator_id,
            round = w.round,
            recv_port = w.recv_port
        );

        if w.model.is_empty() {
            // No cluster model yet; it arrives with the first distribution.
            shared.wait_started = Some(Instant::now());
            return;
        }

        shared.bytes_global += w.model.byte_size() as u64;
        shared.global_model = Some(w.model);
        if shared.fsm.transition(ClientState::GmReady).is_ok() {
            info!(event = "global_model_ready", source = "welcome");
        }
    }

    // ---- steady-state loops ----------------------------------------------

    /// Ticks every few seconds and dispatches on the client state.
    async fn exchange_loop<C: Channel>(
        &self,
        channel: Arc<C>,
    ) -> anyhow::Result<usize> {
        loop {
            tokio::time::sleep(self.conf.exchange_tick).await;

            let state = self.shared.lock().await.fsm.current();
            match state {
                ClientState::Sending => self.send_models(&*channel).await,
                ClientState::WaitingGm => {
                    let pending =
                        self.shared.lock().await.pending_global.take();
                    if let Some(cm) = pending {
                        self.adopt_global(cm).await;
                    } else if self.conf.polling {
                        self.process_polling(&*channel).await;
                    } else {
                        info!(event = "waiting_for_global_model");
                    }
                }
                ClientState::Training => {
                    info!(event = "training_in_progress")
                }
                ClientState::GmReady => {
                    info!(event = "global_model_ready")
                }
            }
        }
    }

    /// Drives the injected trainer through the state cycle.
    async fn trainer_loop<C: Channel>(
        &self,
        channel: Arc<C>,
    ) -> anyhow::Result<usize> {
        loop {
            // Wait for an adopted global model.
            let mut global = loop {
                {
                    let mut shared = self.shared.lock().await;
                    if shared.fsm.current() == ClientState::GmReady {
                        if let Some(model) = shared.global_model.take() {
                            // the trainer consumes the model; the pass begins
                            let _ = shared.fsm.transition(ClientState::Training);
                            info!(
                                event = "training_started",
                                round = shared.round
                            );
                            break model;
                        }
                    }
                }
                tokio::time::sleep(TRAINER_POLL_INTERVAL).await;
            };

            let outcome = loop {
                let outcome = match self.trainer.train(&global).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(event = "training_failed", err = %e);
                        tokio::time::sleep(self.conf.exchange_tick).await;
                        continue;
                    }
                };

                // A newer global model may have been published while the
                // pass ran; the stale result is discarded in its favor.
                let fresh = self.shared.lock().await.pending_global.take();
                match fresh {
                    Some(cm) => {
                        info!(
                            event = "training_too_slow",
                            adopted_round = cm.round
                        );
                        self.shared.lock().await.round = cm.round;
                        global = cm.model;
                    }
                    None => break outcome,
                }
            };

            let (recall, round) = {
                let mut shared = self.shared.lock().await;

                shared.local = Some(LocalUpdate {
                    model_id: generate_model_id(
                        AGENT_PREFIX,
                        &shared.id,
                        get_current_timestamp(),
                    ),
                    model: outcome.model,
                    evaluation: outcome.evaluation,
                });
                shared.last_eval = Some(outcome.evaluation);
                let _ = shared.fsm.transition(ClientState::Sending);
                info!(event = "local_model_staged", round = shared.round);

                (outcome.evaluation.recall, shared.round)
            };

            self.send_recall(&*channel, recall, round).await;
        }
    }

    /// Uploads the staged local model and moves to waiting.
    async fn send_models<C: Channel>(&self, channel: &C) {
        let (msg, addr) = {
            let mut shared = self.shared.lock().await;

            let Some(local) = shared.local.clone() else {
                warn!(event = "nothing_to_send");
                let _ = shared.fsm.transition(ClientState::WaitingGm);
                return;
            };
            let Some(addr) = upload_addr(&shared) else {
                warn!(event = "no_upload_endpoint");
                return;
            };

            shared.bytes_local += local.model.byte_size() as u64;
            shared.num_messages += 1;

            let msg = Message::new_model_upload(payload::ModelUpload {
                agent_id: shared.id.clone(),
                model_id: local.model_id,
                model: local.model,
                gen_time: get_current_timestamp(),
                meta: vec![
                    ("accuracy".into(), local.evaluation.accuracy),
                    (
                        "num_samples".into(),
                        local.evaluation.num_samples as f64,
                    ),
                ],
            });
            (msg, addr)
        };

        if channel.call(addr, &msg).await.is_none() {
            warn!(event = "upload_unconfirmed");
        }
        counter!("rotor_models_uploaded").increment(1);

        let mut shared = self.shared.lock().await;
        shared.local = None;
        shared.wait_started = Some(Instant::now());
        let _ = shared.fsm.transition(ClientState::WaitingGm);
        info!(event = "local_model_sent");
    }

    async fn send_recall<C: Channel>(&self, channel: &C, recall: f64, round: u64) {
        let (addr, id) = {
            let shared = self.shared.lock().await;
            (upload_addr(&shared), shared.id.clone())
        };
        let Some(addr) = addr else { return };

        let msg = Message::new_recall_upload(recall as f32, round, id);
        match channel.call(addr, &msg).await {
            Some(_) => info!(event = "recall_sent", recall),
            None => warn!(event = "recall_unconfirmed"),
        }
    }

    /// One poll toward the aggregator, dispatching on the reply kind.
    async fn process_polling<C: Channel>(&self, channel: &C) {
        let (addr, msg) = {
            let shared = self.shared.lock().await;
            let Some(addr) = upload_addr(&shared) else {
                return;
            };
            (addr, Message::new_polling(shared.round, shared.id.clone()))
        };

        info!(event = "polling");
        let Some(reply) = channel.call(addr, &msg).await else {
            let failures = {
                let mut shared = self.shared.lock().await;
                shared.polling_failures += 1;
                shared.polling_failures
            };
            warn!(
                event = "polling_failure",
                failures,
                max = self.conf.max_polling_failures
            );

            if failures >= self.conf.max_polling_failures {
                // The aggregator is gone. Leave with a non-zero code so the
                // supervisor restarts the discovery loop.
                error!(event = "aggregator_dead", failures);
                std::process::exit(1);
            }
            return;
        };

        self.shared.lock().await.polling_failures = 0;

        match reply.payload {
            Payload::Termination(t) => self.handle_termination(&t),
            Payload::Rotation(r) => self.handle_rotation(&r),
            Payload::ClusterModel(cm) => {
                info!(event = "global_model_received", round = cm.round);
                self.on_cluster_model(*cm).await;
            }
            Payload::Ack => {
                info!(event = "no_update_yet")
            }
            Payload::Error(e) => {
                warn!(event = "polling_error_reply", reason = %e.reason)
            }
            _ => warn!(event = "unexpected_polling_reply"),
        }
    }

    // ---- inbound global models -------------------------------------------

    /// Accepts a cluster model from either channel; adopted now when the
    /// agent is waiting, kept pending otherwise.
    async fn on_cluster_model(&self, cm: payload::ClusterModel) {
        let waiting = {
            let mut shared = self.shared.lock().await;
            shared.bytes_global += cm.model.byte_size() as u64;
            shared.num_messages += 1;
            shared.fsm.current() == ClientState::WaitingGm
        };

        if waiting {
            self.adopt_global(cm).await;
        } else {
            self.shared.lock().await.pending_global = Some(cm);
        }
    }

    async fn adopt_global(&self, cm: payload::ClusterModel) {
        let row = {
            let mut shared = self.shared.lock().await;

            shared.round = cm.round;
            shared.global_model = Some(cm.model);
            let _ = shared.fsm.transition(ClientState::GmReady);

            let wait = shared
                .wait_started
                .take()
                .map(|t| t.elapsed().as_secs_f64())
                .unwrap_or_default();
            let round_time = shared
                .round_started
                .replace(Instant::now())
                .map(|t| t.elapsed().as_secs_f64())
                .unwrap_or_default();

            let row = AgentRound {
                round: cm.round,
                global_accuracy: None,
                local_accuracy: shared.last_eval.map(|e| e.accuracy),
                num_messages: shared.num_messages,
                bytes_global: shared.bytes_global,
                bytes_local: shared.bytes_local,
                wait_global_secs: wait,
                round_time_secs: round_time,
            };
            shared.num_messages = 0;
            shared.bytes_global = 0;
            shared.bytes_local = 0;

            info!(event = "global_model_adopted", round = cm.round);
            row
        };

        if let Ok(mut log) = self.metrics_log.lock() {
            if let Err(e) = log.log_round(&row) {
                warn!(event = "metrics_append_failed", err = %e);
            }
        }
    }

    // ---- hand-off & termination ------------------------------------------

    /// The winner check compares IPs: agent ids regenerate on restart, the
    /// IP is the only identifier shared between what the directory knows
    /// and what this process sees of itself.
    fn handle_rotation(&self, r: &payload::Rotation) -> ! {
        let i_am_winner = self.conf.advertise_ip == r.winner_ip;
        info!(
            event = "rotation_received",
            winner_ip = %r.winner_ip,
            my_ip = %self.conf.advertise_ip,
            i_am_winner
        );

        if i_am_winner {
            crate::conf::request_role_change(
                &self.conf.config_path,
                Role::Aggregator,
                Some(&self.conf.advertise_ip),
            );
        }

        // Lost: point the persisted config at the winner and restart into
        // re-discovery.
        crate::conf::request_role_change(
            &self.conf.config_path,
            Role::Agent,
            Some(&r.winner_ip),
        );
    }

    fn handle_termination(&self, t: &payload::Termination) -> ! {
        warn!(
            event = "training_terminated",
            reason = %t.reason,
            final_round = t.final_round,
            final_recall = t.final_recall
        );
        std::process::exit(0);
    }

    async fn dir_call<C: Channel>(
        &self,
        channel: &C,
        msg: Message,
    ) -> Option<Message> {
        let addr = resolve(&self.conf.db_addr())?;
        let reply = channel.call(addr, &msg).await;
        if reply.is_none() {
            warn!(event = "directory_unreachable", topic = ?msg.topic());
        }
        reply
    }
}

fn upload_addr(shared: &Shared) -> Option<std::net::SocketAddr> {
    if shared.msend_port == 0 {
        return None;
    }
    resolve(&format!("{}:{}", shared.aggr_ip, shared.msend_port))
}

/// Push-mode inbound handler: cluster models, rotation notices and
/// termination notices arrive on the agent's own listener.
struct PushHandler {
    core: Arc<AgentCore>,
}

#[async_trait]
impl RequestHandler for PushHandler {
    async fn handle(&self, msg: Message) -> Option<Message> {
        match msg.payload {
            Payload::ClusterModel(cm) => {
                info!(event = "global_model_pushed", round = cm.round);
                self.core.on_cluster_model(*cm).await;
            }
            Payload::Rotation(r) => {
                // Reply first; the role change follows once the frame is
                // on the wire.
                let conf = self.core.conf.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    let i_am_winner = conf.advertise_ip == r.winner_ip;
                    let (role, ip) = if i_am_winner {
                        (Role::Aggregator, conf.advertise_ip.clone())
                    } else {
                        (Role::Agent, r.winner_ip.clone())
                    };
                    crate::conf::request_role_change(
                        &conf.config_path,
                        role,
                        Some(&ip),
                    );
                });
            }
            Payload::Termination(t) => {
                warn!(event = "training_terminated", reason = %t.reason);
                tokio::spawn(async {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    std::process::exit(0);
                });
            }
            _ => {
                warn!(event = "unexpected_push", topic = ?msg.topic());
                return Some(Message::new_error("unhandled message payload"));
            }
        }
        Some(Message::from_marker(Payload::Ack))
    }
}
