// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

//! The aggregator's round loop and rotation protocol.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use election::winner::{draw_score, select_winner};
use metrics::{counter, gauge};
use node_data::get_current_timestamp;
use node_data::message::{payload, BarrierState, Message, Payload};
use node_data::model::ModelType;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::conf::Role;
use crate::metrics::{AggregatorMetrics, AggregatorRound};
use crate::network::resolve;
use crate::trainer::AggregateFn;
use crate::Channel;

use super::conf::Params;
use super::state::State;

/// Internal poll interval of the barrier wait.
const BARRIER_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Cadence of the barrier progress log.
const BARRIER_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Push-mode rotation delivery retry rounds.
const ROTATION_PUSH_RETRIES: u32 = 5;

pub(super) async fn run<C: Channel>(
    conf: Params,
    state: Arc<Mutex<State>>,
    agg_fn: Arc<dyn AggregateFn>,
    channel: Arc<C>,
    metrics_log: Arc<std::sync::Mutex<AggregatorMetrics>>,
) -> anyhow::Result<usize> {
    let mut last_idle_log = Instant::now();

    loop {
        tokio::time::sleep(conf.round_interval).await;

        let (round, num_agents, aggregator_id) = {
            let mut s = state.lock().await;

            if s.training_terminated() {
                // Only the polling handler has work left: streaming the
                // termination notice out.
                continue;
            }
            if s.check_termination().is_some() {
                continue;
            }

            // An open rotation blocks new aggregation rounds until every
            // agent has been handed the notice.
            if s.pending_rotation().is_some() {
                continue;
            }

            (s.round(), s.num_agents(), s.id.clone())
        };

        if num_agents == 0 || round == 0 {
            if last_idle_log.elapsed() >= BARRIER_LOG_INTERVAL {
                info!(event = "waiting_for_agents", round);
                last_idle_log = Instant::now();
            }
            continue;
        }

        gauge!("rotor_registered_agents").set(num_agents as f64);

        // Open the barrier for this round.
        dir_call(
            &*channel,
            &conf,
            Message::new_init_barrier(payload::InitBarrier {
                round,
                threshold: num_agents as u32,
                aggregator_id: aggregator_id.clone(),
                state: BarrierState::WaitingModels,
            }),
        )
        .await;
        info!(event = "barrier_open", round, threshold = num_agents);

        let buffered =
            wait_for_uploads(&state, num_agents, conf.aggregation_timeout)
                .await;

        if buffered < conf.aggregation_threshold.max(1) {
            warn!(
                event = "round_abandoned",
                round,
                buffered,
                threshold = num_agents
            );
            reset_barrier(&*channel, &conf).await;
            continue;
        }

        // Aggregate. The snapshot drains the buffer; the callback runs
        // outside the lock.
        let updates = state.lock().await.take_buffer();
        let aggregation_start = Instant::now();
        let cluster = match agg_fn.aggregate(&updates) {
            Ok(model) => model,
            Err(e) => {
                error!(event = "aggregation_failed", round, err = %e);
                reset_barrier(&*channel, &conf).await;
                continue;
            }
        };
        let aggregation_time = aggregation_start.elapsed();
        info!(
            event = "aggregated",
            round,
            updates = updates.len(),
            elapsed = ?aggregation_time
        );

        // Persist the cluster model, advance the round, emit metrics.
        let (push, row) = {
            let mut s = state.lock().await;

            let model_id = super::mint_cluster_model_id(&s.id);
            s.cluster_num_samples = updates.len() as i64;
            s.set_cluster_model(cluster.clone(), model_id.clone());

            let push = payload::PushModel {
                component_id: s.id.clone(),
                round: s.round(),
                model_type: ModelType::Cluster,
                model: cluster.clone(),
                model_id,
                gen_time: get_current_timestamp(),
                meta: vec![(
                    "num_samples".into(),
                    s.cluster_num_samples as f64,
                )],
            };

            s.increment_round();
            let (bytes_received, bytes_sent, models_received) =
                s.take_round_counters();

            let row = AggregatorRound {
                round: s.round(),
                num_agents: s.num_agents(),
                global_recall: s.last_global_recall,
                aggregation_time_secs: aggregation_time.as_secs_f64(),
                models_received,
                bytes_received,
                bytes_sent,
                rounds_without_improvement: s
                    .judges
                    .rounds_without_improvement(),
                best_recall: (s.judges.best_recall() > 0.0)
                    .then(|| s.judges.best_recall()),
            };

            (push, row)
        };

        push_to_directory(&*channel, &conf, push).await;
        dir_call(
            &*channel,
            &conf,
            Message::new_update_barrier_state(BarrierState::Distributing),
        )
        .await;

        counter!("rotor_rounds_completed").increment(1);
        if let Ok(mut log) = metrics_log.lock() {
            if let Err(e) = log.log_round(&row) {
                warn!(event = "metrics_append_failed", err = %e);
            }
        }

        if !conf.polling {
            distribute_cluster(&*channel, &conf, &state).await;
        }

        // Rotation decision.
        let due = {
            let s = state.lock().await;
            s.cadence.due(s.round(), s.num_agents())
        };

        if due {
            dir_call(
                &*channel,
                &conf,
                Message::new_update_barrier_state(BarrierState::Rotation),
            )
            .await;

            // Let the agents catch up with the round that just closed
            // before the notice goes out.
            info!(event = "rotation_scheduled", delay = ?conf.rotation_delay);
            tokio::time::sleep(conf.rotation_delay).await;

            rotate(&conf, &state, &*channel).await;

            let mut s = state.lock().await;
            let round = s.round();
            s.cadence.rotated_at(round);
        } else {
            reset_barrier(&*channel, &conf).await;
        }
    }
}

/// Waits until every expected upload arrived or the aggregation timeout
/// elapsed; returns the number of buffered updates either way.
async fn wait_for_uploads(
    state: &Arc<Mutex<State>>,
    expected: usize,
    timeout: Duration,
) -> usize {
    let start = Instant::now();
    let mut last_log = start;

    loop {
        let buffered = state.lock().await.buffer_len();

        if buffered >= expected {
            info!(
                event = "barrier_complete",
                buffered,
                expected,
                elapsed = ?start.elapsed()
            );
            return buffered;
        }

        if start.elapsed() > timeout {
            warn!(event = "barrier_timeout", buffered, expected);
            return buffered;
        }

        if last_log.elapsed() >= BARRIER_LOG_INTERVAL {
            info!(
                event = "barrier_progress",
                buffered,
                expected,
                remaining = ?(timeout.saturating_sub(start.elapsed()))
            );
            last_log = Instant::now();
        }

        tokio::time::sleep(BARRIER_POLL_INTERVAL).await;
    }
}

/// Runs one rotation: local score draw, winner selection and notice
/// publication (polling) or direct delivery (push).
async fn rotate<C: Channel>(
    conf: &Params,
    state: &Arc<Mutex<State>>,
    channel: &C,
) {
    let (notice, self_is_winner, agents) = {
        let s = state.lock().await;

        let agents = s.agent_set().to_vec();
        if agents.is_empty() {
            warn!(event = "rotation_skipped", reason = "no agents");
            return;
        }

        // Fresh uniform scores for every participant and the aggregator
        // itself; these are local to this rotation.
        let mut rng = rand::thread_rng();
        let mut scores: Vec<(String, u8)> = agents
            .iter()
            .map(|a| (a.agent_id.clone(), draw_score(&mut rng)))
            .collect();
        scores.push((s.id.clone(), draw_score(&mut rng)));

        let Some((winner_id, winner_score)) = select_winner(&scores) else {
            return;
        };
        let winner_id = winner_id.to_string();

        let winner_ip = if winner_id == s.id {
            conf.advertise_ip.clone()
        } else {
            match agents.iter().find(|a| a.agent_id == winner_id) {
                Some(winner) => winner.ip.clone(),
                None => {
                    error!(
                        event = "rotation_aborted",
                        reason = "winner address unknown"
                    );
                    return;
                }
            }
        };

        info!(
            event = "rotation_winner",
            winner_id = %winner_id,
            winner_ip = %winner_ip,
            score = winner_score
        );

        let notice = payload::Rotation {
            winner_id: winner_id.clone(),
            winner_ip,
            winner_reg_port: conf.reg_port,
            model_id: s
                .latest_cluster_model_id()
                .unwrap_or_default()
                .to_string(),
            round: s.round(),
            model: s.cluster_model().cloned().unwrap_or_default(),
            scores,
        };

        (notice, winner_id == s.id, agents)
    };

    counter!("rotor_rotations").increment(1);

    if conf.polling {
        // The polling handler streams the notice out and performs the
        // hand-off once the notified set covers the agent set.
        state.lock().await.set_pending_rotation(notice);
        info!(event = "rotation_pending", mode = "polling");
        return;
    }

    // Push mode: deliver straight to every agent's push listener.
    let msg = Message::new_rotation(notice.clone());
    let mut delivered: HashSet<String> = HashSet::new();

    for attempt in 1..=ROTATION_PUSH_RETRIES {
        for agent in &agents {
            if delivered.contains(&agent.agent_id) {
                continue;
            }
            let Some(addr) =
                resolve(&format!("{}:{}", agent.ip, agent.exch_port))
            else {
                continue;
            };
            if channel.call(addr, &msg).await.is_some() {
                delivered.insert(agent.agent_id.clone());
            }
        }

        if delivered.len() == agents.len() {
            break;
        }
        debug!(
            event = "rotation_push_retry",
            attempt,
            delivered = delivered.len(),
            total = agents.len()
        );
        tokio::time::sleep(Duration::from_secs(2)).await;
    }

    if delivered.len() < agents.len() {
        // The winner (or some peer) is unreachable: the rotation is off and
        // this aggregator keeps its role.
        warn!(
            event = "rotation_cancelled",
            delivered = delivered.len(),
            total = agents.len()
        );
        return;
    }

    if self_is_winner {
        info!(event = "rotation_won", mode = "push");
        return;
    }

    crate::conf::request_role_change(
        &conf.config_path,
        Role::Agent,
        Some(&notice.winner_ip),
    );
}

/// Push-mode distribution of the freshly published cluster model.
async fn distribute_cluster<C: Channel>(
    channel: &C,
    conf: &Params,
    state: &Arc<Mutex<State>>,
) {
    let (msg, agents) = {
        let s = state.lock().await;
        let (Some(model), Some(model_id)) = (
            s.cluster_model().cloned(),
            s.latest_cluster_model_id().map(str::to_string),
        ) else {
            return;
        };

        let msg = Message::new_cluster_model(payload::ClusterModel {
            aggregator_id: s.id.clone(),
            model_id,
            round: s.round(),
            model,
        });
        (msg, s.agent_set().to_vec())
    };

    for agent in agents {
        let Some(addr) = resolve(&format!("{}:{}", agent.ip, agent.exch_port))
        else {
            continue;
        };
        if channel.call(addr, &msg).await.is_none() {
            warn!(event = "distribution_failed", agent_id = %agent.agent_id);
        }
    }
}

/// Fire-and-check call to the directory; a silent directory is logged and
/// tolerated, the round continues on in-memory state.
async fn dir_call<C: Channel>(
    channel: &C,
    conf: &Params,
    msg: Message,
) -> Option<Message> {
    let Some(addr) = resolve(&conf.db_addr()) else {
        warn!(event = "bad_directory_addr", addr = %conf.db_addr());
        return None;
    };

    let reply = channel.call(addr, &msg).await;
    if reply.is_none() {
        warn!(event = "directory_unreachable", topic = ?msg.topic());
    }
    reply
}

async fn reset_barrier<C: Channel>(channel: &C, conf: &Params) {
    dir_call(channel, conf, Message::from_marker(Payload::ResetBarrier))
        .await;
}

/// Pushes a model to the directory store.
pub(super) async fn push_to_directory<C: Channel>(
    channel: &C,
    conf: &Params,
    push: payload::PushModel,
) {
    let model_id = push.model_id.clone();
    match dir_call(channel, conf, Message::new_push_model(push)).await {
        Some(reply) if matches!(reply.payload, Payload::Confirmation) => {
            debug!(event = "model_pushed", model_id = %model_id);
        }
        _ => warn!(event = "model_push_unconfirmed", model_id = %model_id),
    }
}
