// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use std::collections::HashSet;

use election::judge::{TerminationJudges, Verdict};
use election::winner::RotationCadence;
use node_data::message::payload;
use node_data::model::ModelSet;
use tracing::{info, warn};

/// One registered participant as the aggregator sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentEntry {
    pub agent_id: String,
    pub agent_name: String,
    pub ip: String,
    pub exch_port: u16,
}

/// The aggregator's round state. Shared across the listeners and the round
/// loop behind one coarse lock; every critical section is an append or a
/// snapshot.
pub struct State {
    pub id: String,

    round: u64,
    agent_set: Vec<AgentEntry>,

    /// Parameter template fixed by the first participant.
    template: Option<ModelSet>,

    /// Local updates buffered for the round being collected.
    buffer: Vec<ModelSet>,

    cluster_model: Option<ModelSet>,
    cluster_model_ids: Vec<String>,
    pub cluster_num_samples: i64,

    current_round_recalls: Vec<(String, f32)>,
    pub last_global_recall: Option<f64>,

    pending_rotation: Option<payload::Rotation>,
    rotation_notified: HashSet<String>,

    pending_termination: Option<payload::Termination>,
    training_terminated: bool,

    pub judges: TerminationJudges,
    pub cadence: RotationCadence,

    // per-round traffic accounting, drained into the metrics row
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub models_received: u32,
}

impl State {
    pub fn new(
        id: String,
        judges: TerminationJudges,
        cadence: RotationCadence,
    ) -> Self {
        Self {
            id,
            round: 0,
            agent_set: Vec::new(),
            template: None,
            buffer: Vec::new(),
            cluster_model: None,
            cluster_model_ids: Vec::new(),
            cluster_num_samples: 0,
            current_round_recalls: Vec::new(),
            last_global_recall: None,
            pending_rotation: None,
            rotation_notified: HashSet::new(),
            pending_termination: None,
            training_terminated: false,
            judges,
            cadence,
            bytes_received: 0,
            bytes_sent: 0,
            models_received: 0,
        }
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    /// Moves to the next round. The buffer empties with the increment so a
    /// straggler from the previous round can never leak into the next one.
    pub fn increment_round(&mut self) {
        self.round += 1;
        self.buffer.clear();
        info!(event = "round_incremented", round = self.round);
    }

    /// Adds or refreshes a participant. An entry with the same id, or the
    /// same `(ip, exch_port)` under a regenerated id, is replaced.
    pub fn add_agent(&mut self, entry: AgentEntry) {
        if let Some(slot) = self.agent_set.iter_mut().find(|a| {
            a.agent_id == entry.agent_id
                || (a.ip == entry.ip && a.exch_port == entry.exch_port)
        }) {
            *slot = entry;
        } else {
            self.agent_set.push(entry);
        }
    }

    pub fn agent_set(&self) -> &[AgentEntry] {
        &self.agent_set
    }

    pub fn num_agents(&self) -> usize {
        self.agent_set.len()
    }

    pub fn has_template(&self) -> bool {
        self.template.is_some()
    }

    /// Fixes the model shape from the very first participation message and
    /// seeds the global model, either with the participant's weights or
    /// with zeroed arrays of the same shape.
    pub fn initialize_model_info(
        &mut self,
        model: &ModelSet,
        init_weights: bool,
    ) {
        let seed = if init_weights {
            model.clone()
        } else {
            model.zeroed_like()
        };

        info!(
            event = "model_template_fixed",
            params = model.param_count(),
            init_weights
        );

        self.template = Some(model.zeroed_like());
        self.cluster_model = Some(seed);
    }

    pub fn buffer_update(&mut self, model: ModelSet) {
        self.buffer.push(model);
        self.models_received += 1;
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    /// Snapshot-and-clear of the buffered updates, taken under the same
    /// lock as the appends. Aggregation consumes the snapshot outside the
    /// critical section.
    pub fn take_buffer(&mut self) -> Vec<ModelSet> {
        std::mem::take(&mut self.buffer)
    }

    pub fn set_cluster_model(&mut self, model: ModelSet, model_id: String) {
        self.cluster_model = Some(model);
        self.cluster_model_ids.push(model_id);
    }

    pub fn cluster_model(&self) -> Option<&ModelSet> {
        self.cluster_model.as_ref()
    }

    pub fn latest_cluster_model_id(&self) -> Option<&str> {
        self.cluster_model_ids.last().map(String::as_str)
    }

    /// Records one agent's recall for the current round. Once every
    /// registered agent reported, the global recall (mean) is computed, the
    /// plateau judge fed and the map cleared.
    pub fn observe_recall(&mut self, agent_id: &str, recall: f32) -> Option<f64> {
        match self
            .current_round_recalls
            .iter_mut()
            .find(|(id, _)| id == agent_id)
        {
            Some((_, r)) => *r = recall,
            None => {
                self.current_round_recalls
                    .push((agent_id.to_string(), recall));
            }
        }

        let num_agents = self.num_agents();
        if num_agents == 0 || self.current_round_recalls.len() < num_agents {
            return None;
        }

        let global = self
            .current_round_recalls
            .iter()
            .map(|(_, r)| *r as f64)
            .sum::<f64>()
            / self.current_round_recalls.len() as f64;

        info!(event = "global_recall", round = self.round, recall = global);

        self.current_round_recalls.clear();
        self.last_global_recall = Some(global);
        self.judges.observe_recall(global);

        Some(global)
    }

    /// Runs the termination judges; when one fires, the pending termination
    /// notice is installed for the polling handler to stream out.
    ///
    /// The judges see completed rounds: the counter is one ahead of the
    /// last round whose cluster model went out, and that round must finish
    /// before the cap can fire.
    pub fn check_termination(&mut self) -> Option<Verdict> {
        if self.training_terminated {
            return None;
        }

        let verdict = self.judges.verdict(self.round.saturating_sub(1))?;
        self.training_terminated = true;
        self.pending_termination = Some(payload::Termination {
            reason: verdict.cause.reason().into(),
            final_round: verdict.final_round,
            final_recall: verdict.final_recall as f32,
        });

        warn!(
            event = "training_terminated",
            reason = verdict.cause.reason(),
            final_round = verdict.final_round
        );

        Some(verdict)
    }

    pub fn pending_termination(&self) -> Option<&payload::Termination> {
        self.pending_termination.as_ref()
    }

    pub fn training_terminated(&self) -> bool {
        self.training_terminated
    }

    /// Publishes a rotation notice and resets the notified set.
    pub fn set_pending_rotation(&mut self, notice: payload::Rotation) {
        self.pending_rotation = Some(notice);
        self.rotation_notified.clear();
    }

    pub fn pending_rotation(&self) -> Option<&payload::Rotation> {
        self.pending_rotation.as_ref()
    }

    pub fn clear_pending_rotation(&mut self) {
        self.pending_rotation = None;
        self.rotation_notified.clear();
    }

    /// Marks an agent as notified of the pending rotation; returns whether
    /// the full currently-registered set has now been handed the notice.
    pub fn mark_rotation_notified(&mut self, agent_id: &str) -> bool {
        self.rotation_notified.insert(agent_id.to_string());
        self.rotation_complete()
    }

    pub fn rotation_complete(&self) -> bool {
        self.agent_set
            .iter()
            .all(|a| self.rotation_notified.contains(&a.agent_id))
    }

    /// Drains the per-round traffic counters for the metrics row.
    pub fn take_round_counters(&mut self) -> (u64, u64, u32) {
        let out = (self.bytes_received, self.bytes_sent, self.models_received);
        self.bytes_received = 0;
        self.bytes_sent = 0;
        self.models_received = 0;
        out
    }
}

#[cfg(test)]
mod tests {
    use election::config::{
        DEFAULT_EARLY_STOPPING_MIN_DELTA, DEFAULT_EARLY_STOPPING_PATIENCE,
        DEFAULT_MAX_ROUNDS,
    };

    use super::*;

    fn state() -> State {
        State::new(
            "aggregator-x".into(),
            TerminationJudges::new(
                DEFAULT_MAX_ROUNDS,
                DEFAULT_EARLY_STOPPING_PATIENCE,
                DEFAULT_EARLY_STOPPING_MIN_DELTA,
            ),
            RotationCadence::new(1, 1),
        )
    }

    fn agent(id: &str, ip: &str) -> AgentEntry {
        AgentEntry {
            agent_id: id.into(),
            agent_name: id.into(),
            ip: ip.into(),
            exch_port: 7000,
        }
    }

    fn model() -> ModelSet {
        let mut m = ModelSet::new();
        m.insert("w", vec![1.0]);
        m
    }

    #[test]
    fn round_is_monotonic_and_clears_buffer() {
        let mut s = state();
        s.buffer_update(model());
        s.buffer_update(model());
        assert_eq!(s.buffer_len(), 2);

        let before = s.round();
        s.increment_round();
        assert_eq!(s.round(), before + 1);
        assert_eq!(s.buffer_len(), 0);
    }

    #[test]
    fn take_buffer_empties_the_buffer() {
        let mut s = state();
        s.buffer_update(model());
        let taken = s.take_buffer();
        assert_eq!(taken.len(), 1);
        assert_eq!(s.buffer_len(), 0);
    }

    #[test]
    fn duplicate_address_replaces_the_entry() {
        let mut s = state();
        s.add_agent(agent("old-id", "10.0.0.7"));
        s.add_agent(agent("new-id", "10.0.0.7"));

        assert_eq!(s.num_agents(), 1);
        assert_eq!(s.agent_set()[0].agent_id, "new-id");
    }

    #[test]
    fn recall_mean_fires_once_all_agents_report() {
        let mut s = state();
        s.add_agent(agent("a", "10.0.0.1"));
        s.add_agent(agent("b", "10.0.0.2"));

        assert_eq!(s.observe_recall("a", 0.6), None);
        let global = s.observe_recall("b", 0.8).expect("all reported");
        assert!((global - 0.7).abs() < 1e-6);

        // the map resets for the next round
        assert_eq!(s.observe_recall("a", 0.5), None);
    }

    #[test]
    fn rotation_set_completes_over_current_agents() {
        let mut s = state();
        s.add_agent(agent("a", "10.0.0.1"));
        s.add_agent(agent("b", "10.0.0.2"));
        s.set_pending_rotation(payload::Rotation::default());

        assert!(!s.mark_rotation_notified("a"));
        assert!(s.mark_rotation_notified("b"));

        s.clear_pending_rotation();
        assert!(s.pending_rotation().is_none());
    }

    #[test]
    fn zeroed_template_seed_when_init_weights_off() {
        let mut s = state();
        s.initialize_model_info(&model(), false);
        assert_eq!(s.cluster_model().unwrap().get("w"), Some(&[0.0f32][..]));

        let mut s = state();
        s.initialize_model_info(&model(), true);
        assert_eq!(s.cluster_model().unwrap().get("w"), Some(&[1.0f32][..]));
    }

    #[test]
    fn max_rounds_judge_fires_after_the_capped_round_completes() {
        let mut s = State::new(
            "aggregator-x".into(),
            TerminationJudges::new(2, 100, 0.001),
            RotationCadence::new(1, 1),
        );

        // participation opens round 1; two aggregations complete rounds 1
        // and 2
        s.increment_round();
        assert!(s.check_termination().is_none());
        s.increment_round();
        assert!(s.check_termination().is_none());
        s.increment_round();

        let verdict = s.check_termination().expect("cap reached");
        assert_eq!(verdict.final_round, 2);
        assert_eq!(
            s.pending_termination().unwrap().reason,
            "max_rounds_reached"
        );
        // a second check does not fire again
        assert!(s.check_termination().is_none());
    }
}
