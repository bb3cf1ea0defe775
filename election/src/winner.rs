// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use rand::Rng;

use crate::config::{SCORE_MAX, SCORE_MIN};

// The selection rule must hold across independent callers: the directory
// applies it to submitted registration scores, the rotating aggregator to
// locally drawn ones, and any agent re-checking an election result to the
// same snapshot. Ties break toward the lexicographically larger agent id.

/// Picks the election winner from a scores map.
///
/// Returns the winning `(agent_id, score)` pair, or `None` when the map is
/// empty.
pub fn select_winner(scores: &[(String, u8)]) -> Option<(&str, u8)> {
    scores
        .iter()
        .max_by(|(a_id, a_score), (b_id, b_score)| {
            a_score.cmp(b_score).then_with(|| a_id.cmp(b_id))
        })
        .map(|(id, score)| (id.as_str(), *score))
}

/// Draws a fresh election score, uniform over the score range.
pub fn draw_score<R: Rng + ?Sized>(rng: &mut R) -> u8 {
    rng.gen_range(SCORE_MIN..=SCORE_MAX)
}

/// Rotation cadence decision carried by the aggregator's round loop.
#[derive(Debug, Clone, Copy)]
pub struct RotationCadence {
    pub min_rounds: u64,
    pub interval: u64,
    last_rotation_round: u64,
}

impl RotationCadence {
    pub fn new(min_rounds: u64, interval: u64) -> Self {
        Self {
            min_rounds,
            interval,
            last_rotation_round: 0,
        }
    }

    /// Whether the round just completed should trigger a rotation.
    pub fn due(&self, round: u64, num_agents: usize) -> bool {
        round >= self.min_rounds
            && round - self.last_rotation_round >= self.interval
            && num_agents > 0
    }

    /// Records a completed rotation at the given round.
    pub fn rotated_at(&mut self, round: u64) {
        self.last_rotation_round = round;
    }

    pub fn last_rotation_round(&self) -> u64 {
        self.last_rotation_round
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    fn scores(pairs: &[(&str, u8)]) -> Vec<(String, u8)> {
        pairs.iter().map(|(id, s)| (id.to_string(), *s)).collect()
    }

    #[test]
    fn highest_score_wins() {
        let map = scores(&[("a", 40), ("b", 70), ("c", 55)]);
        assert_eq!(select_winner(&map), Some(("b", 70)));
    }

    #[test]
    fn tie_breaks_toward_larger_id() {
        let map = scores(&[("agent-a", 80), ("agent-b", 10), ("agent-c", 80)]);
        assert_eq!(select_winner(&map), Some(("agent-c", 80)));
    }

    #[test]
    fn winner_is_order_independent() {
        let forward = scores(&[("x", 12), ("y", 99), ("z", 99)]);
        let mut reversed = forward.clone();
        reversed.reverse();

        let a = select_winner(&forward).map(|(id, _)| id.to_string());
        let b = select_winner(&reversed).map(|(id, _)| id.to_string());
        assert_eq!(a, b);
        assert_eq!(a.as_deref(), Some("z"));
    }

    #[test]
    fn empty_map_elects_nobody() {
        assert_eq!(select_winner(&[]), None);
    }

    #[test]
    fn drawn_scores_stay_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1000 {
            let s = draw_score(&mut rng);
            assert!((SCORE_MIN..=SCORE_MAX).contains(&s));
        }
    }

    #[test]
    fn cadence_honors_min_rounds_and_interval() {
        let mut cadence = RotationCadence::new(3, 2);

        assert!(!cadence.due(1, 4));
        assert!(!cadence.due(2, 4));
        assert!(cadence.due(3, 4));

        cadence.rotated_at(3);
        assert!(!cadence.due(4, 4));
        assert!(cadence.due(5, 4));
    }

    #[test]
    fn cadence_never_fires_without_agents() {
        let cadence = RotationCadence::new(1, 1);
        assert!(!cadence.due(10, 0));
    }
}
