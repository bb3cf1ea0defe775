// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

//! Seams toward the ML application.
//!
//! The coordination core never looks inside a model: training, aggregation
//! math and evaluation are injected behind these traits at construction.

use async_trait::async_trait;
use node_data::model::ModelSet;

/// Evaluation figures the application reports after a training pass.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Evaluation {
    pub accuracy: f64,
    pub recall: f64,
    pub num_samples: u64,
}

/// Outcome of one local training pass.
#[derive(Debug, Clone, Default)]
pub struct TrainOutcome {
    pub model: ModelSet,
    pub evaluation: Evaluation,
}

/// The agent-side training callback, owned by the ML application.
#[async_trait]
pub trait TrainerHandle: Send + Sync + 'static {
    /// An untrained model of the application's shape. Sent with the
    /// participation handshake; the first participant's template fixes the
    /// model shape for the whole federation.
    async fn initial_model(&self) -> anyhow::Result<ModelSet>;

    /// Consumes the latest global model and produces a trained local model
    /// with its evaluation.
    async fn train(&self, global: &ModelSet) -> anyhow::Result<TrainOutcome>;
}

/// The aggregator-side aggregation callback.
pub trait AggregateFn: Send + Sync + 'static {
    fn aggregate(&self, updates: &[ModelSet]) -> anyhow::Result<ModelSet>;
}

/// Element-wise mean over all buffered updates. The bring-up default; real
/// deployments inject their own weighting.
#[derive(Debug, Default, Clone, Copy)]
pub struct MeanAggregate;

impl AggregateFn for MeanAggregate {
    fn aggregate(&self, updates: &[ModelSet]) -> anyhow::Result<ModelSet> {
        let first = updates
            .first()
            .ok_or_else(|| anyhow::anyhow!("no updates to aggregate"))?;

        let mut out = Vec::with_capacity(first.len());
        for (name, values) in first.iter() {
            let mut acc = vec![0.0f64; values.len()];
            let mut contributors = 0usize;

            for update in updates {
                let Some(arr) = update.get(name) else {
                    anyhow::bail!("update is missing parameter {name}");
                };
                if arr.len() != values.len() {
                    anyhow::bail!("parameter {name} has a mismatched shape");
                }
                for (a, v) in acc.iter_mut().zip(arr) {
                    *a += *v as f64;
                }
                contributors += 1;
            }

            let mean: Vec<f32> = acc
                .into_iter()
                .map(|a| (a / contributors as f64) as f32)
                .collect();
            out.push((name.to_string(), mean));
        }

        Ok(ModelSet::from_entries(out))
    }
}

/// Trainer that hands the global model straight back. Used in tests and to
/// bring a federation up before the real application is wired in.
#[derive(Debug, Clone, Copy)]
pub struct EchoTrainer {
    pub evaluation: Evaluation,
}

impl Default for EchoTrainer {
    fn default() -> Self {
        Self {
            evaluation: Evaluation {
                accuracy: 0.0,
                recall: 0.0,
                num_samples: 1,
            },
        }
    }
}

#[async_trait]
impl TrainerHandle for EchoTrainer {
    async fn initial_model(&self) -> anyhow::Result<ModelSet> {
        let mut model = ModelSet::new();
        model.insert("dense.weight", vec![0.0; 4]);
        model.insert("dense.bias", vec![0.0]);
        Ok(model)
    }

    async fn train(&self, global: &ModelSet) -> anyhow::Result<TrainOutcome> {
        Ok(TrainOutcome {
            model: global.clone(),
            evaluation: self.evaluation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(values: &[f32]) -> ModelSet {
        let mut set = ModelSet::new();
        set.insert("w", values.to_vec());
        set
    }

    #[test]
    fn mean_of_three_updates() {
        let updates = vec![
            model(&[1.0, 4.0]),
            model(&[2.0, 5.0]),
            model(&[3.0, 6.0]),
        ];

        let out = MeanAggregate.aggregate(&updates).unwrap();
        assert_eq!(out.get("w"), Some(&[2.0f32, 5.0][..]));
    }

    #[test]
    fn mismatched_shape_is_an_error() {
        let updates = vec![model(&[1.0, 2.0]), model(&[1.0])];
        assert!(MeanAggregate.aggregate(&updates).is_err());
    }

    #[test]
    fn empty_buffer_is_an_error() {
        assert!(MeanAggregate.aggregate(&[]).is_err());
    }
}
