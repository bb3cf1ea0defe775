// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use std::sync::Arc;
use std::time::Duration;

use node_data::message::{payload, BarrierState, Message, Payload};
use node_data::model::{ModelSet, ModelType};
use rotor_node::directory::conf::Params;
use rotor_node::directory::{DirectoryHandler, DirectorySrv};
use rotor_node::network::RequestHandler;
use tempfile::TempDir;

async fn handler_with(ttl: Duration) -> (Arc<DirectoryHandler>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let conf = Params {
        model_path: dir.path().join("models"),
        agent_ttl: ttl,
        ..Default::default()
    };
    (DirectorySrv::in_memory(conf).await.unwrap(), dir)
}

async fn handler() -> (Arc<DirectoryHandler>, TempDir) {
    handler_with(Duration::from_secs(300)).await
}

async fn register(
    handler: &DirectoryHandler,
    agent_id: &str,
    ip: &str,
    score: u8,
) {
    let msg = Message::new_register_agent(payload::RegisterAgent {
        agent_id: agent_id.into(),
        ip: ip.into(),
        port: 8765,
        score,
    });
    let reply = handler.handle(msg).await.unwrap();
    assert!(matches!(reply.payload, Payload::Registered));
}

async fn agents_of(handler: &DirectoryHandler) -> Vec<(String, u8)> {
    match handler
        .handle(Message::from_marker(Payload::GetAllAgents))
        .await
        .unwrap()
        .payload
    {
        Payload::Agents(a) => a.scores,
        other => panic!("unexpected reply {other:?}"),
    }
}

fn sample_model() -> ModelSet {
    let mut model = ModelSet::new();
    model.insert("w", vec![1.0, 2.0]);
    model
}

#[tokio::test]
async fn registration_is_idempotent_per_address() {
    let (handler, _guard) = handler().await;

    // n registrations with the same (ip, port) yield exactly one row
    register(&handler, "id-1", "10.0.0.7", 10).await;
    register(&handler, "id-1", "10.0.0.7", 20).await;
    register(&handler, "id-1", "10.0.0.7", 30).await;

    let agents = agents_of(&handler).await;
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0], ("id-1".to_string(), 30));
}

#[tokio::test]
async fn restarted_agent_rewrites_its_row() {
    let (handler, _guard) = handler().await;

    // an agent restarts at the same address under a regenerated id
    register(&handler, "id-x", "10.0.0.7", 42).await;
    register(&handler, "id-y", "10.0.0.7", 77).await;

    let agents = agents_of(&handler).await;
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0], ("id-y".to_string(), 77));
}

#[tokio::test]
async fn election_picks_highest_score_and_stores_the_winner() {
    let (handler, _guard) = handler().await;

    register(&handler, "agent-a", "10.0.0.1", 40).await;
    register(&handler, "agent-b", "10.0.0.2", 70).await;
    register(&handler, "agent-c", "10.0.0.3", 55).await;

    let scores = agents_of(&handler).await;
    let reply = handler
        .handle(Message::new_elect_aggregator(scores))
        .await
        .unwrap();

    match reply.payload {
        Payload::Elected(e) => {
            assert_eq!(e.aggregator_id, "agent-b");
            assert_eq!(e.ip, "10.0.0.2");
            assert_eq!(e.score, 70);
        }
        other => panic!("unexpected reply {other:?}"),
    }

    // the singleton now points at the winner
    match handler
        .handle(Message::from_marker(Payload::GetAggregator))
        .await
        .unwrap()
        .payload
    {
        Payload::AggregatorInfo(info) => assert_eq!(info.ip, "10.0.0.2"),
        other => panic!("unexpected reply {other:?}"),
    }
}

#[tokio::test]
async fn tied_election_is_deterministic() {
    let (handler, _guard) = handler().await;

    register(&handler, "agent-a", "10.0.0.1", 80).await;
    register(&handler, "agent-c", "10.0.0.3", 80).await;

    // both agents run the election from the same snapshot
    for _ in 0..2 {
        let reply = handler
            .handle(Message::new_elect_aggregator(vec![
                ("agent-a".into(), 80),
                ("agent-c".into(), 80),
            ]))
            .await
            .unwrap();

        match reply.payload {
            // tie-break favors the lexicographically larger id
            Payload::Elected(e) => assert_eq!(e.aggregator_id, "agent-c"),
            other => panic!("unexpected reply {other:?}"),
        }
    }
}

#[tokio::test]
async fn election_failure_modes() {
    let (handler, _guard) = handler().await;

    let reply = handler
        .handle(Message::new_elect_aggregator(vec![]))
        .await
        .unwrap();
    match reply.payload {
        Payload::ElectionFailed(f) => assert_eq!(f.reason, "no_candidates"),
        other => panic!("unexpected reply {other:?}"),
    }

    // a winner the agents table does not know
    let reply = handler
        .handle(Message::new_elect_aggregator(vec![("ghost".into(), 99)]))
        .await
        .unwrap();
    match reply.payload {
        Payload::ElectionFailed(f) => assert_eq!(f.reason, "winner_not_found"),
        other => panic!("unexpected reply {other:?}"),
    }
}

#[tokio::test]
async fn update_and_clear_aggregator() {
    let (handler, _guard) = handler().await;

    let update = Message::new_update_aggregator(payload::AggregatorInfo {
        aggregator_id: "agg-1".into(),
        ip: "10.0.0.9".into(),
        port: 8765,
    });

    // n identical updates are one
    for _ in 0..3 {
        let reply = handler.handle(update.clone()).await.unwrap();
        assert!(matches!(reply.payload, Payload::Updated));
    }

    match handler
        .handle(Message::from_marker(Payload::GetAggregator))
        .await
        .unwrap()
        .payload
    {
        Payload::AggregatorInfo(info) => {
            assert_eq!(info.aggregator_id, "agg-1")
        }
        other => panic!("unexpected reply {other:?}"),
    }

    let reply = handler
        .handle(Message::from_marker(Payload::ClearAggregator))
        .await
        .unwrap();
    assert!(matches!(reply.payload, Payload::Cleared));

    // cleared directory reports no aggregator
    let reply = handler
        .handle(Message::from_marker(Payload::GetAggregator))
        .await
        .unwrap();
    assert!(matches!(reply.payload, Payload::NoAggregator));
}

#[tokio::test]
async fn pushed_models_land_in_store_and_blob_dir() {
    let (handler, guard) = handler().await;

    let push = Message::new_push_model(payload::PushModel {
        component_id: "agent-a".into(),
        round: 1,
        model_type: ModelType::Local,
        model: sample_model(),
        model_id: "agent-a-m1".into(),
        gen_time: 1_700_000_000,
        meta: vec![("accuracy".into(), 0.9), ("num_samples".into(), 12.0)],
    });
    let reply = handler.handle(push).await.unwrap();
    assert!(matches!(reply.payload, Payload::Confirmation));

    assert!(guard.path().join("models/agent-a-m1.blob").exists());

    let push = Message::new_push_model(payload::PushModel {
        component_id: "aggregator-b".into(),
        round: 1,
        model_type: ModelType::Cluster,
        model: sample_model(),
        model_id: "aggregator-b-m1".into(),
        gen_time: 1_700_000_100,
        meta: vec![("num_samples".into(), 24.0)],
    });
    let reply = handler.handle(push).await.unwrap();
    assert!(matches!(reply.payload, Payload::Confirmation));
    assert!(guard.path().join("models/aggregator-b-m1.blob").exists());
}

#[tokio::test]
async fn barrier_lifecycle() {
    let (handler, _guard) = handler().await;

    let reply = handler
        .handle(Message::new_init_barrier(payload::InitBarrier {
            round: 3,
            threshold: 2,
            aggregator_id: "agg-1".into(),
            state: BarrierState::WaitingModels,
        }))
        .await
        .unwrap();
    assert!(matches!(reply.payload, Payload::Confirmation));

    // local pushes count as barrier arrivals
    for agent in ["agent-a", "agent-b"] {
        let push = Message::new_push_model(payload::PushModel {
            component_id: agent.into(),
            round: 3,
            model_type: ModelType::Local,
            model: sample_model(),
            model_id: format!("{agent}-m3"),
            gen_time: 1_700_000_000,
            meta: vec![],
        });
        handler.handle(push).await.unwrap();
    }

    let barrier = handler.store().barrier().await.unwrap().unwrap();
    assert_eq!(barrier.current_round, 3);
    assert_eq!(barrier.state, BarrierState::WaitingModels);
    assert_eq!(barrier.models_received, 2);
    assert_eq!(barrier.agents_ready.len(), 2);

    handler
        .handle(Message::new_update_barrier_state(BarrierState::Distributing))
        .await
        .unwrap();
    let barrier = handler.store().barrier().await.unwrap().unwrap();
    assert_eq!(barrier.state, BarrierState::Distributing);

    handler
        .handle(Message::from_marker(Payload::ResetBarrier))
        .await
        .unwrap();
    let barrier = handler.store().barrier().await.unwrap().unwrap();
    assert!(barrier.agents_ready.is_empty());
}

#[tokio::test]
async fn stale_agents_are_evicted() {
    let (handler, _guard) = handler_with(Duration::from_secs(1)).await;

    register(&handler, "agent-old", "10.0.0.1", 10).await;
    tokio::time::sleep(Duration::from_millis(2500)).await;
    register(&handler, "agent-new", "10.0.0.2", 20).await;

    // the membership read runs the eviction pass
    let agents = agents_of(&handler).await;
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0].0, "agent-new");
}

#[tokio::test]
async fn unknown_kind_yields_error_reply() {
    let (handler, _guard) = handler().await;

    let reply = handler
        .handle(Message::new_polling(1, "agent-a"))
        .await
        .unwrap();
    assert!(matches!(reply.payload, Payload::Error(_)));
}
