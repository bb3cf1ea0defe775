// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use std::sync::Arc;
use std::time::Duration;

use node_data::message::{payload, Message, Payload};
use node_data::model::ModelSet;
use rotor_node::aggregator::conf::Params;
use rotor_node::aggregator::AggregatorSrv;
use rotor_node::directory::{conf::Params as DirParams, DirectorySrv};
use rotor_node::network::{serve, Channel, TcpChannel};
use rotor_node::trainer::MeanAggregate;
use rotor_node::LongLivedService;
use tokio::net::TcpListener;

/// Spins up an in-memory directory over TCP and returns its port.
async fn spawn_directory(dir: &tempfile::TempDir) -> u16 {
    let conf = DirParams {
        model_path: dir.path().join("models"),
        ..Default::default()
    };
    let handler = DirectorySrv::in_memory(conf).await.unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(serve(listener, handler, 16));
    port
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Starts an aggregator wired to a fresh directory; returns its conf and
/// the shared state handle.
async fn spawn_aggregator(
    dir: &tempfile::TempDir,
    max_rounds: u64,
) -> (
    Params,
    Arc<tokio::sync::Mutex<rotor_node::aggregator::state::State>>,
) {
    let db_port = spawn_directory(dir).await;

    let conf = Params {
        advertise_ip: "127.0.0.1".into(),
        reg_port: free_port().await,
        recv_port: free_port().await,
        db_ip: "127.0.0.1".into(),
        db_port,
        round_interval: Duration::from_millis(100),
        aggregation_timeout: Duration::from_secs(3),
        // rotation stays out of these runs
        rotation_min_rounds: u64::MAX,
        max_rounds,
        metrics_dir: dir.path().join("metrics"),
        config_path: dir.path().join("rotor.toml"),
        ..Default::default()
    };

    let mut srv = AggregatorSrv::new(conf.clone(), Arc::new(MeanAggregate))
        .expect("aggregator starts");
    let state = srv.state();

    let channel = Arc::new(TcpChannel::default());
    tokio::spawn(async move {
        LongLivedService::<TcpChannel>::execute(&mut srv, channel).await
    });

    // give the listeners a moment to bind
    tokio::time::sleep(Duration::from_millis(200)).await;
    (conf, state)
}

fn template() -> ModelSet {
    let mut model = ModelSet::new();
    model.insert("w", vec![2.0, 4.0]);
    model
}

async fn participate(
    channel: &TcpChannel,
    conf: &Params,
    agent_id: &str,
) -> payload::Welcome {
    let msg = Message::new_participate(payload::Participate {
        agent_name: agent_id.into(),
        agent_id: agent_id.into(),
        model_id: format!("{agent_id}-m0"),
        model: template(),
        init_weights: false,
        simulation: true,
        exch_port: 1,
        gen_time: 1_700_000_000,
        meta: vec![],
        agent_ip: "127.0.0.1".into(),
    });

    let addr = format!("127.0.0.1:{}", conf.reg_port).parse().unwrap();
    let reply = channel.call(addr, &msg).await.expect("welcome");
    match reply.payload {
        Payload::Welcome(w) => *w,
        other => panic!("unexpected reply {other:?}"),
    }
}

async fn poll(
    channel: &TcpChannel,
    conf: &Params,
    round: u64,
    agent_id: &str,
) -> Message {
    let addr = format!("127.0.0.1:{}", conf.recv_port).parse().unwrap();
    channel
        .call(addr, &Message::new_polling(round, agent_id))
        .await
        .expect("poll reply")
}

#[tokio::test]
async fn one_agent_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let (conf, _state) = spawn_aggregator(&dir, u64::MAX).await;
    let channel = TcpChannel::default();

    // the first handshake fixes the template and opens round 1
    let welcome = participate(&channel, &conf, "agent-a").await;
    assert_eq!(welcome.round, 1);
    assert_eq!(welcome.recv_port, conf.recv_port);

    // upload one local update
    let addr = format!("127.0.0.1:{}", conf.recv_port).parse().unwrap();
    let upload = Message::new_model_upload(payload::ModelUpload {
        agent_id: "agent-a".into(),
        model_id: "agent-a-m1".into(),
        model: template(),
        gen_time: 1_700_000_001,
        meta: vec![("accuracy".into(), 0.5), ("num_samples".into(), 8.0)],
    });
    let reply = channel.call(addr, &upload).await.expect("ack");
    assert!(matches!(reply.payload, Payload::Ack));

    // aggregation of a single update is the update itself
    let mut distributed = None;
    for _ in 0..50 {
        match poll(&channel, &conf, 1, "agent-a").await.payload {
            Payload::ClusterModel(cm) => {
                distributed = Some(cm);
                break;
            }
            Payload::Ack => {
                tokio::time::sleep(Duration::from_millis(100)).await
            }
            other => panic!("unexpected poll reply {other:?}"),
        }
    }

    let cm = distributed.expect("cluster model distributed");
    assert_eq!(cm.round, 2);
    assert_eq!(cm.model.get("w"), Some(&[2.0f32, 4.0][..]));
    assert!(!cm.model_id.is_empty());
}

#[tokio::test]
async fn max_rounds_produces_termination_reply() {
    let dir = tempfile::tempdir().unwrap();
    let (conf, _state) = spawn_aggregator(&dir, 1).await;
    let channel = TcpChannel::default();

    participate(&channel, &conf, "agent-a").await;

    let addr = format!("127.0.0.1:{}", conf.recv_port).parse().unwrap();
    let upload = Message::new_model_upload(payload::ModelUpload {
        agent_id: "agent-a".into(),
        model_id: "agent-a-m1".into(),
        model: template(),
        gen_time: 1_700_000_001,
        meta: vec![],
    });
    channel.call(addr, &upload).await.expect("ack");

    // round 1 completes, then the cap fires at the top of the next round
    let mut termination = None;
    for _ in 0..50 {
        match poll(&channel, &conf, 1, "agent-a").await.payload {
            Payload::Termination(t) => {
                termination = Some(t);
                break;
            }
            _ => tokio::time::sleep(Duration::from_millis(100)).await,
        }
    }

    let t = termination.expect("termination notice");
    assert_eq!(t.reason, "max_rounds_reached");
    assert_eq!(t.final_round, 1);
}

#[tokio::test]
async fn pending_rotation_streams_before_cluster_models() {
    let dir = tempfile::tempdir().unwrap();
    let (conf, state) = spawn_aggregator(&dir, u64::MAX).await;
    let channel = TcpChannel::default();

    participate(&channel, &conf, "agent-a").await;

    // a self-won rotation: the notice streams out, then clears once the
    // whole agent set has been notified
    {
        let mut s = state.lock().await;
        let winner_id = s.id.clone();
        s.set_pending_rotation(payload::Rotation {
            winner_id,
            winner_ip: "127.0.0.1".into(),
            winner_reg_port: conf.reg_port,
            model_id: String::new(),
            round: 1,
            model: ModelSet::default(),
            scores: vec![("agent-a".into(), 40)],
        });
    }

    match poll(&channel, &conf, 1, "agent-a").await.payload {
        Payload::Rotation(r) => assert_eq!(r.winner_ip, "127.0.0.1"),
        other => panic!("unexpected poll reply {other:?}"),
    }

    // every registered agent has been handed the notice and the winner is
    // this aggregator itself: pending state is gone
    assert!(state.lock().await.pending_rotation().is_none());

    match poll(&channel, &conf, 1, "agent-a").await.payload {
        Payload::Rotation(_) => panic!("rotation must be cleared"),
        _ => {}
    }
}

#[tokio::test]
async fn recall_uploads_drive_the_plateau_judge() {
    let dir = tempfile::tempdir().unwrap();
    let (conf, state) = spawn_aggregator(&dir, u64::MAX).await;
    let channel = TcpChannel::default();

    participate(&channel, &conf, "agent-a").await;

    let addr = format!("127.0.0.1:{}", conf.recv_port).parse().unwrap();
    let recall =
        Message::new_recall_upload(0.75, 1, "agent-a");
    let reply = channel.call(addr, &recall).await.expect("ack");
    assert!(matches!(reply.payload, Payload::Ack));

    let s = state.lock().await;
    assert!((s.judges.best_recall() - 0.75).abs() < 1e-6);
}
