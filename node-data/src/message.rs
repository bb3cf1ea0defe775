// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use std::io::{self, Read, Write};
use std::net::SocketAddr;

use crate::Serializable;

/// Message definition
#[derive(Debug, Default, Clone)]
pub struct Message {
    pub payload: Payload,

    pub metadata: Option<Metadata>,
}

/// Transport-related properties attached by the channel layer on receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub src_addr: SocketAddr,
}

impl Serializable for Message {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&[self.topic() as u8])?;

        match &self.payload {
            Payload::PushModel(p) => p.write(w),
            Payload::RegisterAgent(p) => p.write(w),
            Payload::ElectAggregator(p) => p.write(w),
            Payload::UpdateAggregator(p) => p.write(w),
            Payload::InitBarrier(p) => p.write(w),
            Payload::UpdateBarrierState(p) => p.write(w),
            Payload::AggregatorInfo(p) => p.write(w),
            Payload::Elected(p) => p.write(w),
            Payload::ElectionFailed(p) => p.write(w),
            Payload::AgentsCount(p) => p.write(w),
            Payload::Agents(p) => p.write(w),
            Payload::Participate(p) => p.write(w),
            Payload::ModelUpload(p) => p.write(w),
            Payload::Polling(p) => p.write(w),
            Payload::RecallUpload(p) => p.write(w),
            Payload::Welcome(p) => p.write(w),
            Payload::ClusterModel(p) => p.write(w),
            Payload::Rotation(p) => p.write(w),
            Payload::Termination(p) => p.write(w),
            Payload::Error(p) => p.write(w),
            // marker kinds carry no fields beyond the topic byte
            Payload::GetAggregator
            | Payload::ClearAggregator
            | Payload::GetAgentsCount
            | Payload::GetAllAgents
            | Payload::ResetBarrier
            | Payload::Confirmation
            | Payload::Registered
            | Payload::NoAggregator
            | Payload::Updated
            | Payload::Cleared
            | Payload::Ack
            | Payload::Empty => Ok(()),
        }
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self>
    where
        Self: Sized,
    {
        // Read topic
        let mut buf = [0u8; 1];
        r.read_exact(&mut buf)?;

        let topic = Topics::from(buf[0]);
        if topic == Topics::Unknown {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Unknown topic",
            ));
        }

        let payload = match topic {
            Topics::PushModel => {
                Payload::PushModel(Box::new(payload::PushModel::read(r)?))
            }
            Topics::RegisterAgent => {
                Payload::RegisterAgent(payload::RegisterAgent::read(r)?)
            }
            Topics::GetAggregator => Payload::GetAggregator,
            Topics::ElectAggregator => {
                Payload::ElectAggregator(payload::ElectAggregator::read(r)?)
            }
            Topics::UpdateAggregator => {
                Payload::UpdateAggregator(payload::AggregatorInfo::read(r)?)
            }
            Topics::ClearAggregator => Payload::ClearAggregator,
            Topics::GetAgentsCount => Payload::GetAgentsCount,
            Topics::GetAllAgents => Payload::GetAllAgents,
            Topics::InitBarrier => {
                Payload::InitBarrier(payload::InitBarrier::read(r)?)
            }
            Topics::UpdateBarrierState => Payload::UpdateBarrierState(
                payload::UpdateBarrierState::read(r)?,
            ),
            Topics::ResetBarrier => Payload::ResetBarrier,
            Topics::Confirmation => Payload::Confirmation,
            Topics::Registered => Payload::Registered,
            Topics::Aggregator => {
                Payload::AggregatorInfo(payload::AggregatorInfo::read(r)?)
            }
            Topics::NoAggregator => Payload::NoAggregator,
            Topics::Elected => Payload::Elected(payload::Elected::read(r)?),
            Topics::ElectionFailed => {
                Payload::ElectionFailed(payload::ElectionFailed::read(r)?)
            }
            Topics::Updated => Payload::Updated,
            Topics::Cleared => Payload::Cleared,
            Topics::AgentsCount => {
                Payload::AgentsCount(payload::AgentsCount::read(r)?)
            }
            Topics::Agents => Payload::Agents(payload::Agents::read(r)?),
            Topics::Participate => {
                Payload::Participate(Box::new(payload::Participate::read(r)?))
            }
            Topics::ModelUpload => {
                Payload::ModelUpload(Box::new(payload::ModelUpload::read(r)?))
            }
            Topics::Polling => Payload::Polling(payload::Polling::read(r)?),
            Topics::RecallUpload => {
                Payload::RecallUpload(payload::RecallUpload::read(r)?)
            }
            Topics::Welcome => {
                Payload::Welcome(Box::new(payload::Welcome::read(r)?))
            }
            Topics::ClusterModel => Payload::ClusterModel(Box::new(
                payload::ClusterModel::read(r)?,
            )),
            Topics::Ack => Payload::Ack,
            Topics::Rotation => {
                Payload::Rotation(Box::new(payload::Rotation::read(r)?))
            }
            Topics::Termination => {
                Payload::Termination(payload::Termination::read(r)?)
            }
            Topics::Error => Payload::Error(payload::ErrorReply::read(r)?),
            Topics::Unknown => Payload::Empty,
        };

        Ok(Message {
            payload,
            metadata: Default::default(),
        })
    }
}

impl Message {
    pub fn topic(&self) -> Topics {
        match &self.payload {
            Payload::PushModel(_) => Topics::PushModel,
            Payload::RegisterAgent(_) => Topics::RegisterAgent,
            Payload::GetAggregator => Topics::GetAggregator,
            Payload::ElectAggregator(_) => Topics::ElectAggregator,
            Payload::UpdateAggregator(_) => Topics::UpdateAggregator,
            Payload::ClearAggregator => Topics::ClearAggregator,
            Payload::GetAgentsCount => Topics::GetAgentsCount,
            Payload::GetAllAgents => Topics::GetAllAgents,
            Payload::InitBarrier(_) => Topics::InitBarrier,
            Payload::UpdateBarrierState(_) => Topics::UpdateBarrierState,
            Payload::ResetBarrier => Topics::ResetBarrier,
            Payload::Confirmation => Topics::Confirmation,
            Payload::Registered => Topics::Registered,
            Payload::AggregatorInfo(_) => Topics::Aggregator,
            Payload::NoAggregator => Topics::NoAggregator,
            Payload::Elected(_) => Topics::Elected,
            Payload::ElectionFailed(_) => Topics::ElectionFailed,
            Payload::Updated => Topics::Updated,
            Payload::Cleared => Topics::Cleared,
            Payload::AgentsCount(_) => Topics::AgentsCount,
            Payload::Agents(_) => Topics::Agents,
            Payload::Participate(_) => Topics::Participate,
            Payload::ModelUpload(_) => Topics::ModelUpload,
            Payload::Polling(_) => Topics::Polling,
            Payload::RecallUpload(_) => Topics::RecallUpload,
            Payload::Welcome(_) => Topics::Welcome,
            Payload::ClusterModel(_) => Topics::ClusterModel,
            Payload::Ack => Topics::Ack,
            Payload::Rotation(_) => Topics::Rotation,
            Payload::Termination(_) => Topics::Termination,
            Payload::Error(_) => Topics::Error,
            Payload::Empty => Topics::Unknown,
        }
    }

    /// Creates topics.Polling message
    pub fn new_polling(round: u64, agent_id: impl Into<String>) -> Message {
        Self {
            payload: Payload::Polling(payload::Polling {
                round,
                agent_id: agent_id.into(),
            }),
            ..Default::default()
        }
    }

    /// Creates topics.ModelUpload message
    pub fn new_model_upload(p: payload::ModelUpload) -> Message {
        Self {
            payload: Payload::ModelUpload(Box::new(p)),
            ..Default::default()
        }
    }

    /// Creates topics.Participate message
    pub fn new_participate(p: payload::Participate) -> Message {
        Self {
            payload: Payload::Participate(Box::new(p)),
            ..Default::default()
        }
    }

    /// Creates topics.RecallUpload message
    pub fn new_recall_upload(
        recall: f32,
        round: u64,
        agent_id: impl Into<String>,
    ) -> Message {
        Self {
            payload: Payload::RecallUpload(payload::RecallUpload {
                recall,
                round,
                agent_id: agent_id.into(),
            }),
            ..Default::default()
        }
    }

    /// Creates topics.Welcome message
    pub fn new_welcome(p: payload::Welcome) -> Message {
        Self {
            payload: Payload::Welcome(Box::new(p)),
            ..Default::default()
        }
    }

    /// Creates topics.ClusterModel message
    pub fn new_cluster_model(p: payload::ClusterModel) -> Message {
        Self {
            payload: Payload::ClusterModel(Box::new(p)),
            ..Default::default()
        }
    }

    /// Creates topics.Rotation message
    pub fn new_rotation(p: payload::Rotation) -> Message {
        Self {
            payload: Payload::Rotation(Box::new(p)),
            ..Default::default()
        }
    }

    /// Creates topics.Termination message
    pub fn new_termination(p: payload::Termination) -> Message {
        Self {
            payload: Payload::Termination(p),
            ..Default::default()
        }
    }

    /// Creates topics.PushModel message
    pub fn new_push_model(p: payload::PushModel) -> Message {
        Self {
            payload: Payload::PushModel(Box::new(p)),
            ..Default::default()
        }
    }

    /// Creates topics.RegisterAgent message
    pub fn new_register_agent(p: payload::RegisterAgent) -> Message {
        Self {
            payload: Payload::RegisterAgent(p),
            ..Default::default()
        }
    }

    /// Creates topics.ElectAggregator message
    pub fn new_elect_aggregator(scores: Vec<(String, u8)>) -> Message {
        Self {
            payload: Payload::ElectAggregator(payload::ElectAggregator {
                scores,
            }),
            ..Default::default()
        }
    }

    /// Creates topics.UpdateAggregator message
    pub fn new_update_aggregator(p: payload::AggregatorInfo) -> Message {
        Self {
            payload: Payload::UpdateAggregator(p),
            ..Default::default()
        }
    }

    /// Creates topics.InitBarrier message
    pub fn new_init_barrier(p: payload::InitBarrier) -> Message {
        Self {
            payload: Payload::InitBarrier(p),
            ..Default::default()
        }
    }

    /// Creates topics.UpdateBarrierState message
    pub fn new_update_barrier_state(state: BarrierState) -> Message {
        Self {
            payload: Payload::UpdateBarrierState(
                payload::UpdateBarrierState { state },
            ),
            ..Default::default()
        }
    }

    /// Creates topics.Error message
    pub fn new_error(reason: impl Into<String>) -> Message {
        Self {
            payload: Payload::Error(payload::ErrorReply {
                reason: reason.into(),
            }),
            ..Default::default()
        }
    }

    /// Creates a message carrying a marker payload only.
    pub fn from_marker(payload: Payload) -> Message {
        Self {
            payload,
            metadata: None,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub enum Payload {
    // node -> directory requests
    PushModel(Box<payload::PushModel>),
    RegisterAgent(payload::RegisterAgent),
    GetAggregator,
    ElectAggregator(payload::ElectAggregator),
    UpdateAggregator(payload::AggregatorInfo),
    ClearAggregator,
    GetAgentsCount,
    GetAllAgents,
    InitBarrier(payload::InitBarrier),
    UpdateBarrierState(payload::UpdateBarrierState),
    ResetBarrier,

    // directory -> node replies
    Confirmation,
    Registered,
    AggregatorInfo(payload::AggregatorInfo),
    NoAggregator,
    Elected(payload::Elected),
    ElectionFailed(payload::ElectionFailed),
    Updated,
    Cleared,
    AgentsCount(payload::AgentsCount),
    Agents(payload::Agents),

    // agent -> aggregator
    Participate(Box<payload::Participate>),
    ModelUpload(Box<payload::ModelUpload>),
    Polling(payload::Polling),
    RecallUpload(payload::RecallUpload),

    // aggregator -> agent
    Welcome(Box<payload::Welcome>),
    ClusterModel(Box<payload::ClusterModel>),
    Ack,
    Rotation(Box<payload::Rotation>),
    Termination(payload::Termination),

    // any peer
    Error(payload::ErrorReply),

    #[default]
    Empty,
}

/// Barrier phase as recorded in the directory's round_barrier singleton.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BarrierState {
    #[default]
    Registration = 0,
    WaitingModels = 1,
    Distributing = 2,
    Rotation = 3,
    Idle = 4,
}

impl BarrierState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BarrierState::Registration => "registration",
            BarrierState::WaitingModels => "waiting_models",
            BarrierState::Distributing => "distributing",
            BarrierState::Rotation => "rotation",
            BarrierState::Idle => "idle",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "registration" => Some(BarrierState::Registration),
            "waiting_models" => Some(BarrierState::WaitingModels),
            "distributing" => Some(BarrierState::Distributing),
            "rotation" => Some(BarrierState::Rotation),
            "idle" => Some(BarrierState::Idle),
            _ => None,
        }
    }
}

impl TryFrom<u8> for BarrierState {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, u8> {
        match v {
            0 => Ok(BarrierState::Registration),
            1 => Ok(BarrierState::WaitingModels),
            2 => Ok(BarrierState::Distributing),
            3 => Ok(BarrierState::Rotation),
            4 => Ok(BarrierState::Idle),
            n => Err(n),
        }
    }
}

pub mod payload {
    use super::*;
    use crate::model::{ModelSet, ModelType};

    /// Model push from a node to the directory store.
    #[derive(Debug, Clone, Default)]
    pub struct PushModel {
        pub component_id: String,
        pub round: u64,
        pub model_type: ModelType,
        pub model: ModelSet,
        pub model_id: String,
        pub gen_time: u64,
        pub meta: Vec<(String, f64)>,
    }

    impl PushModel {
        pub fn meta_value(&self, key: &str) -> Option<f64> {
            self.meta
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| *v)
        }
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct RegisterAgent {
        pub agent_id: String,
        pub ip: String,
        pub port: u16,
        pub score: u8,
    }

    #[derive(Debug, Clone, Default)]
    pub struct ElectAggregator {
        pub scores: Vec<(String, u8)>,
    }

    /// Current-aggregator record, used both as the `update_aggregator`
    /// request body and the `aggregator` reply body.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct AggregatorInfo {
        pub aggregator_id: String,
        pub ip: String,
        pub port: u16,
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct Elected {
        pub aggregator_id: String,
        pub ip: String,
        pub port: u16,
        pub score: u8,
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct ElectionFailed {
        pub reason: String,
    }

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct AgentsCount {
        pub count: u32,
    }

    #[derive(Debug, Clone, Default)]
    pub struct Agents {
        pub scores: Vec<(String, u8)>,
    }

    #[derive(Debug, Clone, Default)]
    pub struct InitBarrier {
        pub round: u64,
        pub threshold: u32,
        pub aggregator_id: String,
        pub state: BarrierState,
    }

    #[derive(Debug, Clone, Copy, Default)]
    pub struct UpdateBarrierState {
        pub state: BarrierState,
    }

    /// Participation handshake sent to the aggregator's registration port.
    #[derive(Debug, Clone, Default)]
    pub struct Participate {
        pub agent_name: String,
        pub agent_id: String,
        pub model_id: String,
        pub model: ModelSet,
        pub init_weights: bool,
        pub simulation: bool,
        pub exch_port: u16,
        pub gen_time: u64,
        pub meta: Vec<(String, f64)>,
        pub agent_ip: String,
    }

    #[derive(Debug, Clone, Default)]
    pub struct ModelUpload {
        pub agent_id: String,
        pub model_id: String,
        pub model: ModelSet,
        pub gen_time: u64,
        pub meta: Vec<(String, f64)>,
    }

    impl ModelUpload {
        pub fn meta_value(&self, key: &str) -> Option<f64> {
            self.meta
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| *v)
        }
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct Polling {
        pub round: u64,
        pub agent_id: String,
    }

    #[derive(Debug, Clone, Default)]
    pub struct RecallUpload {
        pub recall: f32,
        pub round: u64,
        pub agent_id: String,
    }

    /// Welcome reply to a participation handshake.
    #[derive(Debug, Clone, Default)]
    pub struct Welcome {
        pub aggregator_id: String,
        pub model_id: String,
        pub model: ModelSet,
        pub round: u64,
        pub agent_id: String,
        pub exch_port: u16,
        pub recv_port: u16,
        pub aggregator_ip: String,
    }

    #[derive(Debug, Clone, Default)]
    pub struct ClusterModel {
        pub aggregator_id: String,
        pub model_id: String,
        pub round: u64,
        pub model: ModelSet,
    }

    /// Rotation notice streamed to every registered agent before hand-off.
    #[derive(Debug, Clone, Default)]
    pub struct Rotation {
        pub winner_id: String,
        pub winner_ip: String,
        pub winner_reg_port: u16,
        pub model_id: String,
        pub round: u64,
        pub model: ModelSet,
        pub scores: Vec<(String, u8)>,
    }

    #[derive(Debug, Clone, Default)]
    pub struct Termination {
        pub reason: String,
        pub final_round: u64,
        pub final_recall: f32,
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct ErrorReply {
        pub reason: String,
    }
}

macro_rules! map_topic {
    ($v:expr, $enum_v:expr) => {
        if $v == $enum_v as u8 {
            return $enum_v;
        }
    };
}

#[derive(Debug, Clone, PartialEq, Eq, Copy, Default)]
pub enum Topics {
    // Directory request topics
    PushModel = 0,
    RegisterAgent = 1,
    GetAggregator = 2,
    ElectAggregator = 3,
    UpdateAggregator = 4,
    ClearAggregator = 5,
    GetAgentsCount = 6,
    GetAllAgents = 7,
    InitBarrier = 8,
    UpdateBarrierState = 9,
    ResetBarrier = 10,

    // Directory reply topics
    Confirmation = 16,
    Registered = 17,
    Aggregator = 18,
    NoAggregator = 19,
    Elected = 20,
    ElectionFailed = 21,
    Updated = 22,
    Cleared = 23,
    AgentsCount = 24,
    Agents = 25,

    // Agent-to-aggregator topics
    Participate = 32,
    ModelUpload = 33,
    Polling = 34,
    RecallUpload = 35,

    // Aggregator-to-agent topics
    Welcome = 48,
    ClusterModel = 49,
    Ack = 50,
    Rotation = 51,
    Termination = 52,

    Error = 254,

    #[default]
    Unknown = 255,
}

impl From<u8> for Topics {
    fn from(v: u8) -> Self {
        map_topic!(v, Topics::PushModel);
        map_topic!(v, Topics::RegisterAgent);
        map_topic!(v, Topics::GetAggregator);
        map_topic!(v, Topics::ElectAggregator);
        map_topic!(v, Topics::UpdateAggregator);
        map_topic!(v, Topics::ClearAggregator);
        map_topic!(v, Topics::GetAgentsCount);
        map_topic!(v, Topics::GetAllAgents);
        map_topic!(v, Topics::InitBarrier);
        map_topic!(v, Topics::UpdateBarrierState);
        map_topic!(v, Topics::ResetBarrier);
        map_topic!(v, Topics::Confirmation);
        map_topic!(v, Topics::Registered);
        map_topic!(v, Topics::Aggregator);
        map_topic!(v, Topics::NoAggregator);
        map_topic!(v, Topics::Elected);
        map_topic!(v, Topics::ElectionFailed);
        map_topic!(v, Topics::Updated);
        map_topic!(v, Topics::Cleared);
        map_topic!(v, Topics::AgentsCount);
        map_topic!(v, Topics::Agents);
        map_topic!(v, Topics::Participate);
        map_topic!(v, Topics::ModelUpload);
        map_topic!(v, Topics::Polling);
        map_topic!(v, Topics::RecallUpload);
        map_topic!(v, Topics::Welcome);
        map_topic!(v, Topics::ClusterModel);
        map_topic!(v, Topics::Ack);
        map_topic!(v, Topics::Rotation);
        map_topic!(v, Topics::Termination);
        map_topic!(v, Topics::Error);

        Topics::Unknown
    }
}

impl From<Topics> for u8 {
    fn from(t: Topics) -> Self {
        t as u8
    }
}
