// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

//! Wire form of every protocol payload.
//!
//! Each message kind is a fixed positional field sequence behind its topic
//! byte. Strings and arrays are length-prefixed; integers are little-endian.

use std::io::{self, Read, Write};

use crate::message::{payload, BarrierState};
use crate::model::{ModelSet, ModelType};
use crate::Serializable;

fn write_meta<W: Write>(
    w: &mut W,
    meta: &[(String, f64)],
) -> io::Result<()> {
    w.write_all(&(meta.len() as u32).to_le_bytes())?;
    for (key, value) in meta {
        <payload::PushModel as Serializable>::write_str(w, key)?;
        w.write_all(&value.to_le_bytes())?;
    }
    Ok(())
}

fn read_meta<R: Read>(r: &mut R) -> io::Result<Vec<(String, f64)>> {
    let len = <payload::PushModel as Serializable>::read_u32_le(r)?;

    (0..len)
        .map(|_| {
            let key = <payload::PushModel as Serializable>::read_str(r)?;
            let value = <payload::PushModel as Serializable>::read_f64_le(r)?;
            Ok((key, value))
        })
        .collect()
}

fn write_scores<W: Write>(w: &mut W, scores: &[(String, u8)]) -> io::Result<()> {
    w.write_all(&(scores.len() as u32).to_le_bytes())?;
    for (agent_id, score) in scores {
        <payload::Agents as Serializable>::write_str(w, agent_id)?;
        w.write_all(&[*score])?;
    }
    Ok(())
}

fn read_scores<R: Read>(r: &mut R) -> io::Result<Vec<(String, u8)>> {
    let len = <payload::Agents as Serializable>::read_u32_le(r)?;

    (0..len)
        .map(|_| {
            let agent_id = <payload::Agents as Serializable>::read_str(r)?;
            let score = <payload::Agents as Serializable>::read_u8(r)?;
            Ok((agent_id, score))
        })
        .collect()
}

impl Serializable for ModelSet {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&(self.len() as u32).to_le_bytes())?;
        for (name, values) in self.iter() {
            Self::write_str(w, name)?;
            w.write_all(&(values.len() as u32).to_le_bytes())?;
            for v in values {
                w.write_all(&v.to_le_bytes())?;
            }
        }
        Ok(())
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self>
    where
        Self: Sized,
    {
        let count = Self::read_u32_le(r)?;
        let entries = (0..count)
            .map(|_| {
                let name = Self::read_str(r)?;
                let len = Self::read_u32_le(r)? as usize;
                let values = (0..len)
                    .map(|_| Self::read_f32_le(r))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok::<_, io::Error>((name, values))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ModelSet::from_entries(entries))
    }
}

impl Serializable for BarrierState {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&[*self as u8])
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self>
    where
        Self: Sized,
    {
        let raw = Self::read_u8(r)?;
        BarrierState::try_from(raw)
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidData))
    }
}

impl Serializable for payload::PushModel {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        Self::write_str(w, &self.component_id)?;
        w.write_all(&self.round.to_le_bytes())?;
        w.write_all(&[self.model_type as u8])?;
        self.model.write(w)?;
        Self::write_str(w, &self.model_id)?;
        w.write_all(&self.gen_time.to_le_bytes())?;
        write_meta(w, &self.meta)
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self>
    where
        Self: Sized,
    {
        let component_id = Self::read_str(r)?;
        let round = Self::read_u64_le(r)?;
        let model_type = ModelType::try_from(Self::read_u8(r)?)
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidData))?;
        let model = ModelSet::read(r)?;
        let model_id = Self::read_str(r)?;
        let gen_time = Self::read_u64_le(r)?;
        let meta = read_meta(r)?;

        Ok(Self {
            component_id,
            round,
            model_type,
            model,
            model_id,
            gen_time,
            meta,
        })
    }
}

impl Serializable for payload::RegisterAgent {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        Self::write_str(w, &self.agent_id)?;
        Self::write_str(w, &self.ip)?;
        w.write_all(&self.port.to_le_bytes())?;
        w.write_all(&[self.score])
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self>
    where
        Self: Sized,
    {
        let agent_id = Self::read_str(r)?;
        let ip = Self::read_str(r)?;
        let port = Self::read_u16_le(r)?;
        let score = Self::read_u8(r)?;

        Ok(Self {
            agent_id,
            ip,
            port,
            score,
        })
    }
}

impl Serializable for payload::ElectAggregator {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_scores(w, &self.scores)
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self>
    where
        Self: Sized,
    {
        Ok(Self {
            scores: read_scores(r)?,
        })
    }
}

impl Serializable for payload::AggregatorInfo {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        Self::write_str(w, &self.aggregator_id)?;
        Self::write_str(w, &self.ip)?;
        w.write_all(&self.port.to_le_bytes())
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self>
    where
        Self: Sized,
    {
        let aggregator_id = Self::read_str(r)?;
        let ip = Self::read_str(r)?;
        let port = Self::read_u16_le(r)?;

        Ok(Self {
            aggregator_id,
            ip,
            port,
        })
    }
}

impl Serializable for payload::Elected {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        Self::write_str(w, &self.aggregator_id)?;
        Self::write_str(w, &self.ip)?;
        w.write_all(&self.port.to_le_bytes())?;
        w.write_all(&[self.score])
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self>
    where
        Self: Sized,
    {
        let aggregator_id = Self::read_str(r)?;
        let ip = Self::read_str(r)?;
        let port = Self::read_u16_le(r)?;
        let score = Self::read_u8(r)?;

        Ok(Self {
            aggregator_id,
            ip,
            port,
            score,
        })
    }
}

impl Serializable for payload::ElectionFailed {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        Self::write_str(w, &self.reason)
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self>
    where
        Self: Sized,
    {
        Ok(Self {
            reason: Self::read_str(r)?,
        })
    }
}

impl Serializable for payload::AgentsCount {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.count.to_le_bytes())
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self>
    where
        Self: Sized,
    {
        Ok(Self {
            count: Self::read_u32_le(r)?,
        })
    }
}

impl Serializable for payload::Agents {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_scores(w, &self.scores)
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self>
    where
        Self: Sized,
    {
        Ok(Self {
            scores: read_scores(r)?,
        })
    }
}

impl Serializable for payload::InitBarrier {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.round.to_le_bytes())?;
        w.write_all(&self.threshold.to_le_bytes())?;
        Self::write_str(w, &self.aggregator_id)?;
        self.state.write(w)
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self>
    where
        Self: Sized,
    {
        let round = Self::read_u64_le(r)?;
        let threshold = Self::read_u32_le(r)?;
        let aggregator_id = Self::read_str(r)?;
        let state = BarrierState::read(r)?;

        Ok(Self {
            round,
            threshold,
            aggregator_id,
            state,
        })
    }
}

impl Serializable for payload::UpdateBarrierState {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        self.state.write(w)
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self>
    where
        Self: Sized,
    {
        Ok(Self {
            state: BarrierState::read(r)?,
        })
    }
}

impl Serializable for payload::Participate {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        Self::write_str(w, &self.agent_name)?;
        Self::write_str(w, &self.agent_id)?;
        Self::write_str(w, &self.model_id)?;
        self.model.write(w)?;
        w.write_all(&[self.init_weights as u8])?;
        w.write_all(&[self.simulation as u8])?;
        w.write_all(&self.exch_port.to_le_bytes())?;
        w.write_all(&self.gen_time.to_le_bytes())?;
        write_meta(w, &self.meta)?;
        Self::write_str(w, &self.agent_ip)
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self>
    where
        Self: Sized,
    {
        let agent_name = Self::read_str(r)?;
        let agent_id = Self::read_str(r)?;
        let model_id = Self::read_str(r)?;
        let model = ModelSet::read(r)?;
        let init_weights = Self::read_u8(r)? != 0;
        let simulation = Self::read_u8(r)? != 0;
        let exch_port = Self::read_u16_le(r)?;
        let gen_time = Self::read_u64_le(r)?;
        let meta = read_meta(r)?;
        let agent_ip = Self::read_str(r)?;

        Ok(Self {
            agent_name,
            agent_id,
            model_id,
            model,
            init_weights,
            simulation,
            exch_port,
            gen_time,
            meta,
            agent_ip,
        })
    }
}

impl Serializable for payload::ModelUpload {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        Self::write_str(w, &self.agent_id)?;
        Self::write_str(w, &self.model_id)?;
        self.model.write(w)?;
        w.write_all(&self.gen_time.to_le_bytes())?;
        write_meta(w, &self.meta)
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self>
    where
        Self: Sized,
    {
        let agent_id = Self::read_str(r)?;
        let model_id = Self::read_str(r)?;
        let model = ModelSet::read(r)?;
        let gen_time = Self::read_u64_le(r)?;
        let meta = read_meta(r)?;

        Ok(Self {
            agent_id,
            model_id,
            model,
            gen_time,
            meta,
        })
    }
}

impl Serializable for payload::Polling {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.round.to_le_bytes())?;
        Self::write_str(w, &self.agent_id)
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self>
    where
        Self: Sized,
    {
        let round = Self::read_u64_le(r)?;
        let agent_id = Self::read_str(r)?;

        Ok(Self { round, agent_id })
    }
}

impl Serializable for payload::RecallUpload {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.recall.to_le_bytes())?;
        w.write_all(&self.round.to_le_bytes())?;
        Self::write_str(w, &self.agent_id)
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self>
    where
        Self: Sized,
    {
        let recall = Self::read_f32_le(r)?;
        let round = Self::read_u64_le(r)?;
        let agent_id = Self::read_str(r)?;

        Ok(Self {
            recall,
            round,
            agent_id,
        })
    }
}

impl Serializable for payload::Welcome {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        Self::write_str(w, &self.aggregator_id)?;
        Self::write_str(w, &self.model_id)?;
        self.model.write(w)?;
        w.write_all(&self.round.to_le_bytes())?;
        Self::write_str(w, &self.agent_id)?;
        w.write_all(&self.exch_port.to_le_bytes())?;
        w.write_all(&self.recv_port.to_le_bytes())?;
        Self::write_str(w, &self.aggregator_ip)
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self>
    where
        Self: Sized,
    {
        let aggregator_id = Self::read_str(r)?;
        let model_id = Self::read_str(r)?;
        let model = ModelSet::read(r)?;
        let round = Self::read_u64_le(r)?;
        let agent_id = Self::read_str(r)?;
        let exch_port = Self::read_u16_le(r)?;
        let recv_port = Self::read_u16_le(r)?;
        let aggregator_ip = Self::read_str(r)?;

        Ok(Self {
            aggregator_id,
            model_id,
            model,
            round,
            agent_id,
            exch_port,
            recv_port,
            aggregator_ip,
        })
    }
}

impl Serializable for payload::ClusterModel {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        Self::write_str(w, &self.aggregator_id)?;
        Self::write_str(w, &self.model_id)?;
        w.write_all(&self.round.to_le_bytes())?;
        self.model.write(w)
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self>
    where
        Self: Sized,
    {
        let aggregator_id = Self::read_str(r)?;
        let model_id = Self::read_str(r)?;
        let round = Self::read_u64_le(r)?;
        let model = ModelSet::read(r)?;

        Ok(Self {
            aggregator_id,
            model_id,
            round,
            model,
        })
    }
}

impl Serializable for payload::Rotation {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        Self::write_str(w, &self.winner_id)?;
        Self::write_str(w, &self.winner_ip)?;
        w.write_all(&self.winner_reg_port.to_le_bytes())?;
        Self::write_str(w, &self.model_id)?;
        w.write_all(&self.round.to_le_bytes())?;
        self.model.write(w)?;
        write_scores(w, &self.scores)
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self>
    where
        Self: Sized,
    {
        let winner_id = Self::read_str(r)?;
        let winner_ip = Self::read_str(r)?;
        let winner_reg_port = Self::read_u16_le(r)?;
        let model_id = Self::read_str(r)?;
        let round = Self::read_u64_le(r)?;
        let model = ModelSet::read(r)?;
        let scores = read_scores(r)?;

        Ok(Self {
            winner_id,
            winner_ip,
            winner_reg_port,
            model_id,
            round,
            model,
            scores,
        })
    }
}

impl Serializable for payload::Termination {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        Self::write_str(w, &self.reason)?;
        w.write_all(&self.final_round.to_le_bytes())?;
        w.write_all(&self.final_recall.to_le_bytes())
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self>
    where
        Self: Sized,
    {
        let reason = Self::read_str(r)?;
        let final_round = Self::read_u64_le(r)?;
        let final_recall = Self::read_f32_le(r)?;

        Ok(Self {
            reason,
            final_round,
            final_recall,
        })
    }
}

impl Serializable for payload::ErrorReply {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        Self::write_str(w, &self.reason)
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self>
    where
        Self: Sized,
    {
        Ok(Self {
            reason: Self::read_str(r)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, Payload, Topics};

    fn roundtrip(msg: Message) -> Message {
        let mut buf = Vec::new();
        msg.write(&mut buf).expect("all written");
        Message::read(&mut &buf[..]).expect("all read")
    }

    fn sample_model() -> ModelSet {
        let mut set = ModelSet::new();
        set.insert("dense.weight", vec![0.25, -1.5, 3.75]);
        set.insert("dense.bias", vec![0.125]);
        set
    }

    #[test]
    fn participate_roundtrip() {
        let msg = Message::new_participate(payload::Participate {
            agent_name: "node-a".into(),
            agent_id: "agent-a".into(),
            model_id: "agent-a-m0".into(),
            model: sample_model(),
            init_weights: true,
            simulation: false,
            exch_port: 7011,
            gen_time: 1_700_000_000,
            meta: vec![("accuracy".into(), 0.5), ("num_samples".into(), 32.0)],
            agent_ip: "10.0.0.7".into(),
        });

        let read = roundtrip(msg);
        assert_eq!(read.topic(), Topics::Participate);
        match read.payload {
            Payload::Participate(p) => {
                assert_eq!(p.agent_name, "node-a");
                assert!(p.init_weights);
                assert_eq!(p.exch_port, 7011);
                assert_eq!(p.model, sample_model());
                assert_eq!(p.meta.len(), 2);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn rotation_roundtrip() {
        let msg = Message::new_rotation(payload::Rotation {
            winner_id: "agent-c".into(),
            winner_ip: "10.0.0.9".into(),
            winner_reg_port: 8765,
            model_id: "aggregator-b-m4".into(),
            round: 4,
            model: sample_model(),
            scores: vec![("agent-a".into(), 80), ("agent-c".into(), 80)],
        });

        let read = roundtrip(msg);
        match read.payload {
            Payload::Rotation(p) => {
                assert_eq!(p.winner_ip, "10.0.0.9");
                assert_eq!(p.round, 4);
                assert_eq!(p.scores.len(), 2);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn marker_payloads_roundtrip() {
        for payload in [
            Payload::GetAggregator,
            Payload::ClearAggregator,
            Payload::GetAgentsCount,
            Payload::GetAllAgents,
            Payload::ResetBarrier,
            Payload::Confirmation,
            Payload::Registered,
            Payload::NoAggregator,
            Payload::Updated,
            Payload::Cleared,
            Payload::Ack,
        ] {
            let msg = Message::from_marker(payload);
            let topic = msg.topic();
            assert_eq!(roundtrip(msg).topic(), topic);
        }
    }

    #[test]
    fn push_model_roundtrip() {
        let msg = Message::new_push_model(payload::PushModel {
            component_id: "aggregator-b".into(),
            round: 3,
            model_type: ModelType::Cluster,
            model: sample_model(),
            model_id: "aggregator-b-m3".into(),
            gen_time: 1_700_000_123,
            meta: vec![("num_samples".into(), 96.0)],
        });

        match roundtrip(msg).payload {
            Payload::PushModel(p) => {
                assert_eq!(p.model_type, ModelType::Cluster);
                assert_eq!(p.meta_value("num_samples"), Some(96.0));
                assert_eq!(p.meta_value("accuracy"), None);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn unknown_topic_is_rejected() {
        let buf = [0xAAu8, 0, 0, 0];
        assert!(Message::read(&mut &buf[..]).is_err());
    }

    #[test]
    fn barrier_roundtrip() {
        let msg = Message::new_init_barrier(payload::InitBarrier {
            round: 7,
            threshold: 3,
            aggregator_id: "aggregator-b".into(),
            state: BarrierState::WaitingModels,
        });

        match roundtrip(msg).payload {
            Payload::InitBarrier(p) => {
                assert_eq!(p.threshold, 3);
                assert_eq!(p.state, BarrierState::WaitingModels);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }
}
