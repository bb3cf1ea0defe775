// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use std::fmt::Formatter;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone)]
pub struct Params {
    /// Address the directory listens on.
    pub listen_ip: String,
    pub listen_port: u16,

    /// Where the SQLite database lives.
    pub data_path: PathBuf,

    /// Where model payload blobs live.
    pub model_path: PathBuf,

    /// Agents not seen for this long are evicted.
    #[serde(with = "humantime_serde")]
    pub agent_ttl: Duration,

    /// Bound on concurrently served connections.
    pub max_inflight: usize,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            listen_ip: "0.0.0.0".into(),
            listen_port: 9017,
            data_path: PathBuf::from("./db"),
            model_path: PathBuf::from("./db/models"),
            agent_ttl: Duration::from_secs(300),
            max_inflight: 64,
        }
    }
}

impl std::fmt::Display for Params {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "listen: {}:{}, data_path: {:?}, agent_ttl: {:?}",
            self.listen_ip, self.listen_port, self.data_path, self.agent_ttl
        )
    }
}
