// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

//! Deterministic coordination rules of the federation.
//!
//! Everything here is pure state-in/state-out: the same inputs produce the
//! same winner or verdict on every node, which is what lets the directory,
//! the aggregator and each agent agree without talking to each other.

pub mod config;
pub mod judge;
pub mod winner;
