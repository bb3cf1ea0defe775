// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

/// Inclusive bounds of the election score range.
pub const SCORE_MIN: u8 = 1;
pub const SCORE_MAX: u8 = 100;

/// Rotation cadence defaults.
pub const DEFAULT_ROTATION_MIN_ROUNDS: u64 = 1;
pub const DEFAULT_ROTATION_INTERVAL: u64 = 1;
pub const DEFAULT_ROTATION_DELAY_SECS: u64 = 10;

/// Termination judge defaults.
pub const DEFAULT_MAX_ROUNDS: u64 = 100;
pub const DEFAULT_EARLY_STOPPING_PATIENCE: u32 = 120;
pub const DEFAULT_EARLY_STOPPING_MIN_DELTA: f64 = 0.0001;
