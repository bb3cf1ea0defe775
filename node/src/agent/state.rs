// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use thiserror::Error;

/// The agent's training-cycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    WaitingGm = 0,
    Training = 1,
    Sending = 2,
    GmReady = 3,
}

impl ClientState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientState::WaitingGm => "waiting_gm",
            ClientState::Training => "training",
            ClientState::Sending => "sending",
            ClientState::GmReady => "gm_ready",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal client transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: ClientState,
    pub to: ClientState,
}

/// Enforces the training cycle:
/// `gm_ready -> training -> sending -> waiting_gm -> gm_ready`.
/// No other edge exists; an illegal request leaves the state untouched.
#[derive(Debug)]
pub struct StateMachine {
    current: ClientState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            current: ClientState::WaitingGm,
        }
    }
}

impl StateMachine {
    pub fn current(&self) -> ClientState {
        self.current
    }

    pub fn transition(
        &mut self,
        to: ClientState,
    ) -> Result<(), InvalidTransition> {
        use ClientState::*;

        let legal = matches!(
            (self.current, to),
            (GmReady, Training)
                | (Training, Sending)
                | (Sending, WaitingGm)
                | (WaitingGm, GmReady)
        );

        if !legal {
            return Err(InvalidTransition {
                from: self.current,
                to,
            });
        }

        self.current = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ClientState::*;

    #[test]
    fn full_cycle_is_legal() {
        let mut sm = StateMachine::default();
        assert_eq!(sm.current(), WaitingGm);

        for to in [GmReady, Training, Sending, WaitingGm, GmReady] {
            sm.transition(to).unwrap();
            assert_eq!(sm.current(), to);
        }
    }

    #[test]
    fn every_other_edge_is_rejected() {
        let states = [WaitingGm, Training, Sending, GmReady];
        let legal = [
            (GmReady, Training),
            (Training, Sending),
            (Sending, WaitingGm),
            (WaitingGm, GmReady),
        ];

        for from in states {
            for to in states {
                let mut sm = StateMachine { current: from };
                let res = sm.transition(to);
                if legal.contains(&(from, to)) {
                    assert!(res.is_ok(), "{from:?} -> {to:?} must be legal");
                } else {
                    assert!(res.is_err(), "{from:?} -> {to:?} must be illegal");
                    // state unchanged on rejection
                    assert_eq!(sm.current(), from);
                }
            }
        }
    }
}
