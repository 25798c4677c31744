// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! The transmit timer state machine (802.1AB section 9.2.10).  This decides
//! when the transmitter should send, and limits how often it may.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use slog::debug;
use slog::trace;

use crate::agent::Agent;
use crate::types::AgentCfg;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum TxTimerState {
    Initialize,
    Idle,
}

/// The counters and flags shared by the transmit timer and the transmitter.
/// All counts are in ticks.
#[derive(Clone, Debug)]
pub struct TxPacer {
    /// Sends allowed before the next tick
    pub credit: u16,
    credit_max: u16,
    /// Fast transmissions remaining in the current burst
    pub fast: u16,
    fast_init: u16,
    /// Ticks until the next periodic send
    pub ttr: u16,
    msg_fast_tx: u16,
    msg_tx_interval: u16,
    pub local_change: bool,
    pub new_neighbor: bool,
    /// A send is owed to the transmitter
    pub tx_now: bool,
}

impl TxPacer {
    pub fn new(cfg: &AgentCfg) -> Self {
        TxPacer {
            credit: cfg.tx_credit_max,
            credit_max: cfg.tx_credit_max,
            fast: 0,
            fast_init: cfg.tx_fast_init,
            ttr: 0,
            msg_fast_tx: cfg.msg_fast_tx,
            msg_tx_interval: cfg.msg_tx_interval,
            local_change: false,
            new_neighbor: false,
            tx_now: false,
        }
    }

    /// TX_TIMER_INITIALIZE
    pub fn reset(&mut self) {
        self.ttr = 0;
        self.fast = 0;
        self.new_neighbor = false;
        self.local_change = false;
        self.tx_now = false;
        self.credit = self.credit_max;
    }

    /// One tick has passed
    pub fn tick(&mut self) {
        self.credit = (self.credit + 1).min(self.credit_max);
        self.ttr = self.ttr.saturating_sub(1);
    }

    fn signal_tx(&mut self) {
        self.tx_now = true;
        self.local_change = false;
        self.ttr = if self.fast > 0 {
            self.msg_fast_tx
        } else {
            self.msg_tx_interval
        };
    }

    fn expires(&mut self) {
        self.fast = self.fast.saturating_sub(1);
        self.signal_tx();
    }

    /// Send now, and keep sending at the fast interval for the rest of the
    /// burst
    fn start_burst(&mut self) {
        if self.fast == 0 {
            self.fast = self.fast_init;
        }
        self.expires();
    }

    /// Run one step of TX_TIMER_IDLE.  Returns true if a transmission was
    /// signalled, in which case the caller should evaluate again.
    pub fn evaluate(&mut self) -> bool {
        if self.local_change {
            self.local_change = false;
            self.start_burst();
        } else if self.ttr == 0 {
            self.expires();
        } else if self.new_neighbor {
            self.new_neighbor = false;
            self.start_burst();
        } else {
            return false;
        }
        true
    }

    /// Consume a pending transmission, if there is credit to cover it
    pub fn take_send(&mut self) -> bool {
        if self.tx_now && self.credit > 0 {
            self.tx_now = false;
            self.credit -= 1;
            true
        } else {
            false
        }
    }
}

pub(crate) fn txtimer_loop(agent: Arc<Agent>) {
    let log = agent.log.new(slog::o!("unit" => "txtimer"));
    let tick = agent.cfg.tick;
    let mut next_tick = Instant::now() + tick;
    debug!(log, "tx timer started");

    let mut tx = agent.tx.lock().unwrap();
    loop {
        let status = agent.status();
        if status.shutdown {
            break;
        }

        let now = Instant::now();
        let ticked = now >= next_tick;
        if ticked {
            next_tick += tick;
            // Don't try to make up for ticks lost while we were starved
            if next_tick <= now {
                next_tick = now + tick;
            }
            tx.shutdown_while = tx.shutdown_while.saturating_sub(1);
        }

        let mut wake_tx = ticked;
        match tx.timer_state {
            TxTimerState::Initialize => {
                if status.tx_enabled() {
                    tx.pacer.reset();
                    tx.timer_state = TxTimerState::Idle;
                    trace!(log, "Initialize -> Idle");
                    continue;
                }
            }
            TxTimerState::Idle => {
                if !status.tx_enabled() {
                    tx.timer_state = TxTimerState::Initialize;
                    trace!(log, "Idle -> Initialize");
                    continue;
                }
                if ticked {
                    tx.pacer.tick();
                }
                while tx.pacer.evaluate() {
                    trace!(log, "signalling tx";
                        "fast" => tx.pacer.fast,
                        "ttr" => tx.pacer.ttr,
                        "credit" => tx.pacer.credit);
                    wake_tx = true;
                    // A due ttr can't re-fire until it has been reloaded
                    if !tx.pacer.local_change && !tx.pacer.new_neighbor {
                        break;
                    }
                }
            }
        }
        if wake_tx {
            agent.tx_cv.notify_all();
        }

        let timeout = next_tick.saturating_duration_since(Instant::now());
        tx = agent.txtimer_cv.wait_timeout(tx, timeout).unwrap().0;
    }
    debug!(log, "tx timer exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pacer(credit_max: u16) -> TxPacer {
        let cfg = AgentCfg {
            tx_credit_max: credit_max,
            msg_tx_interval: 30,
            msg_fast_tx: 1,
            tx_fast_init: 4,
            ..Default::default()
        };
        let mut p = TxPacer::new(&cfg);
        p.reset();
        p
    }

    // Drain every owed transmission, returning how many were sent
    fn sends(p: &mut TxPacer) -> usize {
        let mut n = 0;
        while p.evaluate() {
            if p.take_send() {
                n += 1;
            }
            if !p.local_change && !p.new_neighbor {
                break;
            }
        }
        while p.take_send() {
            n += 1;
        }
        n
    }

    #[test]
    fn test_first_send_is_immediate() {
        let mut p = pacer(5);
        assert_eq!(sends(&mut p), 1);
        assert_eq!(p.ttr, 30);
        assert_eq!(p.credit, 4);
        assert_eq!(sends(&mut p), 0);
    }

    #[test]
    fn test_periodic_sends() {
        let mut p = pacer(5);
        sends(&mut p);
        let mut total = 0;
        for _ in 0..90 {
            p.tick();
            total += sends(&mut p);
        }
        assert_eq!(total, 3);
    }

    #[test]
    fn test_new_neighbor_burst() {
        let mut p = pacer(5);
        sends(&mut p);
        p.new_neighbor = true;
        let mut sent = sends(&mut p);
        assert_eq!(p.fast, 3);
        for _ in 0..10 {
            p.tick();
            sent += sends(&mut p);
        }
        // fast_init sends, one per fast interval, then back to normal
        assert_eq!(sent, 4);
        assert_eq!(p.fast, 0);
        assert!(p.ttr > 1);
    }

    #[test]
    fn test_local_change_burst() {
        let mut p = pacer(5);
        sends(&mut p);
        assert_eq!((p.fast, p.ttr), (0, 30));
        p.local_change = true;
        let mut sent = sends(&mut p);
        assert_eq!(sent, 1);
        assert_eq!((p.fast, p.ttr), (3, 1));
        for _ in 0..10 {
            p.tick();
            sent += sends(&mut p);
        }
        assert_eq!(sent, 4);
        assert_eq!(p.fast, 0);
        assert_eq!(p.ttr, 23);

        // A change in the middle of a burst doesn't extend it
        p.local_change = true;
        sends(&mut p);
        p.tick();
        p.local_change = true;
        sends(&mut p);
        assert_eq!(p.fast, 2);
    }

    #[test]
    fn test_credit_gating() {
        let mut p = pacer(3);
        let mut sent = sends(&mut p);
        for _ in 0..10 {
            p.local_change = true;
            sent += sends(&mut p);
        }
        // Every change wants a send, but only credit_max get out before a
        // tick
        assert_eq!(sent, 3);
        assert_eq!(p.credit, 0);
        assert!(p.tx_now);

        p.tick();
        assert!(p.take_send());
        assert!(!p.take_send());
    }

    #[test]
    fn test_credit_capped() {
        let mut p = pacer(2);
        for _ in 0..10 {
            p.tick();
        }
        assert_eq!(p.credit, 2);
    }
}
