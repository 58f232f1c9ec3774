//  _____       ______   ____
// |_   _|     |  ____|/ ____|  Institute of Embedded Systems
//   | |  _ __ | |__  | (___    Zurich University of Applied Sciences
//   | | | '_ \|  __|  \___ \   8401 Winterthur, Switzerland
//  _| |_| | | | |____ ____) |
// |_____|_| |_|______|_____/
//
// Copyright 2025 Institute of Embedded Systems at Zurich University of Applied Sciences.
// All rights reserved.
// SPDX-License-Identifier: MIT

use crate::context::Epoch;
use crate::*;

impl Tandem {
    /// Get next state
    ///
    /// Each state's exit functionality is implemented here. Inputs have
    /// already been dispatched into the context by the time this runs.
    #[must_use]
    pub(crate) fn next(&mut self, now: TimeUs, fx: &mut TandemEffects) -> State {
        if self.ctx.shutdown_requested && self.state != State::Shutdown {
            return self.enter_shutdown(fx);
        }

        match self.state {
            State::Idle => {
                if self.ctx.session_active {
                    State::PairingWait
                } else {
                    State::Idle
                }
            }

            State::PairingWait => match self.ctx.role {
                Role::None => State::PairingWait,
                Role::Server | Role::Standalone => {
                    if self.ctx.epoch.is_none() {
                        self.establish_epoch(now, fx);
                    }
                    State::CheckMessages { end: now }
                }
                Role::Client => {
                    // an explicit activation notice carries the epoch and is
                    // good enough to start on; otherwise wait for lock, at
                    // most five seconds
                    if self.ctx.epoch.is_some()
                        && (self.sync.locked(now)
                            || self.ctx.motor_started_received
                            || self.sync.lock_wait_expired(now))
                    {
                        State::CheckMessages { end: now }
                    } else {
                        State::PairingWait
                    }
                }
            },

            State::CheckMessages { .. } => self.route(now, fx),

            State::ForwardActive { off_at, active_end }
            | State::ReverseActive { off_at, active_end } => {
                if now < off_at {
                    self.state
                } else {
                    let _ = fx.push(Effect::MotorCoast);
                    if self.ctx.back_emf_window(now) {
                        let _ = fx.push(Effect::SampleBackEmf);
                    }
                    State::Coast { end: active_end }
                }
            }

            State::Coast { end } => {
                if now < end {
                    self.state
                } else {
                    self.finish_active(now, fx);
                    State::CheckMessages { end: now }
                }
            }

            State::Inactive { until_sync } => {
                if self.ctx.take_resync() {
                    // epoch or offset moved materially; re-derive position
                    State::CheckMessages { end: now }
                } else if self.sync.now_sync(now) < until_sync {
                    self.state
                } else {
                    State::CheckMessages { end: now }
                }
            }

            State::Shutdown => State::Shutdown,
        }
    }

    /// CHECK_MESSAGES: honor an armed change, then route by role and
    /// cycle position
    fn route(&mut self, now: TimeUs, fx: &mut TandemEffects) -> State {
        self.ctx.resync = false;

        if let Some(armed) = self.ctx.armed {
            if !self.ctx.pause_applied {
                // pause window of the two-phase commit: motors off, LED off
                let _ = fx.push(Effect::MotorCoast);
                let _ = fx.push(Effect::LedClear);
                self.ctx.pause_applied = true;
            }
            if self.sync.now_sync(now) < armed.epoch_us {
                return State::CheckMessages {
                    end: self.sync.local_from_sync(armed.epoch_us),
                };
            }
            self.ctx.commit_mode_change(now);
            event_log_mode!(
                now,
                mac_bits(&self.mac),
                self.ctx.mode_id,
                self.ctx.mode.cycle_period_ms()
            );
            // the indicator switches to the new mode only now, at commit
            let (r, g, b) = self.ctx.mode_id.led_color();
            let _ = fx.push(Effect::LedColor { r, g, b });
            if self.ctx.role.is_server() {
                self.sync.force_burst(now);
            }
            if self.ctx.role.is_client() {
                self.ctx.client_skip_inactive_wait = true;
            }
        }

        if !self.ctx.session_active {
            let _ = fx.push(Effect::MotorCoast);
            let _ = fx.push(Effect::LedClear);
            return State::Idle;
        }

        match self.ctx.role {
            Role::None => State::PairingWait,
            Role::Server | Role::Standalone => self.route_epoch_owner(now, fx),
            Role::Client => self.route_client(now, fx),
        }
    }

    /// Server and Standalone: own ACTIVE occupies the first half of every
    /// cycle, anchored at the epoch.
    fn route_epoch_owner(&mut self, now: TimeUs, fx: &mut TandemEffects) -> State {
        let epoch = match self.ctx.epoch {
            Some(epoch) => epoch,
            None => {
                self.establish_epoch(now, fx);
                return State::CheckMessages { end: now };
            }
        };
        let now_sync = self.sync.now_sync(now);
        if now_sync < epoch.start_us {
            self.ctx.own_active_target = Some(epoch.start_us);
            return State::Inactive {
                until_sync: epoch.start_us,
            };
        }

        // anchor the epoch to the actual start of the first cycle, once;
        // startup latency moves the epoch instead of shortening cycle 0
        let epoch = if !self.ctx.epoch_anchored {
            self.ctx.epoch_anchored = true;
            let anchored = Epoch {
                start_us: now_sync,
                cycle_period_ms: epoch.cycle_period_ms,
            };
            self.ctx.epoch = Some(anchored);
            anchored
        } else {
            epoch
        };

        let (n, cycle_start) = epoch.cycle_at(now_sync);
        let period = epoch.period_us();
        let half = epoch.half_period_us();
        let off_target = cycle_start + self.ctx.mode.motor_on_us();
        let active_end = cycle_start + half;
        self.ctx.cycle_count = n;

        if self.ctx.last_active_cycle == Some(n) || now_sync >= active_end {
            // own half spent; wait out the peer's half
            self.ctx.own_active_target = Some(cycle_start + period);
            return State::Inactive {
                until_sync: cycle_start + period,
            };
        }

        self.ctx.last_active_cycle = Some(n);
        self.ctx.own_active_target = Some(cycle_start);
        self.announce_motor_start(now, fx);

        if now_sync >= off_target {
            // drive window missed; never extend it, coast out the half
            let _ = fx.push(Effect::MotorCoast);
            return State::Coast {
                end: self.sync.local_from_sync(active_end),
            };
        }

        self.push_drive(now, fx);
        active_state(
            self.ctx.forward,
            self.sync.local_from_sync(off_target),
            self.sync.local_from_sync(active_end),
        )
    }

    /// Client: state selection is purely position based. First half of the
    /// server's cycle means INACTIVE, second half means own ACTIVE.
    fn route_client(&mut self, now: TimeUs, fx: &mut TandemEffects) -> State {
        let epoch = match self.ctx.epoch {
            Some(epoch) => epoch,
            // no epoch yet; keep polling, beacons will bring it
            None => return State::CheckMessages { end: now + ARMED_POLL_US },
        };
        let now_sync = self.sync.now_sync(now);
        let half = epoch.half_period_us();
        let period = epoch.period_us();

        if now_sync < epoch.start_us + half {
            self.ctx.own_active_target = Some(epoch.start_us + half);
            return State::Inactive {
                until_sync: epoch.start_us + half,
            };
        }

        let (n, cycle_start) = epoch.cycle_at(now_sync);
        let own_start = cycle_start + half;
        let boundary = cycle_start + period;

        if now_sync < own_start {
            // server's half
            self.ctx.own_active_target = Some(own_start);
            return State::Inactive {
                until_sync: own_start,
            };
        }

        if self.ctx.last_active_cycle == Some(n) {
            // own half already served this cycle
            self.ctx.own_active_target = Some(boundary + half);
            return State::Inactive {
                until_sync: boundary + half,
            };
        }

        let scheduled = self.ctx.own_active_target.is_some();
        let target = self.ctx.own_active_target.take().unwrap_or(own_start);
        let drift = now_sync as i64 - target as i64;
        let deadband = drift_deadband_us(half) as i64;
        let clamp = drift_clamp_us(half) as i64;
        self.ctx.last_drift_ms = (drift / 1000).clamp(i16::MIN as i64, i16::MAX as i64) as i16;

        if drift < -deadband && !self.ctx.client_skip_inactive_wait {
            // woke early (offset moved under us): lengthen INACTIVE. With a
            // freshly announced epoch (skip flag) the target is
            // authoritative and is not second-guessed.
            self.ctx.own_active_target = Some(target);
            return State::Inactive { until_sync: target };
        }

        if !scheduled && drift > deadband {
            // joined mid-half (first start, or a jump after resync); align
            // with the next own slot instead of buzzing a partial half
            self.ctx.own_active_target = Some(boundary + half);
            return State::Inactive {
                until_sync: boundary + half,
            };
        }

        self.ctx.client_skip_inactive_wait = false;
        self.ctx.cycle_count = n;
        self.ctx.last_active_cycle = Some(n);
        let motor_on = self.ctx.mode.motor_on_us();
        let coast = self.ctx.mode.coast_us();
        let off_target = own_start + motor_on;

        if now_sync >= off_target {
            // drive window missed; coast the remainder, never extend
            let _ = fx.push(Effect::MotorCoast);
            return State::Coast {
                end: self.sync.local_from_sync(boundary),
            };
        }

        // asymmetric drift correction: catching up shortens the coast span
        // (floor 10 ms), then borrows from the drive span (floor 50 ms).
        // Slowing down happened above by re-entering INACTIVE. The ACTIVE
        // half is never lengthened past the cycle boundary.
        let (motor_on, coast) = if drift > deadband {
            let correction = drift.min(clamp) as u64;
            let coast_cut = correction.min(coast.saturating_sub(COAST_FLOOR_US));
            let drive_cut =
                (correction - coast_cut).min(motor_on.saturating_sub(MOTOR_ON_FLOOR_US));
            (motor_on - drive_cut, coast - coast_cut)
        } else {
            (motor_on, coast)
        };

        self.push_drive(now, fx);
        let off_at = (now_sync + motor_on).min(boundary);
        let active_end = (now_sync + motor_on + coast).min(boundary);
        active_state(
            self.ctx.forward,
            self.sync.local_from_sync(off_at),
            self.sync.local_from_sync(active_end),
        )
    }

    /// End of an own ACTIVE half: bookkeeping, reports, direction flip
    fn finish_active(&mut self, now: TimeUs, fx: &mut TandemEffects) {
        self.ctx.cycle_index = self.ctx.cycle_index.wrapping_add(1);
        self.ctx.forward = !self.ctx.forward;
        event_log_cycle!(
            now,
            mac_bits(&self.mac),
            "active_end",
            self.sync.now_sync(now)
        );

        if self.ctx.role.is_client()
            && self.conn.connected
            && self
                .ctx
                .cycle_index
                .wrapping_sub(self.ctx.last_report_cycle)
                >= REPORT_CYCLE_INTERVAL
        {
            if let Some(report) =
                self.sync
                    .make_report(now, self.ctx.cycle_index, self.ctx.last_drift_ms)
            {
                self.push_droppable(fx, report);
                self.ctx.last_report_cycle = self.ctx.cycle_index;
            }
        }
    }

    /// First activation of an epoch is announced to the client
    fn announce_motor_start(&mut self, now: TimeUs, fx: &mut TandemEffects) {
        if !self.ctx.role.is_server() || self.ctx.motor_started_sent || !self.conn.connected {
            return;
        }
        if let Some(epoch) = self.ctx.epoch {
            let _ = fx.push(Effect::Transmit(Message::MotorStarted {
                epoch_us: epoch.start_us,
                cycle_period_ms: epoch.cycle_period_ms,
            }));
            // first activation republishes the (anchored) epoch densely
            self.sync.force_burst(now);
            self.ctx.motor_started_sent = true;
        }
    }

    fn push_drive(&mut self, now: TimeUs, fx: &mut TandemEffects) {
        let intensity_pct = self.ctx.mode.pwm_intensity_pct;
        let _ = fx.push(if self.ctx.forward {
            Effect::MotorForward { intensity_pct }
        } else {
            Effect::MotorReverse { intensity_pct }
        });
        debug!(
            "cycle {} active, {}",
            self.ctx.cycle_count,
            if self.ctx.forward { "forward" } else { "reverse" }
        );
        event_log_cycle!(now, mac_bits(&self.mac), "active_start", self.sync.now_sync(now));
    }

    /// Publish a fresh epoch a little ahead of now and announce it
    pub(crate) fn establish_epoch(&mut self, now: TimeUs, fx: &mut TandemEffects) {
        let start_us = self.sync.now_sync(now) + MODE_CHANGE_LEAD_US;
        self.ctx.epoch = Some(Epoch {
            start_us,
            cycle_period_ms: self.ctx.mode.cycle_period_ms() as u16,
        });
        self.ctx.epoch_anchored = false;
        self.ctx.cycle_count = 0;
        self.ctx.last_active_cycle = None;
        self.ctx.motor_started_sent = false;
        self.ctx.mode_entered_at = now;
        let (r, g, b) = self.ctx.mode_id.led_color();
        let _ = fx.push(Effect::LedColor { r, g, b });
        if self.ctx.role.is_server() {
            self.sync.force_burst(now);
        }
        event_log_mode!(
            now,
            mac_bits(&self.mac),
            self.ctx.mode_id,
            self.ctx.mode.cycle_period_ms()
        );
    }

    pub(crate) fn enter_shutdown(&mut self, fx: &mut TandemEffects) -> State {
        let _ = fx.push(Effect::MotorCoast);
        let _ = fx.push(Effect::LedClear);
        if self.conn.connected {
            self.push_critical(fx, Message::Shutdown);
            let _ = fx.push(Effect::Disconnect);
        }
        let _ = fx.push(Effect::StopAdvertising);
        State::Shutdown
    }
}

/// ACTIVE entry with the requested drive polarity
fn active_state(forward: bool, off_at: TimeUs, active_end: TimeUs) -> State {
    if forward {
        State::ForwardActive { off_at, active_end }
    } else {
        State::ReverseActive { off_at, active_end }
    }
}
