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

use crate::*;

/// The shared motor anchor: cycle `n` begins at `start_us + n * period`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Epoch {
    /// Synchronized-time instant of cycle 0
    pub start_us: TimeUs,
    pub cycle_period_ms: u16,
}

impl Epoch {
    pub(crate) fn period_us(&self) -> u64 {
        self.cycle_period_ms as u64 * US_PER_MS
    }

    pub(crate) fn half_period_us(&self) -> u64 {
        self.period_us() / 2
    }

    /// Start of the cycle containing `sync_now`, and its index
    pub(crate) fn cycle_at(&self, sync_now: TimeUs) -> (u32, TimeUs) {
        if sync_now <= self.start_us {
            return (0, self.start_us);
        }
        let n = (sync_now - self.start_us) / self.period_us();
        (n as u32, self.start_us + n * self.period_us())
    }
}

/// An armed two-phase mode change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ArmedChange {
    /// Synchronized boundary both devices commit at
    pub epoch_us: TimeUs,
    pub mode_id: ModeId,
    pub mode: ModeConfig,
}

/// Pending debounce of custom-frequency slider writes
#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingCustom {
    pub last_write_us: TimeUs,
}

/// Scheduler-owned state
///
/// Mutated only by the state machine and the input dispatch that runs on
/// the same call stack; nothing here is shared.
#[derive(Debug)]
pub(crate) struct Context {
    pub role: Role,
    pub mode_id: ModeId,
    pub mode: ModeConfig,
    pub epoch: Option<Epoch>,
    /// Epoch re-anchored to the actual first cycle start
    pub epoch_anchored: bool,
    /// Completed own-ACTIVE halves since the epoch (server counts cycles)
    pub cycle_count: u32,
    /// Lifetime ACTIVE counter, reported by the client
    pub cycle_index: u32,
    /// Polarity of the next ACTIVE; alternates every own cycle
    pub forward: bool,
    pub armed: Option<ArmedChange>,
    /// Pause effects (coast, LED off) already emitted for the armed change
    pub pause_applied: bool,
    pub client_skip_inactive_wait: bool,
    pub motor_started_received: bool,
    pub session_active: bool,
    /// Server only: first activation of the current epoch already announced
    pub motor_started_sent: bool,
    pub last_button_us: TimeUs,
    /// Sync-time target of the pending own-ACTIVE start
    pub own_active_target: Option<TimeUs>,
    /// Cycle index of the last started own ACTIVE, one per cycle
    pub last_active_cycle: Option<u32>,
    /// Drift measured at the last ACTIVE entry, for activation reports
    pub last_drift_ms: i16,
    /// Wake-ups must re-derive position (epoch or offset moved materially)
    pub resync: bool,
    pub pending_custom: Option<PendingCustom>,
    pub last_report_cycle: u32,
    /// Local time the current mode was entered, for the back-EMF capture
    pub mode_entered_at: TimeUs,
    pub shutdown_requested: bool,
}

impl Context {
    pub(crate) fn new(settings: &StoredSettings) -> Self {
        let mode_id = settings.current_mode;
        Context {
            role: Role::None,
            mode_id,
            mode: ModeConfig::resolve(mode_id, settings),
            epoch: None,
            epoch_anchored: false,
            cycle_count: 0,
            cycle_index: 0,
            forward: true,
            armed: None,
            pause_applied: false,
            client_skip_inactive_wait: false,
            motor_started_received: false,
            session_active: false,
            motor_started_sent: false,
            last_button_us: 0,
            own_active_target: None,
            last_active_cycle: None,
            last_drift_ms: 0,
            resync: false,
            pending_custom: None,
            last_report_cycle: 0,
            mode_entered_at: 0,
            shutdown_requested: false,
        }
    }

    /// Snapshot handed to the time-sync component for beacon emission
    pub(crate) fn epoch_view(&self) -> crate::timesync::EpochView {
        match self.epoch {
            Some(epoch) => crate::timesync::EpochView {
                epoch_us: epoch.start_us,
                cycle_period_ms: epoch.cycle_period_ms,
                motor_active_duty_pct: self.mode.motor_active_duty_pct,
                mode_id: self.mode_id.as_u8(),
            },
            None => crate::timesync::EpochView {
                epoch_us: 0,
                cycle_period_ms: self.mode.cycle_period_ms() as u16,
                motor_active_duty_pct: self.mode.motor_active_duty_pct,
                mode_id: self.mode_id.as_u8(),
            },
        }
    }

    /// Commit an armed change at its boundary
    pub(crate) fn commit_mode_change(&mut self, now_local: TimeUs) {
        if let Some(armed) = self.armed.take() {
            self.mode_id = armed.mode_id;
            self.mode = armed.mode;
            self.epoch = Some(Epoch {
                start_us: armed.epoch_us,
                cycle_period_ms: armed.mode.cycle_period_ms() as u16,
            });
            self.epoch_anchored = false;
            self.cycle_count = 0;
            self.forward = true;
            self.pause_applied = false;
            self.motor_started_sent = false;
            self.own_active_target = None;
            self.last_active_cycle = None;
            self.mode_entered_at = now_local;
        }
    }

    pub(crate) fn take_resync(&mut self) -> bool {
        core::mem::take(&mut self.resync)
    }

    /// Back-EMF research capture window is open
    pub(crate) fn back_emf_window(&self, now_local: TimeUs) -> bool {
        now_local.saturating_sub(self.mode_entered_at) < BACK_EMF_CAPTURE_US
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_at_indexes_from_epoch() {
        let epoch = Epoch {
            start_us: 10_000_000,
            cycle_period_ms: 1000,
        };
        assert_eq!(epoch.cycle_at(9_000_000), (0, 10_000_000));
        assert_eq!(epoch.cycle_at(10_000_000), (0, 10_000_000));
        assert_eq!(epoch.cycle_at(10_999_999), (0, 10_000_000));
        assert_eq!(epoch.cycle_at(11_000_000), (1, 11_000_000));
        assert_eq!(epoch.cycle_at(13_500_000), (3, 13_000_000));
    }

    #[test]
    fn commit_replaces_mode_and_epoch() {
        let settings = StoredSettings::default();
        let mut ctx = Context::new(&settings);
        ctx.armed = Some(ArmedChange {
            epoch_us: 42_000_000,
            mode_id: ModeId::M0,
            mode: ModeConfig::resolve(ModeId::M0, &settings),
        });
        ctx.cycle_count = 17;
        ctx.commit_mode_change(5_000_000);
        assert_eq!(ctx.mode_id, ModeId::M0);
        assert_eq!(
            ctx.epoch,
            Some(Epoch {
                start_us: 42_000_000,
                cycle_period_ms: 2000
            })
        );
        assert_eq!(ctx.cycle_count, 0);
        assert!(ctx.armed.is_none());
        assert!(!ctx.epoch_anchored);
    }
}
