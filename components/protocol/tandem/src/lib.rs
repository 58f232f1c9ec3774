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

#![cfg_attr(not(test), no_std)]

use coordination_api::*;

mod clock;
pub use crate::clock::{FilterOutcome, OffsetFilter, TimestampSample};
mod mode;
pub use crate::mode::{ModeConfig, ModeError, ModeId};
mod message;
pub use crate::message::{Beacon, DecodeError, Message, FRAME_MAX};
mod settings;
pub use crate::settings::{StoredSettings, SETTINGS_BLOB_MAX};
mod role;
pub use crate::role::Role;
mod timesync;
pub use crate::timesync::{HandshakeError, TimeSync};
mod context;
use crate::context::*;
mod states;
use crate::states::*;
mod state_machine;
mod device;
pub use crate::device::{ProposalOutcome, Tandem};
mod event_log;

#[cfg(feature = "defmt")]
#[allow(unused_imports)]
use defmt::{debug, error, info, warn};

#[cfg(not(feature = "defmt"))]
#[allow(unused_imports)]
use log::{debug, error, info, warn};

/// Local monotonic time as microseconds since power-on
pub type TimeUs = u64;
/// Link-layer address, most significant byte first
pub type Mac = [u8; 6];

pub(crate) const US_PER_MS: u64 = 1000;

// offset filter

/// Samples below this count run the fast-attack EMA regime.
pub(crate) const FAST_ATTACK_SAMPLES: u32 = 10;
/// EMA weight of a new sample during fast attack, percent.
pub(crate) const ALPHA_FAST_ATTACK_PCT: i64 = 30;
/// EMA weight of a new sample in steady state, percent.
pub(crate) const ALPHA_STEADY_PCT: i64 = 10;
/// Samples deviating more than this from the filtered offset are dropped
/// during fast attack.
pub(crate) const OUTLIER_FAST_ATTACK_US: i64 = 50_000;
/// Outlier threshold in steady state. Wider because connection-parameter
/// updates of the link occasionally produce ~50 ms one-way spikes.
pub(crate) const OUTLIER_STEADY_US: i64 = 100_000;
pub(crate) const OFFSET_RING_LEN: usize = 8;

// time-sync protocol

/// Handshake round trips above this are discarded.
pub(crate) const HANDSHAKE_MAX_RTT_US: u64 = 500_000;
/// No response within this window counts as a failed attempt.
pub(crate) const HANDSHAKE_TIMEOUT_US: u64 = 500_000;
pub(crate) const HANDSHAKE_MAX_ATTEMPTS: u8 = 3;
/// Beacon intervals selectable by the quality score, seconds.
pub(crate) const BEACON_INTERVALS_S: [u64; 6] = [1, 2, 10, 20, 40, 60];
/// Number of beacons in a forced burst.
pub(crate) const FORCED_BURST_LEN: u8 = 5;
pub(crate) const FORCED_BURST_SPACING_US: u64 = 200_000;
/// Beacons processed before the client may assert lock.
pub(crate) const LOCK_MIN_BEACONS: u32 = 3;
/// The client blocks its first motor start on lock for at most this long.
pub(crate) const LOCK_WAIT_LIMIT_US: u64 = 5_000_000;
/// Paired-timestamp report cadence, in client ACTIVE cycles.
pub(crate) const REPORT_CYCLE_INTERVAL: u32 = 30;

// connection lifecycle

/// Bilateral peer discovery is possible for this long after power-on.
pub(crate) const PAIRING_WINDOW_US: u64 = 30_000_000;
/// A disconnected client keeps scheduling predictively for this long.
pub(crate) const DISCONNECT_GRACE_US: u64 = 120_000_000;

// motor scheduling

/// A mode-change boundary is armed at least this far in the future.
pub(crate) const MODE_CHANGE_LEAD_US: u64 = 500_000;
/// Re-poll period while a mode change is armed and motors are paused.
pub(crate) const ARMED_POLL_US: u64 = 50_000;
/// Longest uninterrupted wait. Keeps the watchdog fed on 4 s half-cycles.
pub(crate) const MAX_WAIT_CHUNK_US: u64 = 100_000;
/// Frequency-slider writes must quiesce for this long before the
/// coordinated change fires.
pub(crate) const CUSTOM_FREQ_DEBOUNCE_US: u64 = 300_000;
pub(crate) const BUTTON_DEBOUNCE_US: u64 = 200_000;
/// Drift correction never shrinks the coast span below this.
pub(crate) const COAST_FLOOR_US: u64 = 10_000;
/// Drift correction may borrow from the drive span down to this.
pub(crate) const MOTOR_ON_FLOOR_US: u64 = 50_000;
/// Back-EMF research capture runs this long after each mode entry.
pub(crate) const BACK_EMF_CAPTURE_US: u64 = 10_000_000;

/// Firmware version advertised in the post-connect exchange.
pub(crate) const FW_MAJOR: u8 = 1;
pub(crate) const FW_MINOR: u8 = 4;
pub(crate) const FW_PATCH: u16 = 2;
pub(crate) const FW_BUILD_TIMESTAMP: u32 = 0x6641_9d00;

pub type TandemInput = Input<Mac, Message, StoredSettings>;
pub type TandemEffect = Effect<Mac, Message, StoredSettings>;
pub type TandemEffects = Effects<Mac, Message, StoredSettings>;

/// Per-cycle drift correction clamp: max(50 ms, 20 % of the half-period).
pub(crate) fn drift_clamp_us(half_period_us: u64) -> u64 {
    (half_period_us / 5).max(50_000)
}

/// Drift deadband: max(25 ms, 10 % of the half-period).
pub(crate) fn drift_deadband_us(half_period_us: u64) -> u64 {
    (half_period_us / 10).max(25_000)
}

/// MSB-first MAC as an integer, for event-log lines.
pub(crate) fn mac_bits(mac: &Mac) -> u64 {
    mac.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64)
}

/// Wraps defmt::write and returns Ok() to make it behave like core::write!.
#[cfg(feature = "defmt")]
#[macro_export]
macro_rules! defmt_write_wrapper {
    ($($arg:expr),*) => {{
        defmt::write!($($arg),*);
        Ok(())
    }};
}
