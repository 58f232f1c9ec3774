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

/// Motor scheduler state
///
/// Content of a state is what is required to produce the state's action.
/// Targets inside an ACTIVE half are pinned in local time at entry; the
/// INACTIVE target stays in the synchronized domain so offset updates
/// shift the wake-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum State {
    /// Powered but no session: motors off, nothing scheduled
    #[default]
    Idle,
    /// Session starting; waiting for role assignment and, on the client,
    /// the initial epoch and lock
    PairingWait,
    /// Queue drained, armed changes honored, next state chosen by role and
    /// cycle position. `end` bounds the re-poll while nothing is runnable.
    CheckMessages { end: TimeUs },
    /// PWM drive, forward polarity, until `off_at` (local)
    ForwardActive { off_at: TimeUs, active_end: TimeUs },
    /// Freewheel span completing an ACTIVE half
    Coast { end: TimeUs },
    /// The peer's half of the cycle; wake at the sync-domain target
    Inactive { until_sync: TimeUs },
    /// PWM drive, reverse polarity
    ReverseActive { off_at: TimeUs, active_end: TimeUs },
    /// Terminal: motor coasted, peer notified, deep sleep requested
    Shutdown,
}

impl State {
    /// Returns a state's action
    ///
    /// Waits are chunked so the loop re-checks its queue at least every
    /// `MAX_WAIT_CHUNK_US` (50 ms while a mode change is armed), which is
    /// also what keeps the watchdog fed.
    pub(crate) fn action(&self, now: TimeUs, sync: &TimeSync) -> Action<TimeUs> {
        let chunked = |end: TimeUs| Action::Wait {
            end: end.min(now + MAX_WAIT_CHUNK_US).max(now),
        };
        match self {
            State::Idle => Action::Wait {
                end: now + MAX_WAIT_CHUNK_US,
            },
            State::PairingWait => Action::Wait {
                end: now + ARMED_POLL_US,
            },
            State::CheckMessages { end } => Action::Wait {
                end: (*end).min(now + ARMED_POLL_US).max(now),
            },
            State::ForwardActive { off_at, .. } | State::ReverseActive { off_at, .. } => {
                chunked(*off_at)
            }
            State::Coast { end } => chunked(*end),
            State::Inactive { until_sync } => chunked(sync.local_from_sync(*until_sync)),
            State::Shutdown => Action::Sleep,
        }
    }

    fn state_as_string(&self) -> &str {
        match self {
            State::Idle => "Idle",
            State::PairingWait => "PairingWait",
            State::CheckMessages { .. } => "CheckMessages",
            State::ForwardActive { .. } => "ForwardActive",
            State::Coast { .. } => "Coast",
            State::Inactive { .. } => "Inactive",
            State::ReverseActive { .. } => "ReverseActive",
            State::Shutdown => "Shutdown",
        }
    }
}

impl core::fmt::Display for State {
    fn fmt(&self, fmt: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(fmt, "{}", self.state_as_string())
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for State {
    fn format(&self, fmt: defmt::Formatter) {
        use defmt::write;
        write!(fmt, "{}", self.state_as_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waits_are_chunked() {
        let sync = TimeSync::new();
        // a 4 s half-cycle wait must not exceed the watchdog chunk
        let state = State::Inactive {
            until_sync: 4_000_000,
        };
        match state.action(0, &sync) {
            Action::Wait { end } => assert_eq!(end, MAX_WAIT_CHUNK_US),
            action => panic!("unexpected action {:?}", action),
        }
        // near the target the wait narrows to it
        match state.action(3_950_000, &sync) {
            Action::Wait { end } => assert_eq!(end, 4_000_000),
            action => panic!("unexpected action {:?}", action),
        }
    }

    #[test]
    fn check_messages_polls_at_armed_rate() {
        let sync = TimeSync::new();
        let state = State::CheckMessages { end: 10_000_000 };
        match state.action(0, &sync) {
            Action::Wait { end } => assert_eq!(end, ARMED_POLL_US),
            action => panic!("unexpected action {:?}", action),
        }
    }

    #[test]
    fn wait_never_lies_in_the_past() {
        let sync = TimeSync::new();
        let state = State::Coast { end: 1_000 };
        match state.action(5_000, &sync) {
            Action::Wait { end } => assert_eq!(end, 5_000),
            action => panic!("unexpected action {:?}", action),
        }
    }

    #[test]
    fn shutdown_is_terminal() {
        let sync = TimeSync::new();
        assert_eq!(State::Shutdown.action(0, &sync), Action::Sleep);
    }
}
