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

/// Device role within a session
///
/// The Server owns the authoritative motor epoch and emits beacons; the
/// Client follows in antiphase and reports its activations. A device whose
/// pairing window closes without a peer runs Standalone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Role {
    #[default]
    None,
    Server,
    Client,
    Standalone,
}

impl Role {
    pub fn is_server(self) -> bool {
        matches!(self, Role::Server)
    }

    pub fn is_client(self) -> bool {
        matches!(self, Role::Client)
    }

    /// Whether this role owns a motor epoch of its own
    pub fn owns_epoch(self) -> bool {
        matches!(self, Role::Server | Role::Standalone)
    }
}

/// Deterministic role assignment at connection time
///
/// Higher battery wins Server. On equal battery the MSB-first lower MAC
/// wins Server. MACs are unique, so the rule never ties.
pub(crate) fn negotiate(own_battery: u8, own_mac: &Mac, peer_battery: u8, peer_mac: &Mac) -> Role {
    if own_battery != peer_battery {
        if own_battery > peer_battery {
            Role::Server
        } else {
            Role::Client
        }
    } else if own_mac < peer_mac {
        Role::Server
    } else {
        Role::Client
    }
}

/// Connection-race arbitration: the lower MAC initiates the connection.
///
/// Link-layer initiator and device role are independent; battery comparison
/// alone decides Server.
pub(crate) fn is_initiator(own_mac: &Mac, peer_mac: &Mac) -> bool {
    own_mac < peer_mac
}

/// The 30-second window after power-on in which bilateral discovery runs
#[derive(Debug, Clone, Copy)]
pub(crate) struct PairingWindow {
    opened_at: TimeUs,
    closed: bool,
}

impl PairingWindow {
    pub(crate) fn open(now: TimeUs) -> Self {
        PairingWindow {
            opened_at: now,
            closed: false,
        }
    }

    /// Close on first peer identification or expiry, whichever comes first
    pub(crate) fn close(&mut self) {
        self.closed = true;
    }

    pub(crate) fn is_open(&self, now: TimeUs) -> bool {
        !self.closed && now < self.opened_at + PAIRING_WINDOW_US
    }

    pub(crate) fn end(&self) -> TimeUs {
        self.opened_at + PAIRING_WINDOW_US
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC_LOW: Mac = [0x10, 0, 0, 0, 0, 1];
    const MAC_HIGH: Mac = [0x10, 0, 0, 0, 0, 2];

    #[test]
    fn higher_battery_is_server() {
        assert_eq!(negotiate(97, &MAC_HIGH, 96, &MAC_LOW), Role::Server);
        assert_eq!(negotiate(96, &MAC_LOW, 97, &MAC_HIGH), Role::Client);
    }

    #[test]
    fn equal_battery_lower_mac_is_server() {
        assert_eq!(negotiate(80, &MAC_LOW, 80, &MAC_HIGH), Role::Server);
        assert_eq!(negotiate(80, &MAC_HIGH, 80, &MAC_LOW), Role::Client);
    }

    #[test]
    fn mac_comparison_is_msb_first() {
        let a: Mac = [0x01, 0xff, 0xff, 0xff, 0xff, 0xff];
        let b: Mac = [0x02, 0x00, 0x00, 0x00, 0x00, 0x00];
        assert_eq!(negotiate(50, &a, 50, &b), Role::Server);
    }

    #[test]
    fn exactly_one_server_for_any_pair() {
        let pairs = [(97u8, 96u8), (50, 50), (1, 100), (100, 100)];
        for (b1, b2) in pairs {
            let r1 = negotiate(b1, &MAC_LOW, b2, &MAC_HIGH);
            let r2 = negotiate(b2, &MAC_HIGH, b1, &MAC_LOW);
            assert!(
                (r1 == Role::Server && r2 == Role::Client)
                    || (r1 == Role::Client && r2 == Role::Server)
            );
        }
    }

    #[test]
    fn window_closes_on_expiry_or_peer() {
        let w = PairingWindow::open(1_000_000);
        assert!(w.is_open(1_000_000));
        assert!(w.is_open(30_999_999));
        assert!(!w.is_open(31_000_000));

        let mut w2 = PairingWindow::open(0);
        w2.close();
        assert!(!w2.is_open(1));
    }
}
