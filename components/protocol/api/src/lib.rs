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

use heapless::Vec;

/// Maximum number of side effects a single `progress` call may emit.
pub const MAX_EFFECTS: usize = 8;

/// Side effects of one `progress` call, executed by the platform in order.
pub type Effects<ADDR, MESSAGE, SETTINGS> = Vec<Effect<ADDR, MESSAGE, SETTINGS>, MAX_EFFECTS>;

/// A state's temporal directive
///
/// Tells the platform when to call `progress` again. Input arriving before
/// `end` interrupts the wait and is delivered with the next call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Action<TIME> {
    /// Call `progress` again immediately
    None,
    /// Sleep until `end` (device-local time)
    Wait { end: TIME },
    /// Terminal. Enter deep sleep; the device is only left via a wake reset.
    Sleep,
}

/// Advertised service selector
///
/// During the pairing window a device advertises the bilateral service (with
/// its battery percentage in the service data) so it can be identified as a
/// peer. After the window closes only the configuration service remains
/// visible, for the mobile application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Service {
    Bilateral,
    Configuration,
}

/// Fire-and-forget side effect requested by the core
///
/// Transmission is best effort: the platform reports no completion and the
/// protocol tolerates loss.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Effect<ADDR, MESSAGE, SETTINGS> {
    Transmit(MESSAGE),
    /// Raise TX power to the radio's maximum (+9 dBm where available) to
    /// survive enclosure and body attenuation
    SetTxPowerMax,
    MotorForward { intensity_pct: u8 },
    MotorReverse { intensity_pct: u8 },
    MotorCoast,
    LedColor { r: u8, g: u8, b: u8 },
    /// Blink `count` times in the given color, then restore
    LedBlink { r: u8, g: u8, b: u8, count: u8 },
    LedClear,
    /// Start advertising the given service, `battery_pct` in the service data
    Advertise { service: Service, battery_pct: u8 },
    StopAdvertising,
    /// Scan for peers advertising the given service
    StartScan { service: Service },
    StopScan,
    ConnectTo { peer: ADDR },
    Disconnect,
    /// Take one back-EMF sample (research capture, first seconds of a mode)
    SampleBackEmf,
    /// Write settings to the persistent store. Failures are logged by the
    /// platform, never reported back.
    Persist(SETTINGS),
}

/// External stimulus delivered to `progress`
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Input<ADDR, MESSAGE, SETTINGS> {
    /// Decoded packet from the connected peer
    Packet(MESSAGE),
    /// Button released before the hold threshold
    ButtonShort,
    /// Button held past the shutdown threshold
    ButtonHold,
    /// Fresh battery measurement
    Battery { pct: u8 },
    /// Scan result for the service requested with `Effect::StartScan`
    Discovered { peer: ADDR, battery_pct: u8 },
    Connected { peer: ADDR },
    ConnectFailed,
    Disconnected { reason: u8 },
    /// Configuration write from the mobile application
    SettingsWrite(SETTINGS),
}

/// A bilateral coordination core
///
/// One instance per device. The platform calls `progress` with the local
/// monotonic time and at most one input, executes the returned effects in
/// order and honors the action. `progress` must be called again as soon as
/// input arrives, even while a `Wait` is pending.
pub trait Coordinator {
    type TimeUs: Copy + Eq + Ord;
    type Addr: Copy + Eq;
    type Message: Clone + PartialEq;
    type Settings: Clone;

    /// `stored` is the persisted settings blob content, if the store had one
    fn new(addr: Self::Addr, battery_pct: u8, stored: Option<Self::Settings>) -> Self;

    /// Make progress in the state machine
    ///
    /// Must be called again after the returned action has been executed.
    #[must_use]
    #[allow(clippy::type_complexity)]
    fn progress(
        &mut self,
        now: Self::TimeUs,
        input: Option<Input<Self::Addr, Self::Message, Self::Settings>>,
    ) -> (
        Action<Self::TimeUs>,
        Effects<Self::Addr, Self::Message, Self::Settings>,
    );

    /// Get the device's link-layer address
    fn addr(&self) -> Self::Addr;
}
