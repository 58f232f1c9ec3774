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

//! Macros for generating parseable event log messages

#[macro_export]
macro_rules! event_log {
    ($uptime:expr,$mac:expr,$kind:expr,$content:expr) => {
        info!("${};{:x};{};{}", $uptime, $mac, $kind, $content);
    };
}

#[macro_export]
macro_rules! event_log_msg {
    ($uptime:expr,$mac:expr,$content:expr) => {
        event_log!($uptime, $mac, "message", $content);
    };
}

#[macro_export]
macro_rules! event_log_state {
    ($uptime:expr,$mac:expr,$new_state:expr) => {
        info!("${};{:x};state;\"{}\"", $uptime, $mac, $new_state);
    };
}

#[macro_export]
macro_rules! event_log_role {
    ($uptime:expr,$mac:expr,$role:expr,$peer_battery:expr) => {
        info!(
            "${};{:x};role;{{\"role\":\"{:?}\",\"peer_battery\":{}}}",
            $uptime, $mac, $role, $peer_battery
        );
    };
}

#[macro_export]
macro_rules! event_log_cycle {
    ($uptime:expr,$mac:expr,$kind:expr,$sync_time:expr) => {
        info!(
            "${};{:x};{};{{\"sync_us\":{}}}",
            $uptime, $mac, $kind, $sync_time
        );
    };
}

#[macro_export]
macro_rules! event_log_mode {
    ($uptime:expr,$mac:expr,$mode:expr,$cycle_ms:expr) => {
        info!(
            "${};{:x};mode;{{\"mode\":\"{:?}\",\"cycle_ms\":{}}}",
            $uptime, $mac, $mode, $cycle_ms
        );
    };
}
