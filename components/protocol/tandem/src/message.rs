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

use core::fmt::Display;
use heapless::Vec;

use crate::*;

/// Largest frame on the link: one tag byte plus the widest payload.
pub const FRAME_MAX: usize = 32;

const TAG_TIME_REQUEST: u8 = 0x01;
const TAG_TIME_RESPONSE: u8 = 0x02;
const TAG_BEACON: u8 = 0x03;
const TAG_MODE_CHANGE_PROPOSAL: u8 = 0x04;
const TAG_MOTOR_STARTED: u8 = 0x05;
const TAG_SETTINGS: u8 = 0x06;
const TAG_ACTIVATION_REPORT: u8 = 0x07;
const TAG_SHUTDOWN: u8 = 0x08;
const TAG_START_ADVERTISING: u8 = 0x09;
const TAG_CLIENT_BATTERY: u8 = 0x0a;
const TAG_FIRMWARE_VERSION: u8 = 0x0b;

/// Periodic time beacon, SERVER to CLIENT
///
/// 23-byte little-endian payload:
///
/// ```text
/// offset size  field
///   0     1    sequence
///   1     8    server_time_us
///   9     8    motor_epoch_us
///  17     2    cycle_period_ms
///  19     1    motor_active_duty_pct
///  20     1    mode_id
///  21     2    reserved (zero)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Beacon {
    /// Monotonically increasing mod 256; wrap is tolerated
    pub sequence: u8,
    /// Synchronized time at send
    pub server_time_us: u64,
    pub motor_epoch_us: u64,
    pub cycle_period_ms: u16,
    pub motor_active_duty_pct: u8,
    pub mode_id: u8,
}

/// Coordination message exchanged over the radio link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Handshake request, CLIENT to SERVER. `t1` is the sender's local
    /// time at send.
    TimeRequest { t1: u64 },
    /// Handshake reply. `t2`/`t3` are the responder's local receive and
    /// respond times.
    TimeResponse { t1: u64, t2: u64, t3: u64 },
    Beacon(Beacon),
    /// Two-phase mode change. `armed_epoch_us == 0` marks a CLIENT request
    /// that asks the SERVER to pick the boundary.
    ModeChangeProposal {
        armed_epoch_us: u64,
        mode_id: u8,
        freq_centihz: u16,
        motor_active_duty_pct: u8,
        pwm_intensity_pct: u8,
    },
    /// SERVER notification after motor activation starts
    MotorStarted { epoch_us: u64, cycle_period_ms: u16 },
    /// Settings sync after a configuration write
    Settings {
        custom_freq_centihz: u16,
        custom_duty_pct: u8,
        active_intensity_pct: u8,
        mode_intensities: [u8; 5],
    },
    /// Paired-timestamp report, CLIENT to SERVER. `t1` is the last beacon's
    /// server time, `t2` its local receive time, `t3` the report send time.
    ActivationReport {
        cycle_index: u32,
        phase_error_ms: i16,
        t1: u64,
        t2: u64,
        t3: u64,
    },
    Shutdown,
    StartAdvertising,
    ClientBattery { pct: u8 },
    FirmwareVersion {
        major: u8,
        minor: u8,
        patch: u16,
        build_timestamp: u32,
    },
}

/// Decode failure; the packet is dropped and counted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DecodeError {
    Empty,
    UnknownTag(u8),
    BadLength { tag: u8, len: usize },
}

fn u16_at(b: &[u8], i: usize) -> u16 {
    let mut a = [0u8; 2];
    a.copy_from_slice(&b[i..i + 2]);
    u16::from_le_bytes(a)
}

fn i16_at(b: &[u8], i: usize) -> i16 {
    u16_at(b, i) as i16
}

fn u32_at(b: &[u8], i: usize) -> u32 {
    let mut a = [0u8; 4];
    a.copy_from_slice(&b[i..i + 4]);
    u32::from_le_bytes(a)
}

fn u64_at(b: &[u8], i: usize) -> u64 {
    let mut a = [0u8; 8];
    a.copy_from_slice(&b[i..i + 8]);
    u64::from_le_bytes(a)
}

impl Message {
    fn tag(&self) -> u8 {
        match self {
            Message::TimeRequest { .. } => TAG_TIME_REQUEST,
            Message::TimeResponse { .. } => TAG_TIME_RESPONSE,
            Message::Beacon(_) => TAG_BEACON,
            Message::ModeChangeProposal { .. } => TAG_MODE_CHANGE_PROPOSAL,
            Message::MotorStarted { .. } => TAG_MOTOR_STARTED,
            Message::Settings { .. } => TAG_SETTINGS,
            Message::ActivationReport { .. } => TAG_ACTIVATION_REPORT,
            Message::Shutdown => TAG_SHUTDOWN,
            Message::StartAdvertising => TAG_START_ADVERTISING,
            Message::ClientBattery { .. } => TAG_CLIENT_BATTERY,
            Message::FirmwareVersion { .. } => TAG_FIRMWARE_VERSION,
        }
    }

    /// Expected payload length for a tag
    fn payload_len(tag: u8) -> Option<usize> {
        match tag {
            TAG_TIME_REQUEST => Some(8),
            TAG_TIME_RESPONSE => Some(24),
            TAG_BEACON => Some(23),
            TAG_MODE_CHANGE_PROPOSAL => Some(13),
            TAG_MOTOR_STARTED => Some(10),
            TAG_SETTINGS => Some(9),
            TAG_ACTIVATION_REPORT => Some(30),
            TAG_SHUTDOWN | TAG_START_ADVERTISING => Some(0),
            TAG_CLIENT_BATTERY => Some(1),
            TAG_FIRMWARE_VERSION => Some(8),
            _ => None,
        }
    }

    /// Serialize to the fixed little-endian frame layout
    pub fn encode(&self) -> Vec<u8, FRAME_MAX> {
        let mut out: Vec<u8, FRAME_MAX> = Vec::new();
        // frames are sized for FRAME_MAX, pushes cannot fail
        let _ = out.push(self.tag());
        let put = |out: &mut Vec<u8, FRAME_MAX>, bytes: &[u8]| {
            let _ = out.extend_from_slice(bytes);
        };
        match self {
            Message::TimeRequest { t1 } => put(&mut out, &t1.to_le_bytes()),
            Message::TimeResponse { t1, t2, t3 } => {
                put(&mut out, &t1.to_le_bytes());
                put(&mut out, &t2.to_le_bytes());
                put(&mut out, &t3.to_le_bytes());
            }
            Message::Beacon(b) => {
                let _ = out.push(b.sequence);
                put(&mut out, &b.server_time_us.to_le_bytes());
                put(&mut out, &b.motor_epoch_us.to_le_bytes());
                put(&mut out, &b.cycle_period_ms.to_le_bytes());
                let _ = out.push(b.motor_active_duty_pct);
                let _ = out.push(b.mode_id);
                put(&mut out, &0u16.to_le_bytes());
            }
            Message::ModeChangeProposal {
                armed_epoch_us,
                mode_id,
                freq_centihz,
                motor_active_duty_pct,
                pwm_intensity_pct,
            } => {
                put(&mut out, &armed_epoch_us.to_le_bytes());
                let _ = out.push(*mode_id);
                put(&mut out, &freq_centihz.to_le_bytes());
                let _ = out.push(*motor_active_duty_pct);
                let _ = out.push(*pwm_intensity_pct);
            }
            Message::MotorStarted {
                epoch_us,
                cycle_period_ms,
            } => {
                put(&mut out, &epoch_us.to_le_bytes());
                put(&mut out, &cycle_period_ms.to_le_bytes());
            }
            Message::Settings {
                custom_freq_centihz,
                custom_duty_pct,
                active_intensity_pct,
                mode_intensities,
            } => {
                put(&mut out, &custom_freq_centihz.to_le_bytes());
                let _ = out.push(*custom_duty_pct);
                let _ = out.push(*active_intensity_pct);
                put(&mut out, mode_intensities);
            }
            Message::ActivationReport {
                cycle_index,
                phase_error_ms,
                t1,
                t2,
                t3,
            } => {
                put(&mut out, &cycle_index.to_le_bytes());
                put(&mut out, &phase_error_ms.to_le_bytes());
                put(&mut out, &t1.to_le_bytes());
                put(&mut out, &t2.to_le_bytes());
                put(&mut out, &t3.to_le_bytes());
            }
            Message::Shutdown | Message::StartAdvertising => {}
            Message::ClientBattery { pct } => {
                let _ = out.push(*pct);
            }
            Message::FirmwareVersion {
                major,
                minor,
                patch,
                build_timestamp,
            } => {
                let _ = out.push(*major);
                let _ = out.push(*minor);
                put(&mut out, &patch.to_le_bytes());
                put(&mut out, &build_timestamp.to_le_bytes());
            }
        }
        out
    }

    /// Deserialize a frame
    pub fn decode(frame: &[u8]) -> Result<Message, DecodeError> {
        let (&tag, payload) = frame.split_first().ok_or(DecodeError::Empty)?;
        let expected = Message::payload_len(tag).ok_or(DecodeError::UnknownTag(tag))?;
        if payload.len() != expected {
            return Err(DecodeError::BadLength {
                tag,
                len: payload.len(),
            });
        }
        let p = payload;
        Ok(match tag {
            TAG_TIME_REQUEST => Message::TimeRequest { t1: u64_at(p, 0) },
            TAG_TIME_RESPONSE => Message::TimeResponse {
                t1: u64_at(p, 0),
                t2: u64_at(p, 8),
                t3: u64_at(p, 16),
            },
            TAG_BEACON => Message::Beacon(Beacon {
                sequence: p[0],
                server_time_us: u64_at(p, 1),
                motor_epoch_us: u64_at(p, 9),
                cycle_period_ms: u16_at(p, 17),
                motor_active_duty_pct: p[19],
                mode_id: p[20],
            }),
            TAG_MODE_CHANGE_PROPOSAL => Message::ModeChangeProposal {
                armed_epoch_us: u64_at(p, 0),
                mode_id: p[8],
                freq_centihz: u16_at(p, 9),
                motor_active_duty_pct: p[11],
                pwm_intensity_pct: p[12],
            },
            TAG_MOTOR_STARTED => Message::MotorStarted {
                epoch_us: u64_at(p, 0),
                cycle_period_ms: u16_at(p, 8),
            },
            TAG_SETTINGS => {
                let mut mode_intensities = [0u8; 5];
                mode_intensities.copy_from_slice(&p[4..9]);
                Message::Settings {
                    custom_freq_centihz: u16_at(p, 0),
                    custom_duty_pct: p[2],
                    active_intensity_pct: p[3],
                    mode_intensities,
                }
            }
            TAG_ACTIVATION_REPORT => Message::ActivationReport {
                cycle_index: u32_at(p, 0),
                phase_error_ms: i16_at(p, 4),
                t1: u64_at(p, 6),
                t2: u64_at(p, 14),
                t3: u64_at(p, 22),
            },
            TAG_SHUTDOWN => Message::Shutdown,
            TAG_START_ADVERTISING => Message::StartAdvertising,
            TAG_CLIENT_BATTERY => Message::ClientBattery { pct: p[0] },
            TAG_FIRMWARE_VERSION => Message::FirmwareVersion {
                major: p[0],
                minor: p[1],
                patch: u16_at(p, 2),
                build_timestamp: u32_at(p, 4),
            },
            _ => unreachable!(),
        })
    }
}

/// message as JSON to make it parseable
macro_rules! message_to_json_string {
    ($fmt:expr,$write:tt,$message:expr) => {
        match $message {
            Message::TimeRequest { t1 } => {
                $write!($fmt, "{{\"kind\":\"time_request\",\"t1\":{}}}", t1)
            }
            Message::TimeResponse { t1, t2, t3 } => {
                $write!(
                    $fmt,
                    "{{\"kind\":\"time_response\",\"t1\":{},\"t2\":{},\"t3\":{}}}",
                    t1,
                    t2,
                    t3
                )
            }
            Message::Beacon(b) => {
                $write!(
                    $fmt,
                    "{{\"kind\":\"beacon\",\"seq\":{},\"server_time_us\":{},\"epoch_us\":{},\"cycle_ms\":{},\"duty\":{},\"mode\":{}}}",
                    b.sequence,
                    b.server_time_us,
                    b.motor_epoch_us,
                    b.cycle_period_ms,
                    b.motor_active_duty_pct,
                    b.mode_id
                )
            }
            Message::ModeChangeProposal {
                armed_epoch_us,
                mode_id,
                freq_centihz,
                motor_active_duty_pct,
                pwm_intensity_pct,
            } => {
                $write!(
                    $fmt,
                    "{{\"kind\":\"mode_change\",\"armed_epoch_us\":{},\"mode\":{},\"freq_chz\":{},\"duty\":{},\"intensity\":{}}}",
                    armed_epoch_us,
                    mode_id,
                    freq_centihz,
                    motor_active_duty_pct,
                    pwm_intensity_pct
                )
            }
            Message::MotorStarted {
                epoch_us,
                cycle_period_ms,
            } => {
                $write!(
                    $fmt,
                    "{{\"kind\":\"motor_started\",\"epoch_us\":{},\"cycle_ms\":{}}}",
                    epoch_us,
                    cycle_period_ms
                )
            }
            Message::Settings {
                custom_freq_centihz,
                custom_duty_pct,
                active_intensity_pct,
                mode_intensities,
            } => {
                $write!(
                    $fmt,
                    "{{\"kind\":\"settings\",\"freq_chz\":{},\"duty\":{},\"intensity\":{},\"mode_intensities\":[{},{},{},{},{}]}}",
                    custom_freq_centihz,
                    custom_duty_pct,
                    active_intensity_pct,
                    mode_intensities[0],
                    mode_intensities[1],
                    mode_intensities[2],
                    mode_intensities[3],
                    mode_intensities[4]
                )
            }
            Message::ActivationReport {
                cycle_index,
                phase_error_ms,
                t1,
                t2,
                t3,
            } => {
                $write!(
                    $fmt,
                    "{{\"kind\":\"activation_report\",\"cycle\":{},\"phase_error_ms\":{},\"t1\":{},\"t2\":{},\"t3\":{}}}",
                    cycle_index,
                    phase_error_ms,
                    t1,
                    t2,
                    t3
                )
            }
            Message::Shutdown => {
                $write!($fmt, "{{\"kind\":\"shutdown\"}}")
            }
            Message::StartAdvertising => {
                $write!($fmt, "{{\"kind\":\"start_advertising\"}}")
            }
            Message::ClientBattery { pct } => {
                $write!($fmt, "{{\"kind\":\"client_battery\",\"pct\":{}}}", pct)
            }
            Message::FirmwareVersion {
                major,
                minor,
                patch,
                build_timestamp,
            } => {
                $write!(
                    $fmt,
                    "{{\"kind\":\"firmware_version\",\"version\":\"{}.{}.{}\",\"build\":{}}}",
                    major,
                    minor,
                    patch,
                    build_timestamp
                )
            }
        }
    };
}

impl Display for Message {
    fn fmt(&self, fmt: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        message_to_json_string!(fmt, write, self)
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Message {
    fn format(&self, fmt: defmt::Formatter) {
        fn wrapper(msg: &Message, fmt: defmt::Formatter) -> core::fmt::Result {
            message_to_json_string!(fmt, defmt_write_wrapper, msg)
        }
        let _ = wrapper(self, fmt);
    }
}
