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

use serde::{Deserialize, Serialize};

use crate::settings::StoredSettings;

/// Stimulation mode tag
///
/// M0 through M3 are fixed presets ordered by bilateral frequency; Custom is
/// the user-editable slot configured through the mobile application.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ModeId {
    M0,
    M1,
    M2,
    M3,
    Custom,
}

impl ModeId {
    pub fn as_u8(self) -> u8 {
        match self {
            ModeId::M0 => 0,
            ModeId::M1 => 1,
            ModeId::M2 => 2,
            ModeId::M3 => 3,
            ModeId::Custom => 4,
        }
    }

    pub fn from_u8(raw: u8) -> Option<ModeId> {
        match raw {
            0 => Some(ModeId::M0),
            1 => Some(ModeId::M1),
            2 => Some(ModeId::M2),
            3 => Some(ModeId::M3),
            4 => Some(ModeId::Custom),
            _ => None,
        }
    }

    /// Preset cycled to by a short button press
    pub fn next_preset(self) -> ModeId {
        match self {
            ModeId::M0 => ModeId::M1,
            ModeId::M1 => ModeId::M2,
            ModeId::M2 => ModeId::M3,
            // a button press leaves Custom back to the first preset
            ModeId::M3 | ModeId::Custom => ModeId::M0,
        }
    }

    /// Indicator color shown while a session runs in this mode
    pub fn led_color(self) -> (u8, u8, u8) {
        match self {
            ModeId::M0 => (0, 0, 255),
            ModeId::M1 => (0, 255, 0),
            ModeId::M2 => (255, 0, 255),
            ModeId::M3 => (255, 64, 0),
            ModeId::Custom => (255, 255, 255),
        }
    }

    /// Per-preset intensity ceiling; tightens at higher frequencies
    fn intensity_max_pct(self) -> u8 {
        match self {
            ModeId::M0 | ModeId::Custom => 90,
            ModeId::M1 => 85,
            ModeId::M2 => 75,
            ModeId::M3 => 65,
        }
    }
}

/// Validation failure for a mode configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ModeError {
    FrequencyOutOfRange(u16),
    DutyOutOfRange(u8),
    IntensityOutOfRange(u8),
    MotorOnOutOfRange(u32),
    CoastOutOfRange(u32),
}

/// A complete stimulation configuration
///
/// `freq_centihz` is the bilateral alternation frequency in 1/100 Hz. One
/// cycle holds one ACTIVE half per device; the duty percentage is the PWM
/// drive share of a device's own half.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ModeConfig {
    pub freq_centihz: u16,
    pub motor_active_duty_pct: u8,
    pub pwm_intensity_pct: u8,
}

pub(crate) const FREQ_CENTIHZ_MIN: u16 = 25;
pub(crate) const FREQ_CENTIHZ_MAX: u16 = 200;
const DUTY_PCT_MIN: u8 = 10;
const DUTY_PCT_MAX: u8 = 100;
const INTENSITY_PCT_MIN: u8 = 30;
const MOTOR_ON_MS_MIN: u32 = 50;
const MOTOR_ON_MS_MAX: u32 = 1250;
const COAST_MS_MAX: u32 = 4000;

impl ModeConfig {
    /// Resolve a mode tag against the stored settings
    ///
    /// Presets contribute frequency and duty; the per-mode intensity slot
    /// and the Custom frequency/duty come from settings.
    pub fn resolve(id: ModeId, settings: &StoredSettings) -> ModeConfig {
        let intensity = settings.mode_intensities[id.as_u8() as usize];
        let (freq_centihz, duty) = match id {
            ModeId::M0 => (50, 60),
            ModeId::M1 => (100, 50),
            ModeId::M2 => (150, 40),
            ModeId::M3 => (200, 30),
            ModeId::Custom => (settings.custom_freq_centihz, settings.custom_duty_pct),
        };
        ModeConfig {
            freq_centihz,
            motor_active_duty_pct: duty,
            pwm_intensity_pct: intensity,
        }
    }

    pub fn validate(&self, id: ModeId) -> Result<(), ModeError> {
        if !(FREQ_CENTIHZ_MIN..=FREQ_CENTIHZ_MAX).contains(&self.freq_centihz) {
            return Err(ModeError::FrequencyOutOfRange(self.freq_centihz));
        }
        if !(DUTY_PCT_MIN..=DUTY_PCT_MAX).contains(&self.motor_active_duty_pct) {
            return Err(ModeError::DutyOutOfRange(self.motor_active_duty_pct));
        }
        if !(INTENSITY_PCT_MIN..=id.intensity_max_pct()).contains(&self.pwm_intensity_pct) {
            return Err(ModeError::IntensityOutOfRange(self.pwm_intensity_pct));
        }
        if !(MOTOR_ON_MS_MIN..=MOTOR_ON_MS_MAX).contains(&self.motor_on_ms()) {
            return Err(ModeError::MotorOnOutOfRange(self.motor_on_ms()));
        }
        if self.coast_ms() > COAST_MS_MAX {
            return Err(ModeError::CoastOutOfRange(self.coast_ms()));
        }
        Ok(())
    }

    /// Bilateral alternation period
    ///
    /// Forced even so that the two half-periods always sum back to it.
    pub fn cycle_period_ms(&self) -> u32 {
        (100_000 / self.freq_centihz as u32) & !1
    }

    /// One device's ACTIVE span
    pub fn half_period_ms(&self) -> u32 {
        self.cycle_period_ms() / 2
    }

    /// PWM drive duration inside an ACTIVE half
    pub fn motor_on_ms(&self) -> u32 {
        self.half_period_ms() * self.motor_active_duty_pct as u32 / 100
    }

    /// Freewheel duration inside an ACTIVE half
    pub fn coast_ms(&self) -> u32 {
        self.half_period_ms() - self.motor_on_ms()
    }

    pub fn cycle_period_us(&self) -> u64 {
        self.cycle_period_ms() as u64 * 1000
    }

    pub fn half_period_us(&self) -> u64 {
        self.half_period_ms() as u64 * 1000
    }

    pub fn motor_on_us(&self) -> u64 {
        self.motor_on_ms() as u64 * 1000
    }

    pub fn coast_us(&self) -> u64 {
        self.coast_ms() as u64 * 1000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> StoredSettings {
        StoredSettings::default()
    }

    #[test]
    fn preset_timings() {
        let m1 = ModeConfig::resolve(ModeId::M1, &settings());
        assert_eq!(m1.cycle_period_ms(), 1000);
        assert_eq!(m1.half_period_ms(), 500);
        assert_eq!(m1.motor_on_ms(), 250);
        assert_eq!(m1.coast_ms(), 250);

        let m3 = ModeConfig::resolve(ModeId::M3, &settings());
        assert_eq!(m3.cycle_period_ms(), 500);
        assert_eq!(m3.motor_on_ms(), 75);
    }

    #[test]
    fn presets_are_valid() {
        for id in [
            ModeId::M0,
            ModeId::M1,
            ModeId::M2,
            ModeId::M3,
            ModeId::Custom,
        ] {
            let config = ModeConfig::resolve(id, &settings());
            assert_eq!(config.validate(id), Ok(()), "{:?}", id);
        }
    }

    #[test]
    fn half_periods_sum_to_cycle_over_full_range() {
        for freq in FREQ_CENTIHZ_MIN..=FREQ_CENTIHZ_MAX {
            for duty in [10, 37, 50, 100] {
                let config = ModeConfig {
                    freq_centihz: freq,
                    motor_active_duty_pct: duty,
                    pwm_intensity_pct: 50,
                };
                assert_eq!(
                    config.motor_on_ms() + config.coast_ms(),
                    config.half_period_ms()
                );
                assert_eq!(
                    config.half_period_ms() + config.half_period_ms(),
                    config.cycle_period_ms()
                );
            }
        }
    }

    #[test]
    fn boundary_frequencies() {
        let slow = ModeConfig {
            freq_centihz: 25,
            motor_active_duty_pct: 30,
            pwm_intensity_pct: 50,
        };
        assert_eq!(slow.cycle_period_ms(), 4000);
        let fast = ModeConfig {
            freq_centihz: 200,
            motor_active_duty_pct: 30,
            pwm_intensity_pct: 50,
        };
        assert_eq!(fast.cycle_period_ms(), 500);
    }

    #[test]
    fn validation_rejects_out_of_range() {
        let mut config = ModeConfig::resolve(ModeId::M1, &settings());
        config.freq_centihz = 24;
        assert_eq!(
            config.validate(ModeId::M1),
            Err(ModeError::FrequencyOutOfRange(24))
        );

        let mut config = ModeConfig::resolve(ModeId::M1, &settings());
        config.motor_active_duty_pct = 5;
        assert_eq!(config.validate(ModeId::M1), Err(ModeError::DutyOutOfRange(5)));

        // intensity ceilings tighten at higher preset frequencies
        let mut config = ModeConfig::resolve(ModeId::M3, &settings());
        config.pwm_intensity_pct = 80;
        assert_eq!(
            config.validate(ModeId::M3),
            Err(ModeError::IntensityOutOfRange(80))
        );
        config.pwm_intensity_pct = 65;
        assert_eq!(config.validate(ModeId::M3), Ok(()));
    }

    #[test]
    fn motor_on_floor_enforced() {
        // 2 Hz with 10 % duty would drive for 25 ms, below the floor
        let config = ModeConfig {
            freq_centihz: 200,
            motor_active_duty_pct: 10,
            pwm_intensity_pct: 50,
        };
        assert_eq!(
            config.validate(ModeId::Custom),
            Err(ModeError::MotorOnOutOfRange(25))
        );
    }
}
