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

use crate::mode::ModeId;
use crate::Message;

/// Largest postcard encoding of a settings record.
pub const SETTINGS_BLOB_MAX: usize = 16;

/// User settings kept in the persistent store
///
/// Missing or unreadable blobs yield `Default`. The store collaborator owns
/// the key layout; the core hands it one record through
/// `Effect::Persist`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StoredSettings {
    pub current_mode: ModeId,
    pub custom_freq_centihz: u16,
    pub custom_duty_pct: u8,
    /// Intensity slot per mode, indexed by `ModeId::as_u8`
    pub mode_intensities: [u8; 5],
}

impl Default for StoredSettings {
    fn default() -> Self {
        StoredSettings {
            current_mode: ModeId::M1,
            custom_freq_centihz: 100,
            custom_duty_pct: 50,
            mode_intensities: [55, 65, 60, 50, 65],
        }
    }
}

impl StoredSettings {
    /// Serialize for the persistent store
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, postcard::Error> {
        Ok(postcard::to_slice(self, buf)?.len())
    }

    /// Deserialize a stored blob
    pub fn decode(blob: &[u8]) -> Result<StoredSettings, postcard::Error> {
        postcard::from_bytes(blob)
    }

    /// Settings-sync message describing this record
    pub fn sync_message(&self) -> Message {
        Message::Settings {
            custom_freq_centihz: self.custom_freq_centihz,
            custom_duty_pct: self.custom_duty_pct,
            active_intensity_pct: self.mode_intensities[self.current_mode.as_u8() as usize],
            mode_intensities: self.mode_intensities,
        }
    }

    /// Merge a settings-sync message from the peer
    ///
    /// The mode tag itself travels via mode-change proposals, not here.
    pub fn apply_sync(&mut self, msg: &Message) {
        if let Message::Settings {
            custom_freq_centihz,
            custom_duty_pct,
            mode_intensities,
            ..
        } = msg
        {
            self.custom_freq_centihz = *custom_freq_centihz;
            self.custom_duty_pct = *custom_duty_pct;
            self.mode_intensities = *mode_intensities;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::ModeConfig;

    #[test]
    fn blob_roundtrip() {
        let settings = StoredSettings {
            current_mode: ModeId::Custom,
            custom_freq_centihz: 75,
            custom_duty_pct: 35,
            mode_intensities: [55, 65, 60, 50, 80],
        };
        let mut buf = [0u8; SETTINGS_BLOB_MAX];
        let len = settings.encode(&mut buf).unwrap();
        assert_eq!(StoredSettings::decode(&buf[..len]).unwrap(), settings);
    }

    #[test]
    fn sync_preserves_derived_timing() {
        // writing a setting and syncing it must yield the same derived
        // cycle timing on both devices
        let mut a = StoredSettings::default();
        a.custom_freq_centihz = 80;
        a.custom_duty_pct = 45;
        let mut b = StoredSettings::default();
        b.apply_sync(&a.sync_message());

        let config_a = ModeConfig::resolve(ModeId::Custom, &a);
        let config_b = ModeConfig::resolve(ModeId::Custom, &b);
        assert_eq!(config_a.cycle_period_ms(), config_b.cycle_period_ms());
        assert_eq!(config_a.motor_on_ms(), config_b.motor_on_ms());
    }

    #[test]
    fn default_blob_fits_buffer() {
        let mut buf = [0u8; SETTINGS_BLOB_MAX];
        assert!(StoredSettings::default().encode(&mut buf).is_ok());
    }
}
