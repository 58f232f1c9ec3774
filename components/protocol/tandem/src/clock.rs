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

use heapless::HistoryBuffer;

use crate::*;

/// One raw offset observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimestampSample {
    pub raw_offset_us: i64,
    pub rx_local_us: TimeUs,
}

/// Result of feeding one sample to the filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FilterOutcome {
    Accepted,
    /// Sample deviated beyond the regime's threshold and was dropped
    Outlier,
}

/// EMA filter over raw local-to-remote clock offsets
///
/// Two regimes: fast attack (alpha 30 %, 50 ms outlier threshold) until ten
/// samples have been incorporated, then steady state (alpha 10 %, 100 ms).
/// The handshake seeds the filter through `bootstrap`; without a handshake
/// the first sample is taken verbatim so the device can still converge from
/// beacons alone.
#[derive(Debug, Default)]
pub struct OffsetFilter {
    filtered_offset_us: i64,
    sample_count: u32,
    ring: HistoryBuffer<TimestampSample, OFFSET_RING_LEN>,
    last_beacon_rx_us: TimeUs,
    outlier_count: u32,
    bootstrapped: bool,
}

impl OffsetFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The smoothed local-to-remote offset
    pub fn offset_us(&self) -> i64 {
        self.filtered_offset_us
    }

    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    pub fn outlier_count(&self) -> u32 {
        self.outlier_count
    }

    /// Local receive time of the most recent sample, accepted or not
    pub fn last_beacon_rx_us(&self) -> TimeUs {
        self.last_beacon_rx_us
    }

    pub fn bootstrapped(&self) -> bool {
        self.bootstrapped
    }

    /// Whether the steady-state regime is active
    pub fn steady_state(&self) -> bool {
        self.sample_count >= FAST_ATTACK_SAMPLES
    }

    /// Seed the filter with the handshake offset
    pub fn bootstrap(&mut self, offset_us: i64) {
        self.filtered_offset_us = offset_us;
        self.sample_count = 0;
        self.bootstrapped = true;
    }

    /// Re-enter fast attack, keeping the current offset
    ///
    /// Used after a role swap on reconnect, where the offset sign flips
    /// relative to the new epoch owner.
    pub fn reset_fast_attack(&mut self) {
        self.sample_count = 0;
    }

    /// Incorporate one raw offset sample
    pub fn update(&mut self, raw_offset_us: i64, rx_local_us: TimeUs) -> FilterOutcome {
        self.last_beacon_rx_us = rx_local_us;

        if !self.bootstrapped && self.sample_count == 0 {
            // no handshake result to compare against; take the sample as is
            self.bootstrap(raw_offset_us);
        }

        let (alpha_pct, threshold_us) = if self.steady_state() {
            (ALPHA_STEADY_PCT, OUTLIER_STEADY_US)
        } else {
            (ALPHA_FAST_ATTACK_PCT, OUTLIER_FAST_ATTACK_US)
        };

        let deviation = raw_offset_us - self.filtered_offset_us;
        if deviation.abs() > threshold_us {
            self.outlier_count += 1;
            return FilterOutcome::Outlier;
        }

        self.filtered_offset_us += deviation * alpha_pct / 100;
        self.ring.write(TimestampSample {
            raw_offset_us,
            rx_local_us,
        });
        self.sample_count += 1;
        FilterOutcome::Accepted
    }

    /// Synchronized time for a local instant, saturating at the u64 bounds
    pub fn sync_time(&self, local_us: TimeUs) -> TimeUs {
        if self.filtered_offset_us >= 0 {
            local_us.saturating_add(self.filtered_offset_us as u64)
        } else {
            local_us.saturating_sub(self.filtered_offset_us.unsigned_abs())
        }
    }

    /// Local instant for a synchronized time, saturating at the u64 bounds
    pub fn local_time(&self, sync_us: TimeUs) -> TimeUs {
        if self.filtered_offset_us >= 0 {
            sync_us.saturating_sub(self.filtered_offset_us as u64)
        } else {
            sync_us.saturating_add(self.filtered_offset_us.unsigned_abs())
        }
    }

    /// Mean absolute deviation of the ring samples from the filtered offset
    ///
    /// The quality score uses this as its jitter measure.
    pub fn ring_jitter_us(&self) -> u64 {
        let len = self.ring.len() as u64;
        if len == 0 {
            return 0;
        }
        let sum: u64 = self
            .ring
            .oldest_ordered()
            .map(|s| (s.raw_offset_us - self.filtered_offset_us).unsigned_abs())
            .sum();
        sum / len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_seeds_offset() {
        let mut f = OffsetFilter::new();
        assert_eq!(f.offset_us(), 0);
        f.bootstrap(250_000);
        assert_eq!(f.offset_us(), 250_000);
        assert_eq!(f.sample_count(), 0);
        assert!(!f.steady_state());
    }

    #[test]
    fn fast_attack_converges_quickly() {
        let mut f = OffsetFilter::new();
        f.bootstrap(0);
        // constant raw offset of 10 ms: alpha 30 % closes 30 % of the gap
        assert_eq!(f.update(10_000, 1_000), FilterOutcome::Accepted);
        assert_eq!(f.offset_us(), 3_000);
        assert_eq!(f.update(10_000, 2_000), FilterOutcome::Accepted);
        assert_eq!(f.offset_us(), 3_000 + (10_000 - 3_000) * 30 / 100);
    }

    #[test]
    fn steady_state_after_ten_samples() {
        let mut f = OffsetFilter::new();
        f.bootstrap(0);
        for n in 0..FAST_ATTACK_SAMPLES {
            f.update(0, n as u64);
        }
        assert!(f.steady_state());
        // alpha is now 10 %
        f.update(10_000, 100);
        assert_eq!(f.offset_us(), 1_000);
    }

    #[test]
    fn outlier_rejected_and_counted() {
        let mut f = OffsetFilter::new();
        f.bootstrap(0);
        // fast attack threshold is 50 ms
        assert_eq!(f.update(60_000, 1), FilterOutcome::Outlier);
        assert_eq!(f.offset_us(), 0);
        assert_eq!(f.outlier_count(), 1);
        assert_eq!(f.sample_count(), 0);

        for n in 0..FAST_ATTACK_SAMPLES {
            f.update(0, n as u64);
        }
        // steady state widens the threshold to 100 ms
        assert_eq!(f.update(90_000, 20), FilterOutcome::Accepted);
        assert_eq!(f.update(190_000, 21), FilterOutcome::Outlier);
    }

    #[test]
    fn first_sample_without_bootstrap_taken_verbatim() {
        let mut f = OffsetFilter::new();
        // way beyond any threshold, but there is nothing to compare against
        assert_eq!(f.update(3_000_000, 1), FilterOutcome::Accepted);
        // bootstrap seeds the value, the EMA then pulls it to itself
        assert_eq!(f.offset_us(), 3_000_000);
        assert!(f.bootstrapped());
    }

    #[test]
    fn reset_fast_attack_keeps_offset() {
        let mut f = OffsetFilter::new();
        f.bootstrap(5_000);
        for n in 0..FAST_ATTACK_SAMPLES {
            f.update(5_000, n as u64);
        }
        assert!(f.steady_state());
        f.reset_fast_attack();
        assert!(!f.steady_state());
        assert_eq!(f.offset_us(), 5_000);
    }

    #[test]
    fn sync_time_saturates() {
        let mut f = OffsetFilter::new();
        f.bootstrap(-10_000);
        assert_eq!(f.sync_time(4_000), 0);
        f.bootstrap(10_000);
        assert_eq!(f.sync_time(4_000), 14_000);
        assert_eq!(f.local_time(14_000), 4_000);
        assert_eq!(f.local_time(4_000), 0);
    }

    #[test]
    fn convergence_is_monotonic_without_outliers() {
        let mut f = OffsetFilter::new();
        f.bootstrap(0);
        let mut previous_gap = i64::MAX;
        for n in 0..30 {
            f.update(20_000, n);
            let gap = (20_000 - f.offset_us()).abs();
            assert!(gap <= previous_gap);
            previous_gap = gap;
        }
        assert!(previous_gap < 2_000);
    }

    #[test]
    fn ring_jitter_reflects_sample_spread() {
        let mut f = OffsetFilter::new();
        f.bootstrap(0);
        for n in 0..8 {
            let raw = if n % 2 == 0 { 4_000 } else { -4_000 };
            f.update(raw, n);
        }
        assert!(f.ring_jitter_us() > 2_000);
        assert!(f.ring_jitter_us() < 8_000);
    }
}
