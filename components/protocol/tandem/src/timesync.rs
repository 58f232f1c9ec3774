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

/// Snapshot of the scheduler's epoch for beacon emission
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct EpochView {
    pub epoch_us: TimeUs,
    pub cycle_period_ms: u16,
    pub motor_active_duty_pct: u8,
    pub mode_id: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handshake {
    Idle,
    AwaitingResponse {
        t1: TimeUs,
        deadline: TimeUs,
        attempt: u8,
    },
    Done,
    /// All attempts failed; running on offset 0 until the first beacon
    Failed,
}

/// Why a handshake exchange did not bootstrap the filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HandshakeError {
    /// Reply does not match an outstanding request; duplicate or stale
    UnexpectedReply,
    /// Round trip above the 500 ms bound; the attempt is retried
    RttTooHigh { rtt_us: u64 },
    /// All attempts spent; running on the fallback offset
    Exhausted,
}

/// Time-sync protocol state, one instance per device
///
/// Owns the offset filter. The server half emits beacons and digests
/// paired-timestamp reports; the client half runs the handshake and feeds
/// beacon samples to the filter. Which half is live follows the device
/// role.
#[derive(Debug)]
pub struct TimeSync {
    pub(crate) filter: OffsetFilter,
    handshake: Handshake,

    // server half
    beacon_seq: u8,
    next_beacon_at: Option<TimeUs>,
    burst_remaining: u8,
    /// One-way-delay compensation added to beacon timestamps, learned from
    /// report round trips
    delay_comp_us: i64,
    /// Smoothed spread of the report one-way estimates; the server's
    /// jitter measure for the quality score
    report_jitter_us: i64,
    buffered_request: Option<(TimeUs, TimeUs)>,
    consecutive_reports: u32,
    last_report_rx_us: TimeUs,
    expected_report_gap_us: u64,
    /// Most recent bias-corrected offset sample, for diagnostics
    last_report_offset_us: i64,

    // client half
    beacons_processed: u32,
    consecutive_beacons: u32,
    last_beacon: Option<(Beacon, TimeUs)>,
    last_beacon_gap_us: u64,
    was_locked: bool,
    lock_wait_started: Option<TimeUs>,
}

impl TimeSync {
    pub(crate) fn new() -> Self {
        TimeSync {
            filter: OffsetFilter::new(),
            handshake: Handshake::Idle,
            beacon_seq: 0,
            next_beacon_at: None,
            burst_remaining: 0,
            delay_comp_us: 0,
            report_jitter_us: 0,
            buffered_request: None,
            consecutive_reports: 0,
            last_report_rx_us: 0,
            expected_report_gap_us: REPORT_CYCLE_INTERVAL as u64 * 1_000_000,
            last_report_offset_us: 0,
            beacons_processed: 0,
            consecutive_beacons: 0,
            last_beacon: None,
            last_beacon_gap_us: BEACON_INTERVALS_S[0] * 1_000_000,
            was_locked: false,
            lock_wait_started: None,
        }
    }

    /// Synchronized time. Identity for the epoch owner, whose filter never
    /// accumulates an offset.
    pub fn now_sync(&self, now_local: TimeUs) -> TimeUs {
        self.filter.sync_time(now_local)
    }

    pub(crate) fn local_from_sync(&self, sync: TimeUs) -> TimeUs {
        self.filter.local_time(sync)
    }

    // --- handshake (client) ---

    pub(crate) fn start_handshake(&mut self, now: TimeUs, fx: &mut TandemEffects) {
        self.handshake = Handshake::AwaitingResponse {
            t1: now,
            deadline: now + HANDSHAKE_TIMEOUT_US,
            attempt: 1,
        };
        let _ = fx.push(Effect::Transmit(Message::TimeRequest { t1: now }));
    }

    pub(crate) fn handshake_done(&self) -> bool {
        matches!(self.handshake, Handshake::Done | Handshake::Failed)
    }

    /// Handshake reply from the server; `now` is t4
    ///
    /// Bootstraps the filter on success. A rejected round trip retries by
    /// itself; the error only reports why this reply was not used.
    pub(crate) fn on_time_response(
        &mut self,
        now: TimeUs,
        t1: TimeUs,
        t2: TimeUs,
        t3: TimeUs,
        fx: &mut TandemEffects,
    ) -> Result<(), HandshakeError> {
        let (sent_t1, attempt) = match self.handshake {
            Handshake::AwaitingResponse { t1, attempt, .. } => (t1, attempt),
            _ => return Err(HandshakeError::UnexpectedReply),
        };
        if sent_t1 != t1 {
            return Err(HandshakeError::UnexpectedReply);
        }
        let t4 = now;
        let rtt = (t4 - t1).saturating_sub(t3.saturating_sub(t2));
        if rtt > HANDSHAKE_MAX_RTT_US {
            return Err(match self.retry_handshake(now, attempt, fx) {
                Some(exhausted) => exhausted,
                None => HandshakeError::RttTooHigh { rtt_us: rtt },
            });
        }
        let raw_offset = ((t2 as i64 - t1 as i64) + (t3 as i64 - t4 as i64)) / 2;
        self.filter.bootstrap(raw_offset);
        self.handshake = Handshake::Done;
        self.lock_wait_started = Some(now);
        debug!("handshake done, offset {} us, rtt {} us", raw_offset, rtt);
        Ok(())
    }

    #[must_use]
    fn retry_handshake(
        &mut self,
        now: TimeUs,
        attempt: u8,
        fx: &mut TandemEffects,
    ) -> Option<HandshakeError> {
        if attempt >= HANDSHAKE_MAX_ATTEMPTS {
            warn!("handshake failed, falling back to first beacon");
            self.handshake = Handshake::Failed;
            self.lock_wait_started = Some(now);
            Some(HandshakeError::Exhausted)
        } else {
            self.handshake = Handshake::AwaitingResponse {
                t1: now,
                deadline: now + HANDSHAKE_TIMEOUT_US,
                attempt: attempt + 1,
            };
            let _ = fx.push(Effect::Transmit(Message::TimeRequest { t1: now }));
            None
        }
    }

    // --- beacons ---

    /// Handshake request from the client
    ///
    /// Answered immediately when this device already knows it is the
    /// server; buffered otherwise and flushed from `poll` once the role
    /// is in.
    pub(crate) fn on_time_request(
        &mut self,
        now: TimeUs,
        t1: TimeUs,
        ready: bool,
        epoch: EpochView,
        fx: &mut TandemEffects,
    ) {
        if !ready {
            self.buffered_request = Some((t1, now));
            return;
        }
        self.answer_request(now, t1, now, epoch, fx);
    }

    fn answer_request(
        &mut self,
        now: TimeUs,
        t1: TimeUs,
        t2: TimeUs,
        epoch: EpochView,
        fx: &mut TandemEffects,
    ) {
        let _ = fx.push(Effect::Transmit(Message::TimeResponse { t1, t2, t3: now }));
        // bootstrap beacon: cuts the client's first-sample wait roughly in half
        self.emit_beacon(now, epoch, fx);
        self.force_burst(now);
    }

    /// Start a forced burst of closely spaced beacons
    ///
    /// Overlapping triggers stack (bounded), they do not cancel each other.
    pub(crate) fn force_burst(&mut self, now: TimeUs) {
        self.burst_remaining = (self.burst_remaining + FORCED_BURST_LEN).min(2 * FORCED_BURST_LEN);
        self.next_beacon_at = Some(now + FORCED_BURST_SPACING_US);
    }

    fn emit_beacon(&mut self, now: TimeUs, epoch: EpochView, fx: &mut TandemEffects) {
        self.beacon_seq = self.beacon_seq.wrapping_add(1);
        let server_time_us = self
            .now_sync(now)
            .saturating_add_signed(self.delay_comp_us);
        let _ = fx.push(Effect::Transmit(Message::Beacon(Beacon {
            sequence: self.beacon_seq,
            server_time_us,
            motor_epoch_us: epoch.epoch_us,
            cycle_period_ms: epoch.cycle_period_ms,
            motor_active_duty_pct: epoch.motor_active_duty_pct,
            mode_id: epoch.mode_id,
        })));
    }

    /// Beacon from the server; feeds the filter
    pub(crate) fn on_beacon(&mut self, now: TimeUs, beacon: &Beacon) -> FilterOutcome {
        if let Some((last, last_rx)) = &self.last_beacon {
            if beacon.sequence == last.sequence.wrapping_add(1) {
                self.consecutive_beacons += 1;
            } else {
                self.consecutive_beacons = 1;
            }
            self.last_beacon_gap_us = now.saturating_sub(*last_rx);
        } else {
            self.consecutive_beacons = 1;
        }
        self.beacons_processed += 1;
        self.last_beacon = Some((*beacon, now));

        let raw_offset = beacon.server_time_us as i64 - now as i64;
        self.filter.update(raw_offset, now)
    }

    /// Paired-timestamp report from the client; `now` is t4
    ///
    /// Closes the NTP formula over the beacon/report pair and refreshes the
    /// one-way-delay compensation applied to future beacon timestamps.
    pub(crate) fn on_activation_report(&mut self, now: TimeUs, t1: TimeUs, t2: TimeUs, t3: TimeUs) {
        let t4 = now;
        let rtt = (t4.saturating_sub(t1)).saturating_sub(t3.saturating_sub(t2)) as i64;
        if !(0..=HANDSHAKE_MAX_RTT_US as i64).contains(&rtt) {
            debug!("discarding report with rtt {} us", rtt);
            return;
        }
        let one_way = rtt / 2;
        // EMA, same steady-state weight the offset filter uses. The server's
        // own filter stays untouched so its sync domain remains its local
        // clock; the report only tunes the beacon timestamp compensation.
        let deviation = (one_way - self.delay_comp_us).abs();
        self.report_jitter_us += (deviation - self.report_jitter_us) * ALPHA_STEADY_PCT / 100;
        self.delay_comp_us += (one_way - self.delay_comp_us) * ALPHA_STEADY_PCT / 100;
        self.last_report_offset_us = ((t2 as i64 - t1 as i64) + (t3 as i64 - t4 as i64)) / 2;
        debug!(
            "report: client offset {} us, rtt {} us",
            self.last_report_offset_us, rtt
        );
        self.consecutive_reports += 1;
        if self.last_report_rx_us != 0 {
            self.expected_report_gap_us = now.saturating_sub(self.last_report_rx_us);
        }
        self.last_report_rx_us = now;
    }

    /// Periodic work: handshake retries and due beacons
    pub(crate) fn poll(
        &mut self,
        now: TimeUs,
        role: Role,
        ready: bool,
        epoch: EpochView,
        fx: &mut TandemEffects,
    ) {
        if let Handshake::AwaitingResponse {
            deadline, attempt, ..
        } = self.handshake
        {
            if now >= deadline {
                warn!("handshake attempt {} timed out", attempt);
                if let Some(err) = self.retry_handshake(now, attempt, fx) {
                    warn!("handshake: {:?}", err);
                }
            }
        }

        if role.is_server() {
            if ready {
                if let Some((t1, t2)) = self.buffered_request.take() {
                    self.answer_request(now, t1, t2, epoch, fx);
                }
            }
            match self.next_beacon_at {
                Some(due) if now >= due => {
                    self.emit_beacon(now, epoch, fx);
                    if self.burst_remaining > 0 {
                        self.burst_remaining -= 1;
                    }
                    self.next_beacon_at = Some(if self.burst_remaining > 0 {
                        now + FORCED_BURST_SPACING_US
                    } else {
                        now + self.beacon_interval_us(now)
                    });
                }
                Some(_) => {}
                None => {
                    // first periodic beacon one base interval after role assignment
                    self.next_beacon_at = Some(now + BEACON_INTERVALS_S[0] * 1_000_000);
                }
            }
        }
    }

    /// Earliest instant `poll` has pending work for
    pub(crate) fn next_deadline(&self, role: Role) -> Option<TimeUs> {
        let handshake = match self.handshake {
            Handshake::AwaitingResponse { deadline, .. } => Some(deadline),
            _ => None,
        };
        let beacon = if role.is_server() {
            self.next_beacon_at
        } else {
            None
        };
        match (handshake, beacon) {
            (Some(h), Some(b)) => Some(h.min(b)),
            (h, b) => h.or(b),
        }
    }

    // --- quality and lock ---

    /// Link quality, 0 to 100
    ///
    /// Consecutive deliveries weigh 50, sample spread 30, freshness 20. The
    /// server scores its report stream, the client its beacon stream.
    pub(crate) fn quality_score(&self, now: TimeUs, role: Role) -> u8 {
        let (consecutive, jitter_us, last_rx, expected_gap) = if role.is_server() {
            (
                self.consecutive_reports,
                self.report_jitter_us.unsigned_abs(),
                self.last_report_rx_us,
                self.expected_report_gap_us,
            )
        } else {
            (
                self.consecutive_beacons,
                self.filter.ring_jitter_us(),
                self.filter.last_beacon_rx_us(),
                self.current_interval_us(),
            )
        };
        let consecutive_score = consecutive.min(10) as u8 * 5;
        let jitter_ms = (jitter_us / 1000).min(30) as u8;
        let jitter_score = 30 - jitter_ms;
        let freshness_score = if last_rx == 0 {
            0
        } else {
            let age = now.saturating_sub(last_rx);
            if age <= expected_gap {
                20
            } else if age <= 2 * expected_gap {
                10
            } else {
                0
            }
        };
        consecutive_score + jitter_score + freshness_score
    }

    /// Beacon interval chosen by the server's quality score
    ///
    /// The two widest intervals demand a report stream with at most a
    /// millisecond of spread; with normal radio jitter the EMA cannot
    /// track crystal drift through minute-long beacon gaps.
    fn beacon_interval_us(&self, now: TimeUs) -> u64 {
        let score = self.quality_score(now, Role::Server);
        let seconds = match score {
            0..=39 => BEACON_INTERVALS_S[0],
            40..=54 => BEACON_INTERVALS_S[1],
            55..=69 => BEACON_INTERVALS_S[2],
            70..=98 => BEACON_INTERVALS_S[3],
            99 => BEACON_INTERVALS_S[4],
            _ => BEACON_INTERVALS_S[5],
        };
        seconds * 1_000_000
    }

    /// The client's view of the current beacon interval: the last observed
    /// gap, clamped to the selectable range.
    fn current_interval_us(&self) -> u64 {
        self.last_beacon_gap_us.clamp(
            BEACON_INTERVALS_S[0] * 1_000_000,
            BEACON_INTERVALS_S[BEACON_INTERVALS_S.len() - 1] * 1_000_000,
        )
    }

    /// Whether the filter is trustworthy enough to start motors in antiphase
    pub(crate) fn locked(&self, now: TimeUs) -> bool {
        self.filter.bootstrapped()
            && self.beacons_processed >= LOCK_MIN_BEACONS
            && self.filter.steady_state()
            && now.saturating_sub(self.filter.last_beacon_rx_us()) <= 2 * self.current_interval_us()
    }

    /// Lock transition check; true exactly once per loss
    pub(crate) fn lock_lost(&mut self, now: TimeUs) -> bool {
        let locked = self.locked(now);
        let lost = self.was_locked && !locked;
        self.was_locked = locked;
        lost
    }

    /// Whether the client's bounded wait for lock before the first motor
    /// start is over
    pub(crate) fn lock_wait_expired(&self, now: TimeUs) -> bool {
        match self.lock_wait_started {
            Some(start) => now.saturating_sub(start) >= LOCK_WAIT_LIMIT_US,
            None => false,
        }
    }

    pub(crate) fn last_beacon(&self) -> Option<&(Beacon, TimeUs)> {
        self.last_beacon.as_ref()
    }

    /// Build a paired-timestamp report from the most recent beacon
    pub(crate) fn make_report(
        &self,
        now: TimeUs,
        cycle_index: u32,
        phase_error_ms: i16,
    ) -> Option<Message> {
        let (beacon, rx_local) = self.last_beacon.as_ref()?;
        Some(Message::ActivationReport {
            cycle_index,
            phase_error_ms,
            t1: beacon.server_time_us,
            t2: *rx_local,
            t3: now,
        })
    }

    /// Reset for a role swap on reconnect; keeps the offset, narrows the
    /// outlier threshold
    pub(crate) fn on_role_swap(&mut self) {
        warn!("role swapped on reconnect, filter back to fast attack");
        self.filter.reset_fast_attack();
        self.handshake = Handshake::Idle;
        self.beacons_processed = 0;
        self.consecutive_beacons = 0;
        self.consecutive_reports = 0;
        self.was_locked = false;
        self.next_beacon_at = None;
    }
}
