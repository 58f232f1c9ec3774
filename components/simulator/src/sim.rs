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

use std::cmp::Reverse;
use std::collections::BinaryHeap;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use rand::RngCore;
use rand_chacha::ChaCha8Rng;

use coordination_api::{Action, Coordinator, Effect, Input, Service};
use tandem::{Mac, Message, StoredSettings, Tandem, SETTINGS_BLOB_MAX};

pub type SimInput = Input<Mac, Message, StoredSettings>;

/// How long a scan takes to see an advertiser
pub const DISCOVERY_LATENCY_US: u64 = 40_000;
/// Connection establishment latency
pub const CONNECT_LATENCY_US: u64 = 60_000;

/// Free-running device clock with a constant drift against simulation time
#[derive(Debug, Clone, Copy)]
pub struct SimClock {
    pub drift_ppm: i64,
    pub boot_sim_us: u64,
}

impl SimClock {
    /// Device-local microseconds at a simulation instant
    pub fn local(&self, sim_us: u64) -> u64 {
        let elapsed = sim_us.saturating_sub(self.boot_sim_us) as i128;
        (elapsed + elapsed * self.drift_ppm as i128 / 1_000_000) as u64
    }

    /// Simulation instant at which the local clock reads `local_us`
    ///
    /// Rounded up so a wake-up never lands before its local target.
    pub fn sim_for_local(&self, local_us: u64) -> u64 {
        let num = local_us as i128 * 1_000_000;
        let den = 1_000_000 + self.drift_ppm as i128;
        let elapsed = (num + den - 1) / den;
        self.boot_sim_us + elapsed as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorCmd {
    Forward,
    Reverse,
    Coast,
}

/// Ground-truth motor timeline in simulation time
#[derive(Debug, Default)]
pub struct MotorRecorder {
    pub events: Vec<(u64, MotorCmd)>,
}

impl MotorRecorder {
    fn record(&mut self, sim_us: u64, cmd: MotorCmd) {
        self.events.push((sim_us, cmd));
    }

    /// Instants at which a PWM drive began
    pub fn drive_starts(&self) -> Vec<u64> {
        self.events
            .iter()
            .filter(|(_, c)| matches!(c, MotorCmd::Forward | MotorCmd::Reverse))
            .map(|(t, _)| *t)
            .collect()
    }

    /// Closed drive intervals `[start, coast)`
    pub fn drive_intervals(&self, end_cap: u64) -> Vec<(u64, u64)> {
        let mut intervals = Vec::new();
        let mut open: Option<u64> = None;
        for (t, cmd) in &self.events {
            match cmd {
                MotorCmd::Forward | MotorCmd::Reverse => {
                    // back-to-back drives extend the open interval
                    if open.is_none() {
                        open = Some(*t);
                    }
                }
                MotorCmd::Coast => {
                    if let Some(start) = open.take() {
                        intervals.push((start, *t));
                    }
                }
            }
        }
        if let Some(start) = open {
            intervals.push((start, end_cap));
        }
        intervals
    }
}

/// Total overlap between two sets of drive intervals
pub fn total_overlap_us(a: &[(u64, u64)], b: &[(u64, u64)]) -> u64 {
    let mut overlap = 0;
    for (a0, a1) in a {
        for (b0, b1) in b {
            let lo = a0.max(b0);
            let hi = a1.min(b1);
            overlap += hi.saturating_sub(*lo);
        }
    }
    overlap
}

/// Antiphase error of every client ACTIVE start against the preceding
/// server ACTIVE start: `|t_c - t_s - half_period|`
pub fn antiphase_errors_us(
    server_starts: &[u64],
    client_starts: &[u64],
    half_period_us: u64,
) -> Vec<u64> {
    client_starts
        .iter()
        .filter_map(|t_c| {
            let t_s = server_starts.iter().filter(|t_s| **t_s <= *t_c).max()?;
            Some((*t_c as i64 - *t_s as i64 - half_period_us as i64).unsigned_abs())
        })
        .collect()
}

/// Lossy, latency-jittered datagram link between the two devices
#[derive(Debug)]
pub struct LinkModel {
    pub latency_min_us: u64,
    pub latency_max_us: u64,
    /// Packet loss probability in parts per thousand
    pub loss_ppt: u32,
    /// Sim-time windows in which every packet is lost
    pub outages: Vec<(u64, u64)>,
    pub connected: bool,
}

impl Default for LinkModel {
    fn default() -> Self {
        LinkModel {
            latency_min_us: 10_000,
            latency_max_us: 30_000,
            loss_ppt: 0,
            outages: Vec::new(),
            connected: false,
        }
    }
}

impl LinkModel {
    fn latency(&self, rng: &mut impl RngCore) -> u64 {
        let spread = self.latency_max_us - self.latency_min_us;
        if spread == 0 {
            self.latency_min_us
        } else {
            self.latency_min_us + rng.next_u64() % spread
        }
    }

    fn drops(&self, sim_us: u64, rng: &mut impl RngCore) -> bool {
        if self.outages.iter().any(|(a, b)| (*a..*b).contains(&sim_us)) {
            return true;
        }
        self.loss_ppt > 0 && rng.next_u32() % 1000 < self.loss_ppt
    }
}

/// Per-device configuration for a run
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub mac: Mac,
    pub battery_pct: u8,
    pub boot_at_us: u64,
    pub drift_ppm: i64,
    pub stored: Option<StoredSettings>,
}

/// A simulated device: the coordination core plus its radio-visible state
pub struct DeviceSim {
    pub dev: Tandem,
    pub clock: SimClock,
    pub mac: Mac,
    pub advertising: Option<(Service, u8)>,
    pub scanning: bool,
    pub alive: bool,
    pub motor: MotorRecorder,
    pub store: Option<Vec<u8>>,
    pub back_emf_samples: u32,
}

impl DeviceSim {
    fn new(config: &DeviceConfig) -> Self {
        DeviceSim {
            dev: Tandem::new(config.mac, config.battery_pct, config.stored.clone()),
            clock: SimClock {
                drift_ppm: config.drift_ppm,
                boot_sim_us: config.boot_at_us,
            },
            mac: config.mac,
            advertising: None,
            scanning: false,
            alive: true,
            motor: MotorRecorder::default(),
            store: None,
            back_emf_samples: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Event {
    sim_us: u64,
    seq: u64,
    device: usize,
    input: Option<SimInput>,
}

impl Eq for Event {}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.sim_us, self.seq).cmp(&(other.sim_us, other.seq))
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub struct Stats {
    pub beacons_sent: u64,
    pub beacons_delivered: u64,
    pub packets_dropped: u64,
    pub decode_errors: u64,
    /// Longest single wait a device requested; the watchdog bound
    pub max_wait_us: u64,
}

/// Discrete-event simulation of a two-device session
pub struct Sim {
    pub devices: Vec<DeviceSim>,
    pub link: LinkModel,
    pub stats: Stats,
    pub now_sim: u64,
    queue: BinaryHeap<Reverse<Event>>,
    seq: u64,
    rng: ChaCha8Rng,
    /// discovered[scanner][advertiser]
    discovered: [[bool; 2]; 2],
}

impl Sim {
    pub fn new(rng: ChaCha8Rng, configs: [DeviceConfig; 2], link: LinkModel) -> Self {
        let mut sim = Sim {
            devices: configs.iter().map(DeviceSim::new).collect(),
            link,
            stats: Stats::default(),
            now_sim: 0,
            queue: BinaryHeap::new(),
            seq: 0,
            rng,
            discovered: [[false; 2]; 2],
        };
        for (idx, config) in configs.iter().enumerate() {
            sim.push_event(config.boot_at_us, idx, None);
        }
        sim
    }

    pub fn device_by_mac(&self, mac: &Mac) -> Option<usize> {
        self.devices.iter().position(|d| d.mac == *mac)
    }

    /// Inject a scenario input (button press, battery update, app write)
    pub fn schedule_input(&mut self, sim_us: u64, device: usize, input: SimInput) {
        self.push_event(sim_us, device, Some(input));
    }

    fn push_event(&mut self, sim_us: u64, device: usize, input: Option<SimInput>) {
        self.seq += 1;
        self.queue.push(Reverse(Event {
            sim_us,
            seq: self.seq,
            device,
            input,
        }));
    }

    /// Run the event loop up to (and including) `sim_end`
    pub fn run_until(&mut self, sim_end: u64) {
        while let Some(Reverse(peeked)) = self.queue.peek() {
            if peeked.sim_us > sim_end {
                break;
            }
            let Reverse(event) = self.queue.pop().expect("peeked event vanished");
            assert!(event.sim_us >= self.now_sim, "bug: time cannot go backwards");
            self.now_sim = event.sim_us;

            if !self.devices[event.device].alive {
                continue;
            }

            // a delivered disconnect also takes the link down
            if matches!(event.input, Some(Input::Disconnected { .. })) {
                self.link.connected = false;
            }

            let now_local = self.devices[event.device].clock.local(event.sim_us);
            let (action, effects) = self.devices[event.device].dev.progress(now_local, event.input);

            for effect in effects {
                self.apply_effect(event.device, effect);
            }
            self.check_discovery();

            match action {
                Action::Wait { end } => {
                    self.stats.max_wait_us =
                        self.stats.max_wait_us.max(end.saturating_sub(now_local));
                    let wake = self.devices[event.device].clock.sim_for_local(end);
                    self.push_event(wake.max(event.sim_us), event.device, None);
                }
                Action::None => self.push_event(event.sim_us, event.device, None),
                Action::Sleep => {
                    info!("device {} entered deep sleep", event.device);
                    self.devices[event.device].alive = false;
                }
            }
        }
        self.now_sim = self.now_sim.max(sim_end);
    }

    fn apply_effect(&mut self, idx: usize, effect: Effect<Mac, Message, StoredSettings>) {
        match effect {
            Effect::Transmit(msg) => self.transmit(idx, msg),
            Effect::MotorForward { .. } => {
                self.devices[idx].motor.record(self.now_sim, MotorCmd::Forward)
            }
            Effect::MotorReverse { .. } => {
                self.devices[idx].motor.record(self.now_sim, MotorCmd::Reverse)
            }
            Effect::MotorCoast => self.devices[idx].motor.record(self.now_sim, MotorCmd::Coast),
            Effect::SetTxPowerMax
            | Effect::LedColor { .. }
            | Effect::LedBlink { .. }
            | Effect::LedClear => {}
            Effect::Advertise {
                service,
                battery_pct,
            } => {
                self.devices[idx].advertising = Some((service, battery_pct));
                // fresh advertising data may be discovered again
                for scanner in 0..self.devices.len() {
                    self.discovered[scanner][idx] = false;
                }
            }
            Effect::StopAdvertising => self.devices[idx].advertising = None,
            Effect::StartScan { .. } => self.devices[idx].scanning = true,
            Effect::StopScan => self.devices[idx].scanning = false,
            Effect::ConnectTo { peer } => self.connect(idx, peer),
            Effect::Disconnect => {
                if self.link.connected {
                    self.link.connected = false;
                    let other = 1 - idx;
                    let at = self.now_sim + CONNECT_LATENCY_US;
                    self.push_event(at, other, Some(Input::Disconnected { reason: 0 }));
                }
            }
            Effect::SampleBackEmf => self.devices[idx].back_emf_samples += 1,
            Effect::Persist(settings) => {
                // exercise the blob codec the way the store collaborator would
                let mut buf = [0u8; SETTINGS_BLOB_MAX];
                match settings.encode(&mut buf) {
                    Ok(len) => self.devices[idx].store = Some(buf[..len].to_vec()),
                    Err(err) => error!("settings blob encode failed: {}", err),
                }
            }
        }
    }

    fn transmit(&mut self, idx: usize, msg: Message) {
        let is_beacon = matches!(msg, Message::Beacon(_));
        if is_beacon {
            self.stats.beacons_sent += 1;
        }
        if !self.link.connected {
            trace!("transmit while not connected, dropped");
            return;
        }
        let frame = msg.encode();
        if self.link.drops(self.now_sim, &mut self.rng) {
            self.stats.packets_dropped += 1;
            return;
        }
        let latency = self.link.latency(&mut self.rng);
        match Message::decode(&frame) {
            Ok(decoded) => {
                if is_beacon {
                    self.stats.beacons_delivered += 1;
                }
                let peer = 1 - idx;
                self.push_event(self.now_sim + latency, peer, Some(Input::Packet(decoded)));
            }
            Err(err) => {
                error!("frame failed to decode: {:?}", err);
                self.stats.decode_errors += 1;
            }
        }
    }

    fn connect(&mut self, idx: usize, peer: Mac) {
        let Some(target) = self.device_by_mac(&peer) else {
            self.push_event(self.now_sim, idx, Some(Input::ConnectFailed));
            return;
        };
        let reachable = self.devices[target].alive && self.devices[target].advertising.is_some();
        if !reachable || self.link.connected {
            self.push_event(
                self.now_sim + CONNECT_LATENCY_US,
                idx,
                Some(Input::ConnectFailed),
            );
            return;
        }
        self.link.connected = true;
        let at = self.now_sim + CONNECT_LATENCY_US;
        let own_mac = self.devices[idx].mac;
        self.push_event(at, idx, Some(Input::Connected { peer }));
        self.push_event(at, target, Some(Input::Connected { peer: own_mac }));
    }

    /// Scanners see bilateral advertisers after the discovery latency
    fn check_discovery(&mut self) {
        if self.link.connected {
            return;
        }
        for scanner in 0..self.devices.len() {
            for advertiser in 0..self.devices.len() {
                if scanner == advertiser || self.discovered[scanner][advertiser] {
                    continue;
                }
                if !self.devices[scanner].scanning || !self.devices[advertiser].alive {
                    continue;
                }
                let Some((Service::Bilateral, battery_pct)) = self.devices[advertiser].advertising
                else {
                    continue;
                };
                self.discovered[scanner][advertiser] = true;
                let peer = self.devices[advertiser].mac;
                self.push_event(
                    self.now_sim + DISCOVERY_LATENCY_US,
                    scanner,
                    Some(Input::Discovered { peer, battery_pct }),
                );
            }
        }
    }
}

