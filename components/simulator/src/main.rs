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

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::env;

use tandem::{Mac, Role};

mod logger;
mod sim;

use crate::sim::*;

const EVENT_FILE_PATH: &str = "/tmp/tandem_events.csv";

const MAC_A: Mac = [0xc4, 0x4f, 0x33, 0x10, 0x00, 0x01];
const MAC_B: Mac = [0xc4, 0x4f, 0x33, 0x10, 0x00, 0x02];

const US_PER_S: u64 = 1_000_000;

fn main() {
    let args: Vec<String> = env::args().collect();

    let mut rng_seed: u64 = 0;
    let mut simulation_minutes: u64 = 10;
    let mut loss_ppt: u32 = 20;
    let mut drift_ppm: i64 = 10;
    let mut battery_a: u8 = 97;
    let mut battery_b: u8 = 96;

    for chunk in args[1..].chunks_exact(2) {
        let (arg, val) = (&chunk[0], &chunk[1]);
        match arg.as_str() {
            "--seed" => {
                rng_seed = val.parse().expect("invalid rng seed");
            }
            "--time_min" => {
                simulation_minutes = val.parse().expect("invalid number of simulation minutes");
            }
            "--loss_ppt" => {
                loss_ppt = val.parse().expect("invalid packet loss");
            }
            "--drift_ppm" => {
                drift_ppm = val.parse().expect("invalid drift");
            }
            "--battery_a" => {
                battery_a = val.parse().expect("invalid battery percentage");
            }
            "--battery_b" => {
                battery_b = val.parse().expect("invalid battery percentage");
            }
            _ => panic!("unknown argument: {}", arg),
        }
    }

    logger::init(log::Level::Info, Some(EVENT_FILE_PATH)).unwrap();

    let mut sim = make_pair(
        rng_seed,
        (battery_a, battery_b),
        (0, 500_000),
        (drift_ppm, -drift_ppm),
        loss_ppt,
    );
    sim.run_until(simulation_minutes * 60 * US_PER_S);
    log::logger().flush();

    print_summary(&sim);
}

fn get_rng(rng_seed: u64) -> ChaCha8Rng {
    println!("RNG seed: {rng_seed:#x}");
    ChaCha8Rng::seed_from_u64(rng_seed)
}

fn make_pair(
    seed: u64,
    batteries: (u8, u8),
    boots: (u64, u64),
    drifts: (i64, i64),
    loss_ppt: u32,
) -> Sim {
    let link = LinkModel {
        loss_ppt,
        ..LinkModel::default()
    };
    Sim::new(
        get_rng(seed),
        [
            DeviceConfig {
                mac: MAC_A,
                battery_pct: batteries.0,
                boot_at_us: boots.0,
                drift_ppm: drifts.0,
                stored: None,
            },
            DeviceConfig {
                mac: MAC_B,
                battery_pct: batteries.1,
                boot_at_us: boots.1,
                drift_ppm: drifts.1,
                stored: None,
            },
        ],
        link,
    )
}

fn server_index(sim: &Sim) -> Option<usize> {
    sim.devices.iter().position(|d| d.dev.role() == Role::Server)
}

fn print_summary(sim: &Sim) {
    for (idx, device) in sim.devices.iter().enumerate() {
        println!(
            "device {}: role {:?}, mode {:?}, {} activations, offset {} us",
            idx,
            device.dev.role(),
            device.dev.mode().0,
            device.motor.drive_starts().len(),
            device.dev.filtered_offset_us(),
        );
    }
    println!(
        "beacons {}/{} delivered, {} dropped, {} decode errors, longest wait {} us",
        sim.stats.beacons_delivered,
        sim.stats.beacons_sent,
        sim.stats.packets_dropped,
        sim.stats.decode_errors,
        sim.stats.max_wait_us,
    );

    if let Some(server) = server_index(sim) {
        let client = 1 - server;
        let half = sim.devices[server].dev.mode().1.half_period_us();
        let errors = antiphase_errors_us(
            &sim.devices[server].motor.drive_starts(),
            &sim.devices[client].motor.drive_starts(),
            half,
        );
        if !errors.is_empty() {
            let within_50 = errors.iter().filter(|e| **e <= 50_000).count();
            let within_10 = errors.iter().filter(|e| **e <= 10_000).count();
            println!(
                "antiphase: {} cycles, {:.1}% within 50 ms, {:.1}% within 10 ms",
                errors.len(),
                100.0 * within_50 as f64 / errors.len() as f64,
                100.0 * within_10 as f64 / errors.len() as f64,
            );
        }
        let cap = sim.now_sim;
        let overlap = total_overlap_us(
            &sim.devices[server].motor.drive_intervals(cap),
            &sim.devices[client].motor.drive_intervals(cap),
        );
        println!("cumulative drive overlap: {} us", overlap);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coordination_api::Input;
    use tandem::{ModeId, StoredSettings};

    fn local_now(sim: &Sim, idx: usize) -> u64 {
        sim.devices[idx].clock.local(sim.now_sim)
    }

    /// A settings write that only switches the mode
    fn mode_write(base: &StoredSettings, mode: ModeId) -> SimInput {
        let mut settings = base.clone();
        settings.current_mode = mode;
        Input::SettingsWrite(settings)
    }

    /// The owner's epoch start translated into simulation time
    fn epoch_in_sim_time(sim: &Sim, owner: usize) -> (u64, u64) {
        let (epoch_us, period_ms) = sim.devices[owner].dev.epoch().unwrap();
        (
            sim.devices[owner].clock.sim_for_local(epoch_us),
            period_ms as u64 * 1000,
        )
    }

    #[test]
    fn s1_cold_pairing() {
        let mut sim = make_pair(1, (97, 96), (0, 500_000), (10, -10), 0);
        sim.run_until(6 * US_PER_S);

        // within seconds of power-on: connected, deterministic roles, lock
        assert!(sim.link.connected);
        assert_eq!(sim.devices[0].dev.role(), Role::Server);
        assert_eq!(sim.devices[1].dev.role(), Role::Client);
        assert!(sim.devices[1].dev.locked(local_now(&sim, 1)));

        sim.run_until(20 * US_PER_S);
        assert_eq!(sim.stats.decode_errors, 0);

        // the client's first ACTIVE sits half a period after a cycle start
        let (epoch_sim, period) = epoch_in_sim_time(&sim, 0);
        let client_starts = sim.devices[1].motor.drive_starts();
        let first = *client_starts.first().expect("client never drove");
        let phase = (first - epoch_sim) % period;
        let error = phase.abs_diff(period / 2);
        assert!(error <= 50_000, "first client ACTIVE off by {} us", error);

        // drive windows never overlap
        let cap = sim.now_sim;
        let overlap = total_overlap_us(
            &sim.devices[0].motor.drive_intervals(cap),
            &sim.devices[1].motor.drive_intervals(cap),
        );
        assert_eq!(overlap, 0);

        // every wait stays inside the watchdog chunk
        assert!(sim.stats.max_wait_us <= 110_000);

        // the research capture sampled back EMF during the first seconds
        assert!(sim.devices[0].back_emf_samples > 0);
    }

    #[test]
    fn s2_mode_change_one_hz_to_half_hz() {
        let mut sim = make_pair(2, (97, 96), (0, 500_000), (10, -10), 0);
        sim.run_until(15 * US_PER_S);
        assert_eq!(sim.devices[0].dev.mode().0, ModeId::M1);

        // settings write on the SERVER switches to the 0.5 Hz preset
        let press_at = 15 * US_PER_S;
        let base = sim.devices[0].dev.settings().clone();
        sim.schedule_input(press_at, 0, mode_write(&base, ModeId::M0));
        sim.run_until(30 * US_PER_S);

        assert_eq!(sim.devices[0].dev.mode().0, ModeId::M0);
        assert_eq!(sim.devices[1].dev.mode().0, ModeId::M0);
        let (commit_sim, period) = epoch_in_sim_time(&sim, 0);
        assert_eq!(period, 2_000_000);
        assert!(commit_sim >= press_at + 500_000);

        // both devices pause between the trigger and the commit boundary
        for device in &sim.devices {
            let paused = device
                .motor
                .drive_starts()
                .iter()
                .all(|t| *t < press_at + 300_000 || *t >= commit_sim - 50_000);
            assert!(paused, "device drove during the pause window");
        }

        // synchronized resume: server at the boundary, client half a (new)
        // period later
        let server_resume = sim.devices[0]
            .motor
            .drive_starts()
            .into_iter()
            .find(|t| *t >= commit_sim - 50_000)
            .unwrap();
        assert!(server_resume.abs_diff(commit_sim) <= 50_000);
        let client_resume = sim.devices[1]
            .motor
            .drive_starts()
            .into_iter()
            .find(|t| *t >= commit_sim)
            .unwrap();
        assert!(client_resume.abs_diff(commit_sim + 1_000_000) <= 50_000);

        // the change reached the persistent store on both sides
        for device in &sim.devices {
            let blob = device.store.as_ref().expect("nothing persisted");
            let stored = StoredSettings::decode(blob).unwrap();
            assert_eq!(stored.current_mode, ModeId::M0);
        }
    }

    #[test]
    fn s3_radio_dropout_is_ridden_out() {
        let mut sim = make_pair(3, (97, 96), (0, 500_000), (10, -10), 0);
        sim.link.outages.push((20 * US_PER_S, 30 * US_PER_S));
        sim.run_until(45 * US_PER_S);

        // same roles, lock recovered after the outage
        assert_eq!(sim.devices[0].dev.role(), Role::Server);
        assert_eq!(sim.devices[1].dev.role(), Role::Client);
        assert!(sim.devices[1].dev.locked(local_now(&sim, 1)));

        // the client kept its cadence through the outage: no missed cycles
        let starts = sim.devices[1].motor.drive_starts();
        let during: Vec<u64> = starts
            .iter()
            .copied()
            .filter(|t| (20 * US_PER_S..30 * US_PER_S).contains(t))
            .collect();
        assert!(during.len() >= 9, "only {} cycles in outage", during.len());
        for pair in during.windows(2) {
            let gap = pair[1] - pair[0];
            assert!((940_000..=1_060_000).contains(&gap), "gap {} us", gap);
        }
    }

    #[test]
    fn s4_ninety_minute_session_stays_tight() {
        let mut sim = make_pair(4, (97, 96), (0, 500_000), (10, -10), 20);
        sim.run_until(600 * US_PER_S);

        // sample the client's tracking error every 10 s after warm-up; the
        // ground truth is the actual gap between the two drifting clocks
        let mut errors_abs = Vec::new();
        let mut t = 600 * US_PER_S;
        while t < 5400 * US_PER_S {
            t += 10 * US_PER_S;
            sim.run_until(t);
            let true_offset = sim.devices[0].clock.local(sim.now_sim) as i64
                - sim.devices[1].clock.local(sim.now_sim) as i64;
            let error = sim.devices[1].dev.filtered_offset_us() - true_offset;
            errors_abs.push(error.unsigned_abs() as f64);
        }

        // beacon delivery with 2 % loss stays well above 95 %
        let delivered = sim.stats.beacons_delivered as f64 / sim.stats.beacons_sent as f64;
        assert!(delivered >= 0.95, "beacon delivery {:.3}", delivered);

        // steady-state sync error stays in the low milliseconds
        let mean_error = errors_abs.iter().sum::<f64>() / errors_abs.len() as f64;
        assert!(mean_error <= 5_000.0, "mean sync error {:.0} us", mean_error);

        // antiphase quality over the session
        let half = sim.devices[0].dev.mode().1.half_period_us();
        let errors = antiphase_errors_us(
            &sim.devices[0].motor.drive_starts(),
            &sim.devices[1].motor.drive_starts(),
            half,
        );
        assert!(errors.len() > 5000);
        let within_50 = errors.iter().filter(|e| **e <= 50_000).count() as f64;
        let within_10 = errors.iter().filter(|e| **e <= 10_000).count() as f64;
        assert!(within_50 / errors.len() as f64 >= 0.75);
        assert!(within_10 / errors.len() as f64 >= 0.18);

        // cumulative overlap under a second across 90 minutes
        let cap = sim.now_sim;
        let overlap = total_overlap_us(
            &sim.devices[0].motor.drive_intervals(cap),
            &sim.devices[1].motor.drive_intervals(cap),
        );
        assert!(overlap <= 1_000_000, "overlap {} us", overlap);
    }

    #[test]
    fn s5_simultaneous_presses_execute_one_change() {
        let mut sim = make_pair(5, (97, 96), (0, 500_000), (10, -10), 0);
        sim.run_until(15 * US_PER_S);
        assert_eq!(sim.devices[0].dev.mode().0, ModeId::M1);

        // client presses first; its request races the server's own press
        sim.schedule_input(15 * US_PER_S + 10_000, 1, Input::ButtonShort);
        sim.schedule_input(15 * US_PER_S + 60_000, 0, Input::ButtonShort);
        sim.run_until(25 * US_PER_S);

        // exactly one step forward, identically on both devices
        assert_eq!(sim.devices[0].dev.mode().0, ModeId::M2);
        assert_eq!(sim.devices[1].dev.mode().0, ModeId::M2);
    }

    #[test]
    fn s6_late_peer_runs_standalone() {
        let mut sim = make_pair(6, (97, 96), (0, 35 * US_PER_S), (10, -10), 0);
        sim.run_until(80 * US_PER_S);

        assert!(!sim.link.connected);
        assert_eq!(sim.devices[0].dev.role(), Role::Standalone);
        assert_eq!(sim.devices[1].dev.role(), Role::Standalone);
        // both stimulate on their own cadence
        assert!(!sim.devices[0].motor.drive_starts().is_empty());
        assert!(!sim.devices[1].motor.drive_starts().is_empty());
    }

    #[test]
    fn quarter_hertz_waits_stay_chunked() {
        let mut custom = StoredSettings::default();
        custom.current_mode = ModeId::Custom;
        custom.custom_freq_centihz = 25;
        custom.custom_duty_pct = 30;

        let link = LinkModel::default();
        let mut sim = Sim::new(
            get_rng(7),
            [
                DeviceConfig {
                    mac: MAC_A,
                    battery_pct: 90,
                    boot_at_us: 0,
                    drift_ppm: 10,
                    stored: Some(custom.clone()),
                },
                DeviceConfig {
                    mac: MAC_B,
                    battery_pct: 80,
                    boot_at_us: 300_000,
                    drift_ppm: -10,
                    stored: Some(custom),
                },
            ],
            link,
        );
        sim.run_until(90 * US_PER_S);

        // 4 s cycle, one ACTIVE per device per cycle
        let starts = sim.devices[0].motor.drive_starts();
        assert!(starts.len() >= 10);
        for pair in starts.windows(2) {
            let gap = pair[1] - pair[0];
            assert!((3_900_000..=4_100_000).contains(&gap), "gap {} us", gap);
        }
        // 4-second half-cycles never produce a wait beyond the watchdog chunk
        assert!(sim.stats.max_wait_us <= 110_000);
        assert_eq!(sim.stats.decode_errors, 0);
    }

    #[test]
    fn disconnect_grace_stops_client_motors() {
        let mut sim = make_pair(8, (97, 96), (0, 500_000), (10, -10), 0);
        sim.run_until(10 * US_PER_S);
        assert!(sim.link.connected);

        // server dies silently: client sees a disconnect and coasts on
        sim.devices[0].alive = false;
        sim.schedule_input(
            10 * US_PER_S + 1,
            1,
            Input::Disconnected { reason: 0x13 },
        );
        sim.run_until(140 * US_PER_S);

        let starts = sim.devices[1].motor.drive_starts();
        let last = *starts.last().unwrap();
        // predictive operation for two minutes, then idle
        assert!(last >= 125 * US_PER_S, "stopped too early at {} us", last);
        assert!(
            last <= 135 * US_PER_S,
            "kept driving past the grace period: {} us",
            last
        );
    }
}
