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

use crate::context::{ArmedChange, Context, Epoch, PendingCustom};
use crate::role::{is_initiator, negotiate, PairingWindow};
use crate::*;

/// Outcome of a two-phase mode-change proposal from the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProposalOutcome {
    /// Armed locally; motors pause until the boundary
    Armed,
    /// Proposal matches the running mode; no pause, no arming
    NoOp,
    /// Boundary already in the past; a resend request went out
    RejectedStale,
    /// Proposed configuration fails validation
    RejectedInvalid(ModeError),
}

/// Link and pairing state
///
/// The radio stack's connection records are the source of truth; this
/// mirrors only what role negotiation and the reconnect grace need.
#[derive(Debug)]
pub(crate) struct ConnState {
    pub peer: Option<Mac>,
    pub peer_battery: u8,
    pub connected: bool,
    pub disconnected_at: Option<TimeUs>,
    pub pairing: PairingWindow,
    /// Peer was identified inside the pairing window; reconnects are
    /// accepted for it after the window closed
    pub bonded: bool,
}

/// One bilateral coordination device
///
/// Owns all four concerns: the offset filter and time-sync protocol, the
/// motor scheduler, and coordination/role. Everything happens on the
/// `progress` call stack; there is no shared mutable state.
pub struct Tandem {
    pub(crate) mac: Mac,
    pub(crate) battery_pct: u8,
    pub(crate) state: State,
    pub(crate) ctx: Context,
    pub(crate) sync: TimeSync,
    pub(crate) settings: StoredSettings,
    pub(crate) conn: ConnState,
    booted: bool,
}

impl Coordinator for Tandem {
    type TimeUs = TimeUs;
    type Addr = Mac;
    type Message = Message;
    type Settings = StoredSettings;

    fn new(addr: Mac, battery_pct: u8, stored: Option<StoredSettings>) -> Self {
        let settings = stored.unwrap_or_default();
        Tandem {
            mac: addr,
            battery_pct,
            state: State::default(),
            ctx: Context::new(&settings),
            sync: TimeSync::new(),
            settings,
            conn: ConnState {
                peer: None,
                peer_battery: 0,
                connected: false,
                disconnected_at: None,
                pairing: PairingWindow::open(0),
                bonded: false,
            },
            booted: false,
        }
    }

    fn progress(
        &mut self,
        now: TimeUs,
        input: Option<TandemInput>,
    ) -> (Action<TimeUs>, TandemEffects) {
        let mut fx = TandemEffects::new();
        if !self.booted {
            self.boot(now, &mut fx);
        }
        if let Some(input) = input {
            self.handle_input(now, input, &mut fx);
        }
        self.poll(now, &mut fx);

        let next = self.next(now, &mut fx);
        if next != self.state {
            event_log_state!(now, mac_bits(&self.mac), next);
        }
        self.state = next;

        (self.state.action(now, &self.sync), fx)
    }

    fn addr(&self) -> Mac {
        self.mac
    }
}

impl Tandem {
    /// Synchronized time, for diagnostics and tests
    pub fn now_sync(&self, now_local: TimeUs) -> TimeUs {
        self.sync.now_sync(now_local)
    }

    pub fn role(&self) -> Role {
        self.ctx.role
    }

    pub fn settings(&self) -> &StoredSettings {
        &self.settings
    }

    pub fn locked(&self, now: TimeUs) -> bool {
        self.sync.locked(now)
    }

    /// Current smoothed clock offset, for diagnostics
    pub fn filtered_offset_us(&self) -> i64 {
        self.sync.filter.offset_us()
    }

    pub fn mode(&self) -> (ModeId, ModeConfig) {
        (self.ctx.mode_id, self.ctx.mode)
    }

    /// Current motor epoch as (sync start, cycle period ms)
    pub fn epoch(&self) -> Option<(TimeUs, u16)> {
        self.ctx
            .epoch
            .map(|epoch| (epoch.start_us, epoch.cycle_period_ms))
    }

    /// Power-on: open the pairing window and make the device discoverable
    fn boot(&mut self, now: TimeUs, fx: &mut TandemEffects) {
        self.booted = true;
        self.ctx.session_active = true;
        self.conn.pairing = PairingWindow::open(now);
        let _ = fx.push(Effect::SetTxPowerMax);
        let _ = fx.push(Effect::Advertise {
            service: Service::Bilateral,
            battery_pct: self.battery_pct,
        });
        let _ = fx.push(Effect::StartScan {
            service: Service::Bilateral,
        });
        event_log!(now, mac_bits(&self.mac), "boot", self.battery_pct);
    }

    /// Timer-driven work that is independent of the motor state
    fn poll(&mut self, now: TimeUs, fx: &mut TandemEffects) {
        // pairing window expiry: fall back to standalone, keep only the
        // configuration service discoverable
        if self.ctx.role == Role::None
            && !self.conn.connected
            && self.conn.peer.is_none()
            && !self.conn.pairing.is_open(now)
        {
            info!("pairing window closed without peer, running standalone");
            self.ctx.role = Role::Standalone;
            let _ = fx.push(Effect::StopScan);
            let _ = fx.push(Effect::StopAdvertising);
            let _ = fx.push(Effect::Advertise {
                service: Service::Configuration,
                battery_pct: self.battery_pct,
            });
            event_log_role!(now, mac_bits(&self.mac), self.ctx.role, 0);
        }

        // a client left alone too long stops its motors
        if let Some(went_down) = self.conn.disconnected_at {
            if self.ctx.role.is_client()
                && self.ctx.session_active
                && now.saturating_sub(went_down) > DISCONNECT_GRACE_US
            {
                warn!("no reconnection within grace period, stopping session");
                self.ctx.session_active = false;
                self.conn.disconnected_at = None;
            }
        }

        // custom-frequency slider quiescence
        if let Some(pending) = self.ctx.pending_custom {
            if now.saturating_sub(pending.last_write_us) >= CUSTOM_FREQ_DEBOUNCE_US {
                self.ctx.pending_custom = None;
                self.trigger_mode_change(now, ModeId::Custom, fx);
            }
        }

        // stale sync on the client: ask for a fresh handshake, the server
        // answers with a response plus a forced burst
        if self.ctx.role.is_client()
            && self.conn.connected
            && self.sync.lock_lost(now)
            && self.sync.handshake_done()
        {
            warn!("time-sync lock lost, requesting beacons");
            self.sync.start_handshake(now, fx);
        }

        self.sync.poll(
            now,
            self.ctx.role,
            self.ctx.role.is_server(),
            self.ctx.epoch_view(),
            fx,
        );
    }

    fn handle_input(&mut self, now: TimeUs, input: TandemInput, fx: &mut TandemEffects) {
        match input {
            Input::Packet(msg) => self.handle_packet(now, msg, fx),

            Input::ButtonShort => {
                if now.saturating_sub(self.ctx.last_button_us) < BUTTON_DEBOUNCE_US {
                    return;
                }
                self.ctx.last_button_us = now;
                let next = self.ctx.mode_id.next_preset();
                self.trigger_mode_change(now, next, fx);
            }

            Input::ButtonHold => {
                info!("shutdown hold detected");
                self.ctx.shutdown_requested = true;
            }

            Input::Battery { pct } => {
                self.battery_pct = pct;
                if self.conn.pairing.is_open(now) {
                    // keep the advertised battery current for role assignment
                    let _ = fx.push(Effect::Advertise {
                        service: Service::Bilateral,
                        battery_pct: pct,
                    });
                } else if self.conn.connected && self.ctx.role.is_client() {
                    self.push_droppable(fx, Message::ClientBattery { pct });
                }
            }

            Input::Discovered { peer, battery_pct } => {
                self.on_discovered(now, peer, battery_pct, fx);
            }

            Input::Connected { peer } => self.on_connected(now, peer, fx),

            Input::ConnectFailed => {
                warn!("connect attempt failed, rescanning");
                if !self.conn.connected && self.conn.disconnected_at.is_none() {
                    // never paired: forget the peer so the standalone
                    // fallback can engage if nothing else turns up
                    self.conn.peer = None;
                    self.conn.bonded = false;
                }
                let _ = fx.push(Effect::StartScan {
                    service: Service::Bilateral,
                });
            }

            Input::Disconnected { reason } => {
                warn!("peer disconnected (reason {})", reason);
                self.conn.connected = false;
                self.conn.disconnected_at = Some(now);
                if self.ctx.session_active && self.conn.bonded {
                    // offset stays frozen; motors continue predictively while
                    // we try to get the peer back
                    let _ = fx.push(Effect::Advertise {
                        service: Service::Bilateral,
                        battery_pct: self.battery_pct,
                    });
                    let _ = fx.push(Effect::StartScan {
                        service: Service::Bilateral,
                    });
                }
            }

            Input::SettingsWrite(new) => self.on_settings_write(now, new, fx),
        }
    }

    fn handle_packet(&mut self, now: TimeUs, msg: Message, fx: &mut TandemEffects) {
        event_log_msg!(now, mac_bits(&self.mac), &msg);
        match msg {
            Message::TimeRequest { t1 } => {
                self.sync.on_time_request(
                    now,
                    t1,
                    self.ctx.role.is_server(),
                    self.ctx.epoch_view(),
                    fx,
                );
            }

            Message::TimeResponse { t1, t2, t3 } => {
                if self.ctx.role.is_client() {
                    match self.sync.on_time_response(now, t1, t2, t3, fx) {
                        Ok(()) => {}
                        Err(HandshakeError::UnexpectedReply) => {
                            debug!("stale time response dropped");
                        }
                        Err(err) => warn!("handshake: {:?}", err),
                    }
                }
            }

            Message::Beacon(beacon) => self.apply_beacon(now, &beacon),

            Message::ModeChangeProposal {
                armed_epoch_us,
                mode_id,
                freq_centihz,
                motor_active_duty_pct,
                pwm_intensity_pct,
            } => {
                let Some(id) = ModeId::from_u8(mode_id) else {
                    warn!("proposal with unknown mode {}", mode_id);
                    return;
                };
                if armed_epoch_us == 0 {
                    // a client request: the epoch owner picks the boundary.
                    // An already armed server drops it so simultaneous
                    // presses execute exactly one change.
                    if self.ctx.role.is_server() && self.ctx.armed.is_none() {
                        self.trigger_mode_change(now, id, fx);
                    }
                    return;
                }
                let outcome = self.on_proposal(
                    now,
                    ArmedChange {
                        epoch_us: armed_epoch_us,
                        mode_id: id,
                        mode: ModeConfig {
                            freq_centihz,
                            motor_active_duty_pct,
                            pwm_intensity_pct,
                        },
                    },
                    fx,
                );
                match outcome {
                    ProposalOutcome::Armed | ProposalOutcome::NoOp => {}
                    ProposalOutcome::RejectedStale => {
                        warn!("proposal boundary already past, requesting resend");
                    }
                    ProposalOutcome::RejectedInvalid(err) => {
                        warn!("rejecting invalid proposed mode: {:?}", err);
                    }
                }
            }

            Message::MotorStarted {
                epoch_us,
                cycle_period_ms,
            } => {
                if cycle_period_ms == 0 {
                    warn!("motor-started notice with zero period, dropped");
                    return;
                }
                if self.ctx.role.is_client() {
                    self.ctx.epoch = Some(Epoch {
                        start_us: epoch_us,
                        cycle_period_ms,
                    });
                    self.ctx.motor_started_received = true;
                    self.ctx.client_skip_inactive_wait = true;
                    self.ctx.own_active_target = None;
                    self.ctx.resync = true;
                }
            }

            Message::Settings { .. } => {
                let before = self.settings.clone();
                self.settings.apply_sync(&msg);
                let _ = fx.push(Effect::Persist(self.settings.clone()));
                let custom_changed = before.custom_freq_centihz
                    != self.settings.custom_freq_centihz
                    || before.custom_duty_pct != self.settings.custom_duty_pct;
                if custom_changed && self.ctx.role.owns_epoch() && self.ctx.mode_id == ModeId::Custom
                {
                    self.ctx.pending_custom = Some(PendingCustom { last_write_us: now });
                }
            }

            Message::ActivationReport {
                cycle_index,
                phase_error_ms,
                t1,
                t2,
                t3,
            } => {
                if !self.ctx.role.is_server() {
                    return;
                }
                debug!(
                    "client cycle {} phase error {} ms",
                    cycle_index, phase_error_ms
                );
                self.sync.on_activation_report(now, t1, t2, t3);
                // a report while a change is armed doubles as a resend
                // request from a client that missed or rejected the proposal
                if let Some(armed) = self.ctx.armed {
                    if armed.epoch_us > self.sync.now_sync(now) {
                        self.push_critical(fx, proposal_message(&armed));
                    }
                }
            }

            Message::Shutdown => {
                info!("peer shut down, ending session");
                self.ctx.session_active = false;
                self.ctx.resync = true;
                self.conn.bonded = false;
                self.conn.disconnected_at = None;
                let _ = fx.push(Effect::StopScan);
                let _ = fx.push(Effect::Advertise {
                    service: Service::Configuration,
                    battery_pct: self.battery_pct,
                });
            }

            Message::StartAdvertising => {
                let _ = fx.push(Effect::Advertise {
                    service: Service::Bilateral,
                    battery_pct: self.battery_pct,
                });
            }

            Message::ClientBattery { pct } => {
                self.conn.peer_battery = pct;
            }

            Message::FirmwareVersion {
                major,
                minor,
                patch,
                ..
            } => {
                if (major, minor, patch) != (FW_MAJOR, FW_MINOR, FW_PATCH) {
                    // soft enforcement: flag it, keep the connection
                    warn!(
                        "firmware mismatch: peer {}.{}.{}, own {}.{}.{}",
                        major, minor, patch, FW_MAJOR, FW_MINOR, FW_PATCH
                    );
                    let _ = fx.push(Effect::LedBlink {
                        r: 255,
                        g: 191,
                        b: 0,
                        count: 3,
                    });
                }
            }
        }
    }

    /// Beacon receipt on the client: offset sample plus epoch/mode tracking
    fn apply_beacon(&mut self, now: TimeUs, beacon: &Beacon) {
        if !self.ctx.role.is_client() {
            return;
        }
        let outcome = self.sync.on_beacon(now, beacon);
        if outcome == FilterOutcome::Outlier {
            debug!("beacon offset sample rejected as outlier");
        }
        if beacon.motor_epoch_us == 0 || beacon.cycle_period_ms == 0 {
            // server has not started motors yet
            return;
        }
        let incoming = Epoch {
            start_us: beacon.motor_epoch_us,
            cycle_period_ms: beacon.cycle_period_ms,
        };
        if self.ctx.armed.is_some() {
            // mid two-phase change; the commit applies the same epoch
            return;
        }
        let Some(mode_id) = ModeId::from_u8(beacon.mode_id) else {
            warn!("beacon with unknown mode {}", beacon.mode_id);
            return;
        };

        let material = match self.ctx.epoch {
            None => true,
            Some(current) => {
                current.cycle_period_ms != incoming.cycle_period_ms
                    || current.start_us.abs_diff(incoming.start_us) > 50_000
            }
        };
        let mode_changed = mode_id != self.ctx.mode_id
            || beacon.motor_active_duty_pct != self.ctx.mode.motor_active_duty_pct;

        if !material && !mode_changed {
            // track sub-threshold anchor adjustments silently
            self.ctx.epoch = Some(incoming);
            return;
        }

        self.ctx.epoch = Some(incoming);
        self.ctx.mode_id = mode_id;
        self.ctx.mode = ModeConfig {
            freq_centihz: (100_000u32 / incoming.cycle_period_ms.max(1) as u32) as u16,
            motor_active_duty_pct: beacon.motor_active_duty_pct,
            pwm_intensity_pct: self.settings.mode_intensities[mode_id.as_u8() as usize],
        };
        self.ctx.own_active_target = None;
        self.ctx.last_active_cycle = None;
        self.ctx.resync = true;
        debug!("beacon moved epoch or mode, rescheduling");
    }

    /// Incoming two-phase proposal on the client
    fn on_proposal(
        &mut self,
        now: TimeUs,
        proposal: ArmedChange,
        fx: &mut TandemEffects,
    ) -> ProposalOutcome {
        if proposal.mode_id == self.ctx.mode_id && proposal.mode == self.ctx.mode {
            return ProposalOutcome::NoOp;
        }
        if proposal.epoch_us <= self.sync.now_sync(now) {
            // boundary already past: reject and ask for a resend with a
            // report carrying our current cycle
            if let Some(report) =
                self.sync
                    .make_report(now, self.ctx.cycle_index, self.ctx.last_drift_ms)
            {
                self.push_critical(fx, report);
            }
            return ProposalOutcome::RejectedStale;
        }
        if let Err(err) = proposal.mode.validate(proposal.mode_id) {
            return ProposalOutcome::RejectedInvalid(err);
        }
        self.settings.current_mode = proposal.mode_id;
        if proposal.mode_id == ModeId::Custom {
            self.settings.custom_freq_centihz = proposal.mode.freq_centihz;
            self.settings.custom_duty_pct = proposal.mode.motor_active_duty_pct;
        }
        self.settings.mode_intensities[proposal.mode_id.as_u8() as usize] =
            proposal.mode.pwm_intensity_pct;
        let _ = fx.push(Effect::Persist(self.settings.clone()));
        self.ctx.armed = Some(proposal);
        self.ctx.pause_applied = false;
        // stale INACTIVE targets must not survive the pause
        self.ctx.own_active_target = None;
        self.ctx.resync = true;
        ProposalOutcome::Armed
    }

    fn on_discovered(&mut self, now: TimeUs, peer: Mac, battery_pct: u8, fx: &mut TandemEffects) {
        if peer == self.mac || self.conn.connected {
            return;
        }
        let known = self.conn.peer == Some(peer);
        if !self.conn.pairing.is_open(now) && !(known && self.conn.bonded) {
            // late peers are rejected as peers; they may still connect as apps
            debug!("ignoring peer discovered outside pairing window");
            return;
        }
        self.conn.peer = Some(peer);
        self.conn.peer_battery = battery_pct;
        self.conn.bonded = true;
        self.conn.pairing.close();
        let _ = fx.push(Effect::StopScan);
        if is_initiator(&self.mac, &peer) {
            let _ = fx.push(Effect::ConnectTo { peer });
        }
    }

    fn on_connected(&mut self, now: TimeUs, peer: Mac, fx: &mut TandemEffects) {
        match self.conn.peer {
            Some(known) if known == peer => {}
            None if self.conn.pairing.is_open(now) => {
                // connect raced ahead of the discovery callback
                self.conn.peer = Some(peer);
                self.conn.bonded = true;
                self.conn.pairing.close();
            }
            _ => {
                // mobile application or a late peer; not a session member
                debug!("non-peer connection accepted for configuration only");
                return;
            }
        }

        self.conn.connected = true;
        self.conn.disconnected_at = None;
        self.ctx.session_active = true;

        let old_role = self.ctx.role;
        let new_role = negotiate(
            self.battery_pct,
            &self.mac,
            self.conn.peer_battery,
            &peer,
        );
        if matches!(old_role, Role::Server | Role::Client) && old_role != new_role {
            self.sync.on_role_swap();
        }
        self.ctx.role = new_role;
        event_log_role!(now, mac_bits(&self.mac), new_role, self.conn.peer_battery);

        // one-shot version exchange, soft enforced on receipt
        let _ = fx.push(Effect::Transmit(Message::FirmwareVersion {
            major: FW_MAJOR,
            minor: FW_MINOR,
            patch: FW_PATCH,
            build_timestamp: FW_BUILD_TIMESTAMP,
        }));

        if new_role.is_client() {
            self.sync.start_handshake(now, fx);
        }
    }

    fn on_settings_write(&mut self, now: TimeUs, new: StoredSettings, fx: &mut TandemEffects) {
        let before = self.settings.clone();
        self.settings = new;
        let _ = fx.push(Effect::Persist(self.settings.clone()));
        if self.conn.connected {
            self.push_droppable(fx, self.settings.sync_message());
        }

        let custom_changed = before.custom_freq_centihz != self.settings.custom_freq_centihz
            || before.custom_duty_pct != self.settings.custom_duty_pct;

        if self.settings.current_mode != self.ctx.mode_id {
            self.trigger_mode_change(now, self.settings.current_mode, fx);
        } else if custom_changed && self.ctx.mode_id == ModeId::Custom {
            if self.ctx.role.owns_epoch() {
                // debounce slider drags; the change fires after quiescence
                self.ctx.pending_custom = Some(PendingCustom { last_write_us: now });
            }
            // a client's write reaches the server through the settings sync
        }
    }

    /// Start a coordinated mode change, or apply it directly outside a
    /// session
    pub(crate) fn trigger_mode_change(
        &mut self,
        now: TimeUs,
        new_id: ModeId,
        fx: &mut TandemEffects,
    ) {
        let new_mode = ModeConfig::resolve(new_id, &self.settings);
        if let Err(err) = new_mode.validate(new_id) {
            warn!("refusing mode change: {:?}", err);
            return;
        }
        if new_id == self.ctx.mode_id && new_mode == self.ctx.mode {
            debug!("mode change is a no-op");
            return;
        }

        match self.ctx.role {
            Role::Server | Role::Standalone => {
                if self.ctx.armed.is_some() {
                    // one change at a time; concurrent triggers are dropped
                    debug!("mode change already armed, dropping trigger");
                    return;
                }
                let Some(epoch) = self.ctx.epoch else {
                    // no motors running; apply directly
                    self.apply_mode_directly(new_id, new_mode, fx);
                    return;
                };
                let now_sync = self.sync.now_sync(now);
                let earliest = now_sync + MODE_CHANGE_LEAD_US;
                let period = epoch.period_us();
                let n = if earliest <= epoch.start_us {
                    0
                } else {
                    (earliest - epoch.start_us).div_ceil(period)
                };
                let armed_epoch_us = epoch.start_us + n * period;
                let armed = ArmedChange {
                    epoch_us: armed_epoch_us,
                    mode_id: new_id,
                    mode: new_mode,
                };
                // the authoritative epoch moves to the boundary right away so
                // beacons advertise the new timing through the pause
                self.ctx.epoch = Some(Epoch {
                    start_us: armed_epoch_us,
                    cycle_period_ms: new_mode.cycle_period_ms() as u16,
                });
                self.ctx.epoch_anchored = false;
                self.ctx.armed = Some(armed);
                self.ctx.pause_applied = false;
                self.ctx.own_active_target = None;
                self.ctx.resync = true;
                self.settings.current_mode = new_id;
                let _ = fx.push(Effect::Persist(self.settings.clone()));
                if self.conn.connected {
                    self.push_critical(fx, proposal_message(&armed));
                }
                self.sync.force_burst(now);
            }
            Role::Client => {
                if self.conn.connected {
                    // the server picks the boundary; epoch 0 marks a request
                    self.push_critical(
                        fx,
                        Message::ModeChangeProposal {
                            armed_epoch_us: 0,
                            mode_id: new_id.as_u8(),
                            freq_centihz: new_mode.freq_centihz,
                            motor_active_duty_pct: new_mode.motor_active_duty_pct,
                            pwm_intensity_pct: new_mode.pwm_intensity_pct,
                        },
                    );
                } else {
                    debug!("not connected, cannot request mode change");
                }
            }
            Role::None => self.apply_mode_directly(new_id, new_mode, fx),
        }
    }

    fn apply_mode_directly(&mut self, id: ModeId, mode: ModeConfig, fx: &mut TandemEffects) {
        self.ctx.mode_id = id;
        self.ctx.mode = mode;
        self.settings.current_mode = id;
        let _ = fx.push(Effect::Persist(self.settings.clone()));
    }

    /// Transmit that may be dropped under effect-queue pressure
    pub(crate) fn push_droppable(&self, fx: &mut TandemEffects, msg: Message) {
        if fx.push(Effect::Transmit(msg)).is_err() {
            warn!("effect queue full, dropping low-priority message");
        }
    }

    /// Transmit that must go out; evicts a droppable message if the queue
    /// is full. Shutdown and mode-change traffic is never dropped.
    pub(crate) fn push_critical(&self, fx: &mut TandemEffects, msg: Message) {
        if fx.is_full() {
            let droppable = fx.iter().position(|eff| {
                matches!(
                    eff,
                    Effect::Transmit(Message::Settings { .. })
                        | Effect::Transmit(Message::ClientBattery { .. })
                        | Effect::Transmit(Message::ActivationReport { .. })
                )
            });
            match droppable {
                Some(at) => {
                    fx.remove(at);
                }
                None => {
                    error!("effect queue full, critical message lost");
                    return;
                }
            }
        }
        let _ = fx.push(Effect::Transmit(msg));
    }
}

fn proposal_message(armed: &ArmedChange) -> Message {
    Message::ModeChangeProposal {
        armed_epoch_us: armed.epoch_us,
        mode_id: armed.mode_id.as_u8(),
        freq_centihz: armed.mode.freq_centihz,
        motor_active_duty_pct: armed.mode.motor_active_duty_pct,
        pwm_intensity_pct: armed.mode.pwm_intensity_pct,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: Mac = [0xc0, 0xff, 0xee, 0, 0, 1];

    /// Drive a lone device forward in time, collecting timestamped effects
    fn run(
        dev: &mut Tandem,
        mut now: TimeUs,
        until: TimeUs,
        mut inputs: heapless::Vec<(TimeUs, TandemInput), 8>,
    ) -> (TimeUs, std::vec::Vec<(TimeUs, TandemEffect)>) {
        let mut log = std::vec::Vec::new();
        while now <= until {
            let due = matches!(inputs.first(), Some((at, _)) if *at <= now);
            let input = if due { Some(inputs.remove(0).1) } else { None };
            let (action, fx) = dev.progress(now, input);
            log.extend(fx.into_iter().map(|e| (now, e)));
            match action {
                Action::Wait { end } => now = end.max(now + 1),
                Action::None => now += 1,
                Action::Sleep => break,
            }
        }
        (now, log)
    }

    fn drive_starts(log: &[(TimeUs, TandemEffect)]) -> std::vec::Vec<(TimeUs, bool)> {
        log.iter()
            .filter_map(|(t, e)| match e {
                Effect::MotorForward { .. } => Some((*t, true)),
                Effect::MotorReverse { .. } => Some((*t, false)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn standalone_after_pairing_window_runs_alone() {
        let mut dev = Tandem::new(MAC, 80, None);
        let (_, log) = run(&mut dev, 0, 40_000_000, heapless::Vec::new());
        assert_eq!(dev.role(), Role::Standalone);

        let starts = drive_starts(&log);
        assert!(!starts.is_empty());
        // nothing drives inside the pairing window
        assert!(starts[0].0 >= PAIRING_WINDOW_US);
        // M1 default: one own ACTIVE per 1 s cycle, alternating polarity
        for pair in starts.windows(2) {
            let gap = pair[1].0 - pair[0].0;
            assert!((900_000..=1_100_000).contains(&gap), "gap {} us", gap);
            assert_ne!(pair[0].1, pair[1].1);
        }
    }

    #[test]
    fn drive_span_matches_duty() {
        let mut dev = Tandem::new(MAC, 80, None);
        let (_, log) = run(&mut dev, 0, 36_000_000, heapless::Vec::new());
        let start = drive_starts(&log)[0].0;
        let coast_after = log
            .iter()
            .find(|(t, e)| *t > start && matches!(e, Effect::MotorCoast))
            .map(|(t, _)| *t)
            .unwrap();
        // M1: 500 ms half, 50 % duty, 250 ms drive (plus wake-up slack)
        let span = coast_after - start;
        assert!((200_000..=300_000).contains(&span), "span {} us", span);
    }

    #[test]
    fn button_cycles_mode_with_pause_and_commit() {
        let mut dev = Tandem::new(MAC, 80, None);
        let (now, _) = run(&mut dev, 0, 36_000_000, heapless::Vec::new());
        assert_eq!(dev.ctx.mode_id, ModeId::M1);

        let mut inputs = heapless::Vec::new();
        inputs.push((now, Input::ButtonShort)).unwrap();
        let press_at = now;
        let (_, log) = run(&mut dev, now, now + 8_000_000, inputs);
        assert_eq!(dev.ctx.mode_id, ModeId::M2);
        assert!(dev.ctx.armed.is_none());

        // motors pause between arming and the commit boundary
        let armed_window_start = log
            .iter()
            .find(|(t, e)| *t >= press_at && matches!(e, Effect::MotorCoast))
            .map(|(t, _)| *t)
            .unwrap();
        let resume = drive_starts(&log)
            .iter()
            .find(|(t, _)| *t > armed_window_start)
            .map(|(t, _)| *t)
            .unwrap();
        assert!(resume - press_at >= MODE_CHANGE_LEAD_US);
        assert!(drive_starts(&log)
            .iter()
            .all(|(t, _)| *t <= armed_window_start || *t >= resume));
    }

    #[test]
    fn second_button_press_while_armed_is_dropped() {
        let mut dev = Tandem::new(MAC, 80, None);
        let (now, _) = run(&mut dev, 0, 36_000_000, heapless::Vec::new());

        let mut fx = TandemEffects::new();
        dev.handle_input(now, Input::ButtonShort, &mut fx);
        let armed = dev.ctx.armed.unwrap();
        let mut fx = TandemEffects::new();
        dev.handle_input(now + BUTTON_DEBOUNCE_US + 1, Input::ButtonShort, &mut fx);
        // still the same armed change, no re-arming
        assert_eq!(dev.ctx.armed, Some(armed));
    }

    #[test]
    fn proposal_outcomes_are_typed() {
        let mut dev = Tandem::new(MAC, 80, None);
        let (now, _) = run(&mut dev, 0, 36_000_000, heapless::Vec::new());
        dev.ctx.role = Role::Client;

        let mut fx = TandemEffects::new();
        // boundary already in the past
        let stale = ArmedChange {
            epoch_us: 1,
            mode_id: ModeId::M0,
            mode: ModeConfig::resolve(ModeId::M0, dev.settings()),
        };
        assert_eq!(
            dev.on_proposal(now, stale, &mut fx),
            ProposalOutcome::RejectedStale
        );

        // the running mode again is a no-op, no pause, no arming
        let noop = ArmedChange {
            epoch_us: dev.now_sync(now) + 10_000_000,
            mode_id: dev.ctx.mode_id,
            mode: dev.ctx.mode,
        };
        assert_eq!(dev.on_proposal(now, noop, &mut fx), ProposalOutcome::NoOp);
        assert!(dev.ctx.armed.is_none());

        // out-of-range intensity is refused
        let mut bad = ModeConfig::resolve(ModeId::M3, dev.settings());
        bad.pwm_intensity_pct = 95;
        let invalid = ArmedChange {
            epoch_us: dev.now_sync(now) + 10_000_000,
            mode_id: ModeId::M3,
            mode: bad,
        };
        assert!(matches!(
            dev.on_proposal(now, invalid, &mut fx),
            ProposalOutcome::RejectedInvalid(_)
        ));

        // a valid future boundary arms
        let fresh = ArmedChange {
            epoch_us: dev.now_sync(now) + 10_000_000,
            mode_id: ModeId::M0,
            mode: ModeConfig::resolve(ModeId::M0, dev.settings()),
        };
        assert_eq!(dev.on_proposal(now, fresh, &mut fx), ProposalOutcome::Armed);
        assert!(dev.ctx.armed.is_some());
    }

    #[test]
    fn hold_shuts_down_cleanly() {
        let mut dev = Tandem::new(MAC, 80, None);
        let (now, _) = run(&mut dev, 0, 36_000_000, heapless::Vec::new());
        let mut inputs = heapless::Vec::new();
        inputs.push((now, Input::ButtonHold)).unwrap();
        let (_, log) = run(&mut dev, now, now + 1_000_000, inputs);
        assert!(log
            .iter()
            .any(|(_, e)| matches!(e, Effect::MotorCoast)));
        assert!(log.iter().any(|(_, e)| matches!(e, Effect::LedClear)));
        assert_eq!(dev.state, State::Shutdown);
    }

    #[test]
    fn mode_change_boundary_lies_on_cycle_grid() {
        let mut dev = Tandem::new(MAC, 80, None);
        let (now, _) = run(&mut dev, 0, 36_000_000, heapless::Vec::new());
        let epoch = dev.ctx.epoch.unwrap();

        let mut fx = TandemEffects::new();
        dev.trigger_mode_change(now, ModeId::M3, &mut fx);
        let armed = dev.ctx.armed.unwrap();
        let distance = armed.epoch_us - epoch.start_us;
        assert_eq!(distance % epoch.period_us(), 0);
        assert!(armed.epoch_us >= dev.now_sync(now) + MODE_CHANGE_LEAD_US);
    }

    #[test]
    fn settings_write_debounces_custom_change() {
        let mut dev = Tandem::new(MAC, 80, None);
        let (now, _) = run(&mut dev, 0, 36_000_000, heapless::Vec::new());

        // move into Custom first
        let mut settings = dev.settings().clone();
        settings.current_mode = ModeId::Custom;
        let mut fx = TandemEffects::new();
        dev.on_settings_write(now, settings, &mut fx);
        let (now, _) = run(&mut dev, now, now + 6_000_000, heapless::Vec::new());
        assert_eq!(dev.ctx.mode_id, ModeId::Custom);

        // three slider writes in quick succession arm exactly one change
        for (i, freq) in [(0u64, 90u16), (1, 80), (2, 70)] {
            let mut settings = dev.settings().clone();
            settings.custom_freq_centihz = freq;
            let mut fx = TandemEffects::new();
            dev.on_settings_write(now + i * 100_000, settings, &mut fx);
        }
        assert!(dev.ctx.pending_custom.is_some());
        assert!(dev.ctx.armed.is_none());
        let (_, _) = run(&mut dev, now + 200_000, now + 6_000_000, heapless::Vec::new());
        assert_eq!(dev.ctx.mode_id, ModeId::Custom);
        assert_eq!(dev.ctx.mode.freq_centihz, 70);
        assert!(dev.ctx.pending_custom.is_none());
    }
}
