//! Translates decoded MAVLink messages into [`DroneState`] mutations.
//!
//! One [`StateEngine`] is shared across every [`crate::listener::Listener`].
//! Per-port state lives in a `DashMap` so concurrent listeners never block
//! each other; mutation of a single port's state is always single-writer in
//! practice (one listener per port, per `ListenerRegistry`'s invariant), so
//! `DashMap`'s entry API is used purely for map-level concurrency, not as a
//! substitute for per-field atomicity.
//!
//! Message-handler semantics are grounded on `mavkit::event_loop::update_state`'s
//! match-on-`MavMessage` shape (message matching + unit conversion idiom),
//! adapted from a single in-process `TelemetryWriters` to a multi-port
//! `DashMap<u16, DroneState>`, and carry the exact conversion formulas this
//! system specifies even where they diverge from `mavkit`'s own (e.g.
//! ground speed here is the raw `vx` component, not the `vx`/`vy` magnitude).

use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use mavlink::common::MavMessage;
use mavlink::MavHeader;
use tracing::trace;

use crate::state::{haversine_metres, DroneState, Waypoint};

const AIR_ALT_M: f64 = 0.5;
const THROTTLE_THRESHOLD: u16 = 1050;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Owns all per-port derived telemetry state and dispatches decoded
/// messages into it.
pub struct StateEngine {
    states: DashMap<u16, DroneState>,
    last_activity: DashMap<u16, u64>,
    dirty: dashmap::DashSet<u16>,
    /// `lastKnownPosition[port]` (spec.md §4.F), kept as its own auxiliary
    /// map rather than a sentinel on `DroneState` — a genuine first fix of
    /// `(0.0, 0.0)` must still be distinguishable from "no fix yet", which
    /// overloading `DroneState.lat/lon == 0.0` cannot do.
    last_known_position: DashMap<u16, (f64, f64)>,
    stale_threshold_ms: u64,
}

impl StateEngine {
    pub fn new(stale_threshold_ms: u64) -> Self {
        Self {
            states: DashMap::new(),
            last_activity: DashMap::new(),
            dirty: dashmap::DashSet::new(),
            last_known_position: DashMap::new(),
            stale_threshold_ms,
        }
    }

    /// Apply one decoded message arriving on `port` from `sender`.
    ///
    /// Unknown message variants are a no-op: the table only names the
    /// subset of `common::MavMessage` this system tracks.
    pub fn apply(&self, port: u16, sender: SocketAddr, header: &MavHeader, message: &MavMessage) {
        metrics::counter!("dronewatch_messages_decoded_total").increment(1);
        self.last_activity.insert(port, now_ms());
        self.dirty.insert(port);
        let mut entry = self.states.entry(port).or_insert_with(|| DroneState::empty(port));
        entry.gcs_ip = sender.ip().to_string();
        entry.system_id = header.system_id;
        entry.timestamp = chrono::Utc::now();

        match message {
            MavMessage::GLOBAL_POSITION_INT(data) => {
                apply_global_position_int(&mut entry, data, &self.last_known_position)
            }
            MavMessage::SYS_STATUS(data) => apply_sys_status(&mut entry, data),
            MavMessage::VFR_HUD(data) => apply_vfr_hud(&mut entry, data),
            MavMessage::WIND(data) => apply_wind(&mut entry, data),
            MavMessage::GPS_RAW_INT(data) => apply_gps_raw_int(&mut entry, data),
            MavMessage::ATTITUDE(data) => apply_attitude(&mut entry, data),
            MavMessage::NAV_CONTROLLER_OUTPUT(data) => apply_nav_controller_output(&mut entry, data),
            MavMessage::SERVO_OUTPUT_RAW(data) => apply_servo_output_raw(&mut entry, data),
            MavMessage::MISSION_COUNT(_) => entry.waypoints.clear(),
            MavMessage::MISSION_ITEM_INT(data) => apply_mission_item_int(&mut entry, data),
            other => {
                trace!(port, message_id = ?other, "unhandled MAVLink message variant");
            }
        }
    }

    /// States whose port last received traffic within `stale_threshold_ms`.
    pub fn active_snapshot(&self) -> Vec<DroneState> {
        let cutoff = now_ms().saturating_sub(self.stale_threshold_ms);
        self.states
            .iter()
            .filter(|entry| {
                self.last_activity
                    .get(entry.key())
                    .is_some_and(|last| *last >= cutoff)
            })
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn get(&self, port: u16) -> Option<DroneState> {
        self.states.get(&port).map(|entry| entry.value().clone())
    }

    /// Remove ports that have seen no traffic for longer than
    /// `2 * stale_threshold_ms` (spec's evictor sweep threshold, distinct
    /// from `active_snapshot`'s single-threshold cutoff).
    pub fn evict_stale(&self) -> usize {
        let cutoff = now_ms().saturating_sub(self.stale_threshold_ms * 2);
        let stale_ports: Vec<u16> = self
            .last_activity
            .iter()
            .filter(|entry| *entry.value() < cutoff)
            .map(|entry| *entry.key())
            .collect();
        for port in &stale_ports {
            self.states.remove(port);
            self.last_activity.remove(port);
            self.dirty.remove(port);
            self.last_known_position.remove(port);
        }
        stale_ports.len()
    }

    /// Drain the dirty set, returning the ports that changed since the
    /// last call. Used by [`crate::persister::Persister`] to batch only
    /// what actually changed (spec.md §4.H "pops the dirty set").
    pub fn take_dirty(&self) -> Vec<u16> {
        let ports: Vec<u16> = self.dirty.iter().map(|entry| *entry).collect();
        for port in &ports {
            self.dirty.remove(port);
        }
        ports
    }

    /// Re-mark `ports` dirty after a failed persist batch, so they're
    /// retried on the next tick (spec.md §4.H "merge the batch back into
    /// the dirty set for retry").
    pub fn mark_dirty_many(&self, ports: &[u16]) {
        for &port in ports {
            self.dirty.insert(port);
        }
    }

    /// Run the 60s evictor sweep until `cancel` fires (spec.md §4.F, §5).
    pub async fn run_evictor(self: std::sync::Arc<Self>, cancel: tokio_util::sync::CancellationToken) {
        let mut interval = tokio::time::interval(EVICTOR_INTERVAL);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {
                    let evicted = self.evict_stale();
                    if evicted > 0 {
                        trace!(evicted, "evictor sweep removed stale ports");
                    }
                }
            }
        }
    }
}

const EVICTOR_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

fn apply_global_position_int(
    state: &mut DroneState,
    data: &mavlink::common::GLOBAL_POSITION_INT_DATA,
    last_known_position: &DashMap<u16, (f64, f64)>,
) {
    let new_lat = data.lat as f64 / 1e7;
    let new_lon = data.lon as f64 / 1e7;

    if let Some(prior) = last_known_position.get(&state.port) {
        let (prior_lat, prior_lon) = *prior;
        state.dist_traveled += haversine_metres(prior_lat, prior_lon, new_lat, new_lon);
    }
    last_known_position.insert(state.port, (new_lat, new_lon));

    state.lat = new_lat;
    state.lon = new_lon;
    state.alt = data.relative_alt as f64 / 1000.0;
    state.heading = data.hdg as f32 / 100.0;
    state.ground_speed = data.vx as f64 / 100.0;
    state.vertical_speed = data.vz as f64 / 100.0;

    if let Some((home_lat, home_lon)) = state.home_location {
        state.dist_to_home = haversine_metres(new_lat, new_lon, home_lat, home_lon);
    }

    let now = now_ms();
    if state.alt > AIR_ALT_M {
        if !state.airborne {
            state.airborne = true;
            state.start_time = now;
        }
        state.time_in_air = (now.saturating_sub(state.start_time)) as f64 / 1000.0;
    } else if state.airborne {
        state.time_in_air = (now.saturating_sub(state.start_time)) as f64 / 1000.0;
        state.airborne = false;
    }
}

fn apply_sys_status(state: &mut DroneState, data: &mavlink::common::SYS_STATUS_DATA) {
    state.battery_voltage = data.voltage_battery as f64 / 1000.0;
    state.battery_current = data.current_battery as f64 / 100.0;
}

fn apply_vfr_hud(state: &mut DroneState, data: &mavlink::common::VFR_HUD_DATA) {
    // Last-writer-wins against GLOBAL_POSITION_INT-derived groundSpeed
    // (spec.md §9 Open Question — implemented as specified, not "fixed").
    state.airspeed = data.airspeed as f64;
    state.ground_speed = data.groundspeed as f64;
    state.vertical_speed = data.climb as f64;
    state.heading = data.heading as f32;

    state.tot = if state.ground_speed > 0.0 {
        round2(state.wp_dist / state.ground_speed)
    } else {
        0.0
    };
    state.toh = if state.ground_speed > 0.0 {
        round2(state.dist_to_home / state.ground_speed)
    } else {
        0.0
    };
}

fn apply_wind(state: &mut DroneState, data: &mavlink::common::WIND_DATA) {
    state.wind_vel = data.speed as f64;
}

fn apply_gps_raw_int(state: &mut DroneState, data: &mavlink::common::GPS_RAW_INT_DATA) {
    state.gps_hdop = data.eph as f32;
}

fn apply_attitude(state: &mut DroneState, data: &mavlink::common::ATTITUDE_DATA) {
    state.roll = round2((data.roll as f64).to_degrees());
    state.pitch = round2((data.pitch as f64).to_degrees());
    state.yaw = round2((data.yaw as f64).to_degrees());
}

fn apply_nav_controller_output(
    state: &mut DroneState,
    data: &mavlink::common::NAV_CONTROLLER_OUTPUT_DATA,
) {
    state.wp_dist = data.wp_dist as f64;
}

fn apply_servo_output_raw(state: &mut DroneState, data: &mavlink::common::SERVO_OUTPUT_RAW_DATA) {
    state.ch3out = data.servo3_raw;
    state.ch9out = data.servo9_raw;
    state.ch10out = data.servo10_raw;
    state.ch11out = data.servo11_raw;
    state.ch12out = data.servo12_raw;
    state.ch3percent = round2(((state.ch3out as f64 - 1000.0) / 1000.0) * 100.0);
    state.flight_status = if state.ch3out > THROTTLE_THRESHOLD { 1 } else { 0 };

    let now = now_ms();

    // AutoTime: driven by ch3out alone.
    if state.ch3out > THROTTLE_THRESHOLD {
        if !state.flying {
            state.flying = true;
            state.flight_start_time = now;
        }
        state.auto_time = (now.saturating_sub(state.flight_start_time)) as f64 / 1000.0;
    } else if state.flying {
        state.auto_time = (now.saturating_sub(state.flight_start_time)) as f64 / 1000.0;
        state.flying = false;
    }

    // Throttle-in-air: sliding-anchor accumulator, intentionally
    // double-counting while active (spec.md §9 Open Question).
    let throttle_condition = state.ch9out > 1000
        && state.ch10out > 1000
        && state.ch11out > 1000
        && state.ch12out > 1000
        && state.ch3out < THROTTLE_THRESHOLD;

    if throttle_condition {
        if !state.throttle_active {
            state.throttle_active = true;
            state.throttle_start_time = now;
        } else {
            state.total_throttle_time += now.saturating_sub(state.throttle_start_time);
            state.throttle_start_time = now;
        }
    } else if state.throttle_active {
        state.total_throttle_time += now.saturating_sub(state.throttle_start_time);
        state.throttle_active = false;
    }
}

fn apply_mission_item_int(state: &mut DroneState, data: &mavlink::common::MISSION_ITEM_INT_DATA) {
    let lat = data.x as f64 / 1e7;
    let lon = data.y as f64 / 1e7;
    let alt = data.z;

    if (lat == 0.0 && lon == 0.0) || alt == 0.0 {
        return;
    }

    state.waypoints.push(Waypoint {
        seq: data.seq,
        lat,
        lon,
        alt,
    });

    if data.seq == 0 {
        state.home_location = Some((lat, lon));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mavlink::common::{GLOBAL_POSITION_INT_DATA, MISSION_ITEM_INT_DATA, SERVO_OUTPUT_RAW_DATA};
    use std::net::{IpAddr, Ipv4Addr};

    fn sender() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)), 14551)
    }

    fn header() -> MavHeader {
        MavHeader {
            system_id: 1,
            component_id: 1,
            sequence: 0,
        }
    }

    #[test]
    fn unknown_port_starts_absent_from_active_snapshot() {
        let engine = StateEngine::new(30_000);
        assert!(engine.active_snapshot().is_empty());
    }

    #[test]
    fn global_position_int_applies_header_system_id_and_sender_ip() {
        let engine = StateEngine::new(30_000);
        let msg = MavMessage::GLOBAL_POSITION_INT(GLOBAL_POSITION_INT_DATA {
            time_boot_ms: 0,
            lat: 0,
            lon: 0,
            alt: 0,
            relative_alt: 0,
            vx: 0,
            vy: 0,
            vz: 0,
            hdg: 0,
        });
        engine.apply(14551, sender(), &header(), &msg);
        let state = engine.get(14551).unwrap();
        assert_eq!(state.gcs_ip, "10.0.0.5");
        assert_eq!(state.system_id, 1);
    }

    // S2 — Derived distance (spec.md §8).
    #[test]
    fn distance_accumulates_per_haversine_spec_scenario() {
        let engine = StateEngine::new(30_000);
        let first = MavMessage::GLOBAL_POSITION_INT(GLOBAL_POSITION_INT_DATA {
            time_boot_ms: 0,
            lat: 0,
            lon: 0,
            alt: 0,
            relative_alt: 0,
            vx: 0,
            vy: 0,
            vz: 0,
            hdg: 0,
        });
        engine.apply(14551, sender(), &header(), &first);

        let second = MavMessage::GLOBAL_POSITION_INT(GLOBAL_POSITION_INT_DATA {
            time_boot_ms: 1000,
            lat: 0,
            lon: 10_000,
            alt: 0,
            relative_alt: 0,
            vx: 0,
            vy: 0,
            vz: 0,
            hdg: 0,
        });
        engine.apply(14551, sender(), &header(), &second);

        let state = engine.get(14551).unwrap();
        assert!((state.dist_traveled - 111.32).abs() < 0.5, "got {}", state.dist_traveled);
    }

    // S3 — Throttle event timeline (spec.md §8), collapsed to logical
    // transitions rather than real time.
    #[test]
    fn servo_output_raw_drives_flying_and_throttle_state_machine() {
        let engine = StateEngine::new(30_000);

        let rising = MavMessage::SERVO_OUTPUT_RAW(SERVO_OUTPUT_RAW_DATA {
            time_usec: 0,
            servo1_raw: 0,
            servo2_raw: 0,
            servo3_raw: 1100,
            servo4_raw: 0,
            servo5_raw: 0,
            servo6_raw: 0,
            servo7_raw: 0,
            servo8_raw: 0,
            port: 0,
            servo9_raw: 1200,
            servo10_raw: 1200,
            servo11_raw: 1200,
            servo12_raw: 1200,
            servo13_raw: 0,
            servo14_raw: 0,
            servo15_raw: 0,
            servo16_raw: 0,
        });
        engine.apply(14551, sender(), &header(), &rising);
        let state = engine.get(14551).unwrap();
        assert_eq!(state.flight_status, 1);
        assert!(state.flying);
        assert!(!state.throttle_active);

        let falling = MavMessage::SERVO_OUTPUT_RAW(SERVO_OUTPUT_RAW_DATA {
            time_usec: 0,
            servo1_raw: 0,
            servo2_raw: 0,
            servo3_raw: 1000,
            servo4_raw: 0,
            servo5_raw: 0,
            servo6_raw: 0,
            servo7_raw: 0,
            servo8_raw: 0,
            port: 0,
            servo9_raw: 1200,
            servo10_raw: 1200,
            servo11_raw: 1200,
            servo12_raw: 1200,
            servo13_raw: 0,
            servo14_raw: 0,
            servo15_raw: 0,
            servo16_raw: 0,
        });
        engine.apply(14551, sender(), &header(), &falling);
        let state = engine.get(14551).unwrap();
        assert!(!state.flying);
        assert!(state.throttle_active);
    }

    // S4 — Home from mission (spec.md §8).
    #[test]
    fn mission_item_int_seq_zero_sets_home_and_appends_waypoint() {
        let engine = StateEngine::new(30_000);
        let item = MavMessage::MISSION_ITEM_INT(MISSION_ITEM_INT_DATA {
            param1: 0.0,
            param2: 0.0,
            param3: 0.0,
            param4: 0.0,
            x: 475_000_000,
            y: 85_000_000,
            z: 100.0,
            seq: 0,
            command: mavlink::common::MavCmd::MAV_CMD_NAV_WAYPOINT,
            target_system: 0,
            target_component: 0,
            frame: mavlink::common::MavFrame::MAV_FRAME_GLOBAL,
            current: 0,
            autocontinue: 0,
            mission_type: mavlink::common::MavMissionType::MAV_MISSION_TYPE_MISSION,
        });
        engine.apply(14551, sender(), &header(), &item);
        let state = engine.get(14551).unwrap();
        assert_eq!(state.home_location, Some((47.5, 8.5)));
        assert_eq!(state.waypoints.len(), 1);

        let dropped = MavMessage::MISSION_ITEM_INT(MISSION_ITEM_INT_DATA {
            param1: 0.0,
            param2: 0.0,
            param3: 0.0,
            param4: 0.0,
            x: 0,
            y: 0,
            z: 0.0,
            seq: 1,
            command: mavlink::common::MavCmd::MAV_CMD_NAV_WAYPOINT,
            target_system: 0,
            target_component: 0,
            frame: mavlink::common::MavFrame::MAV_FRAME_GLOBAL,
            current: 0,
            autocontinue: 0,
            mission_type: mavlink::common::MavMissionType::MAV_MISSION_TYPE_MISSION,
        });
        engine.apply(14551, sender(), &header(), &dropped);
        let state = engine.get(14551).unwrap();
        assert_eq!(state.waypoints.len(), 1, "zero-valued item must be dropped");
    }

    #[test]
    fn active_snapshot_excludes_ports_past_stale_threshold() {
        let engine = StateEngine::new(0);
        let msg = MavMessage::SYS_STATUS(mavlink::common::SYS_STATUS_DATA {
            onboard_control_sensors_present: mavlink::common::MavSysStatusSensor::default(),
            onboard_control_sensors_enabled: mavlink::common::MavSysStatusSensor::default(),
            onboard_control_sensors_health: mavlink::common::MavSysStatusSensor::default(),
            load: 0,
            voltage_battery: 0,
            current_battery: 0,
            drop_rate_comm: 0,
            errors_comm: 0,
            errors_count1: 0,
            errors_count2: 0,
            errors_count3: 0,
            errors_count4: 0,
            battery_remaining: 0,
        });
        engine.apply(14551, sender(), &header(), &msg);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(engine.active_snapshot().is_empty());
    }

    #[test]
    fn evict_stale_uses_double_the_stale_threshold() {
        let engine = StateEngine::new(10);
        let msg = MavMessage::SYS_STATUS(mavlink::common::SYS_STATUS_DATA {
            onboard_control_sensors_present: mavlink::common::MavSysStatusSensor::default(),
            onboard_control_sensors_enabled: mavlink::common::MavSysStatusSensor::default(),
            onboard_control_sensors_health: mavlink::common::MavSysStatusSensor::default(),
            load: 0,
            voltage_battery: 0,
            current_battery: 0,
            drop_rate_comm: 0,
            errors_comm: 0,
            errors_count1: 0,
            errors_count2: 0,
            errors_count3: 0,
            errors_count4: 0,
            battery_remaining: 0,
        });
        engine.apply(14551, sender(), &header(), &msg);
        std::thread::sleep(std::time::Duration::from_millis(15));
        // past single stale_threshold but not yet past 2x (20ms)
        assert_eq!(engine.evict_stale(), 0);
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert_eq!(engine.evict_stale(), 1);
        assert!(engine.get(14551).is_none());
    }
}
