//! `DroneState` data model: one record per active port, plus the haversine
//! distance helper used to integrate travelled distance and distance-to-home.

use serde::{Deserialize, Serialize};

/// A single mission waypoint, in insertion order. `seq` is not deduplicated:
/// applying `MISSION_ITEM_INT` twice with the same `seq` yields two entries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub seq: u16,
    pub lat: f64,
    pub lon: f64,
    pub alt: f32,
}

/// Per-port derived telemetry state. Keyed externally by `port` in
/// [`crate::state_engine::StateEngine`]; `port` here always equals that key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DroneState {
    // Identity
    pub port: u16,
    pub gcs_ip: String,
    pub system_id: u8,

    // Position
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    pub heading: f32,
    pub target_heading: f32,
    pub previous_heading: f32,

    // Kinematics
    pub ground_speed: f64,
    pub vertical_speed: f64,
    pub airspeed: f64,
    pub wind_vel: f64,
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,

    // Derived distances
    pub dist_traveled: f64,
    pub dist_to_home: f64,
    pub wp_dist: f64,
    pub tot: f64,
    pub toh: f64,

    // GPS
    pub gps_hdop: f32,

    // Power
    pub battery_voltage: f64,
    pub battery_current: f64,

    // Servo
    pub ch3out: u16,
    pub ch9out: u16,
    pub ch10out: u16,
    pub ch11out: u16,
    pub ch12out: u16,
    pub ch3percent: f64,

    // Event-driven timers (monotonic ms since UNIX_EPOCH)
    pub airborne: bool,
    pub start_time: u64,
    pub time_in_air: f64,
    pub flying: bool,
    pub flight_start_time: u64,
    pub auto_time: f64,
    pub throttle_active: bool,
    pub throttle_start_time: u64,
    pub total_throttle_time: u64,
    pub flight_status: i32,

    // Mission
    pub home_location: Option<(f64, f64)>,
    pub waypoints: Vec<Waypoint>,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl DroneState {
    /// A freshly created, all-zero state for `port`. Grounded on
    /// `StateEngine.cache.computeIfAbsent(port, DroneState.empty)` (spec.md §4.F).
    pub fn empty(port: u16) -> Self {
        Self {
            port,
            gcs_ip: String::new(),
            system_id: 0,
            lat: 0.0,
            lon: 0.0,
            alt: 0.0,
            heading: 0.0,
            target_heading: 0.0,
            previous_heading: 0.0,
            ground_speed: 0.0,
            vertical_speed: 0.0,
            airspeed: 0.0,
            wind_vel: 0.0,
            roll: 0.0,
            pitch: 0.0,
            yaw: 0.0,
            dist_traveled: 0.0,
            dist_to_home: 0.0,
            wp_dist: 0.0,
            tot: 0.0,
            toh: 0.0,
            gps_hdop: 0.0,
            battery_voltage: 0.0,
            battery_current: 0.0,
            ch3out: 0,
            ch9out: 0,
            ch10out: 0,
            ch11out: 0,
            ch12out: 0,
            ch3percent: 0.0,
            airborne: false,
            start_time: 0,
            time_in_air: 0.0,
            flying: false,
            flight_start_time: 0,
            auto_time: 0.0,
            throttle_active: false,
            throttle_start_time: 0,
            total_throttle_time: 0,
            flight_status: 0,
            home_location: None,
            waypoints: Vec::new(),
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn waypoints_count(&self) -> usize {
        self.waypoints.len()
    }
}

/// Serialized shape mirroring [`DroneState`] in camelCase for the WebSocket
/// egress (spec.md §6, `DroneDTO`).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DroneDto<'a> {
    pub port: u16,
    pub gcs_ip: &'a str,
    pub system_id: u8,
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    pub heading: f32,
    pub target_heading: f32,
    pub previous_heading: f32,
    pub ground_speed: f64,
    pub vertical_speed: f64,
    pub airspeed: f64,
    pub wind_vel: f64,
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
    pub dist_traveled: f64,
    pub dist_to_home: f64,
    pub wp_dist: f64,
    pub tot: f64,
    pub toh: f64,
    pub gps_hdop: f32,
    pub battery_voltage: f64,
    pub battery_current: f64,
    pub ch3out: u16,
    pub ch9out: u16,
    pub ch10out: u16,
    pub ch11out: u16,
    pub ch12out: u16,
    pub ch3percent: f64,
    pub airborne: bool,
    pub time_in_air: f64,
    pub flying: bool,
    pub auto_time: f64,
    pub throttle_active: bool,
    pub total_throttle_time: u64,
    pub flight_status: i32,
    pub home_location: Option<(f64, f64)>,
    pub waypoints_count: usize,
    pub timestamp: chrono::DateTime<chrono::Local>,
}

impl<'a> From<&'a DroneState> for DroneDto<'a> {
    fn from(state: &'a DroneState) -> Self {
        Self {
            port: state.port,
            gcs_ip: &state.gcs_ip,
            system_id: state.system_id,
            lat: state.lat,
            lon: state.lon,
            alt: state.alt,
            heading: state.heading,
            target_heading: state.target_heading,
            previous_heading: state.previous_heading,
            ground_speed: state.ground_speed,
            vertical_speed: state.vertical_speed,
            airspeed: state.airspeed,
            wind_vel: state.wind_vel,
            roll: state.roll,
            pitch: state.pitch,
            yaw: state.yaw,
            dist_traveled: state.dist_traveled,
            dist_to_home: state.dist_to_home,
            wp_dist: state.wp_dist,
            tot: state.tot,
            toh: state.toh,
            gps_hdop: state.gps_hdop,
            battery_voltage: state.battery_voltage,
            battery_current: state.battery_current,
            ch3out: state.ch3out,
            ch9out: state.ch9out,
            ch10out: state.ch10out,
            ch11out: state.ch11out,
            ch12out: state.ch12out,
            ch3percent: state.ch3percent,
            airborne: state.airborne,
            time_in_air: state.time_in_air,
            flying: state.flying,
            auto_time: state.auto_time,
            throttle_active: state.throttle_active,
            total_throttle_time: state.total_throttle_time,
            flight_status: state.flight_status,
            home_location: state.home_location,
            waypoints_count: state.waypoints_count(),
            timestamp: state.timestamp.with_timezone(&chrono::Local),
        }
    }
}

/// Great-circle distance between two lat/lon pairs in metres, `R = 6371 km`.
pub fn haversine_metres(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;

    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_KM * c * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_matches_known_distance_at_equator() {
        // 0.001 degrees of longitude at the equator ~= 111.32 m (spec.md S2).
        let d = haversine_metres(0.0, 0.0, 0.0, 0.001);
        assert!((d - 111.32).abs() < 0.5, "got {d}");
    }

    #[test]
    fn haversine_zero_for_identical_points() {
        assert_eq!(haversine_metres(47.5, 8.5, 47.5, 8.5), 0.0);
    }

    #[test]
    fn empty_state_has_no_waypoints_and_no_home() {
        let state = DroneState::empty(14551);
        assert_eq!(state.port, 14551);
        assert_eq!(state.waypoints_count(), 0);
        assert!(state.home_location.is_none());
    }

    #[test]
    fn dto_mirrors_waypoints_count_not_vec() {
        let mut state = DroneState::empty(14551);
        state.waypoints.push(Waypoint {
            seq: 0,
            lat: 47.5,
            lon: 8.5,
            alt: 100.0,
        });
        let dto = DroneDto::from(&state);
        assert_eq!(dto.waypoints_count, 1);
    }
}
