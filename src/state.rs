use crate::error::LookupError;
use chrono::{DateTime, TimeDelta, Utc};
use nalgebra::{UnitQuaternion, Vector3};
use parking_lot::{Condvar, Mutex};
use std::{collections::VecDeque, time::Duration};
use uom::si::{
    f64::{Angle, AngularVelocity, Length},
    angle::radian,
    angular_velocity::radian_per_second,
    length::meter,
};

/// The vehicle's pose at one instant.
///
/// The world frame is east, north, up. `attitude` rotates vectors from the
/// body frame into the world frame. The body frame has the camera looking
/// along -Z with image right along +X and image up along +Y.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VehicleState {
    pub stamp: DateTime<Utc>,
    /// World position in meters.
    pub position: Vector3<f64>,
    pub attitude: UnitQuaternion<f64>,
    /// Height of the camera above the floor.
    pub altitude: Length,
    /// Body rates in radians per second.
    pub angular_velocity: Vector3<f64>,
}

impl VehicleState {
    /// A level, non-rotating vehicle at `position` with heading `yaw`.
    pub fn level(stamp: DateTime<Utc>, position: Vector3<f64>, yaw: Angle) -> Self {
        Self {
            stamp,
            position,
            attitude: UnitQuaternion::from_euler_angles(0.0, 0.0, yaw.get::<radian>()),
            altitude: Length::new::<meter>(position.z),
            angular_velocity: Vector3::zeros(),
        }
    }

    pub fn yaw(&self) -> Angle {
        let (_, _, yaw) = self.attitude.euler_angles();
        Angle::new::<radian>(yaw)
    }

    /// Angle between the camera's optical axis and world down.
    pub fn tilt(&self) -> Angle {
        let axis = self.attitude * -Vector3::z();
        Angle::new::<radian>((-axis.z).clamp(-1.0, 1.0).acos())
    }

    pub fn rotation_rate(&self) -> AngularVelocity {
        AngularVelocity::new::<radian_per_second>(self.angular_velocity.norm())
    }

    /// Absolute difference between this state's stamp and `stamp`.
    pub fn stamp_error(&self, stamp: DateTime<Utc>) -> TimeDelta {
        (self.stamp - stamp).abs()
    }
}

/// A time indexed source of vehicle state.
///
/// Implementations must return within roughly `timeout`.
pub trait PoseSource: Send + Sync {
    fn lookup(&self, stamp: DateTime<Utc>, timeout: Duration) -> Result<VehicleState, LookupError>;
}

impl<P: PoseSource + ?Sized> PoseSource for std::sync::Arc<P> {
    fn lookup(&self, stamp: DateTime<Utc>, timeout: Duration) -> Result<VehicleState, LookupError> {
        (**self).lookup(stamp, timeout)
    }
}

/// A bounded history of vehicle states that answers lookups with the sample
/// nearest the requested stamp.
///
/// A lookup for a stamp newer than every buffered sample blocks until a sample
/// at or after that stamp arrives or the timeout elapses. Samples are never
/// extrapolated.
pub struct PoseBuffer {
    capacity: usize,
    states: Mutex<VecDeque<VehicleState>>,
    arrived: Condvar,
}

impl PoseBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            states: Mutex::new(VecDeque::with_capacity(capacity)),
            arrived: Condvar::new(),
        }
    }

    /// Record a state. Out of order samples are inserted in stamp order.
    pub fn record(&self, state: VehicleState) {
        let mut states = self.states.lock();
        let index = states.partition_point(|s| s.stamp <= state.stamp);
        states.insert(index, state);
        while states.len() > self.capacity {
            states.pop_front();
        }
        self.arrived.notify_all();
    }

    fn nearest(states: &VecDeque<VehicleState>, stamp: DateTime<Utc>) -> Option<VehicleState> {
        let index = states.partition_point(|s| s.stamp < stamp);
        let after = states.get(index);
        let before = index.checked_sub(1).and_then(|i| states.get(i));
        match (before, after) {
            (Some(b), Some(a)) => match b.stamp_error(stamp) <= a.stamp_error(stamp) {
                true => Some(*b),
                false => Some(*a),
            },
            (Some(s), None) | (None, Some(s)) => Some(*s),
            (None, None) => None,
        }
    }
}

impl PoseSource for PoseBuffer {
    fn lookup(&self, stamp: DateTime<Utc>, timeout: Duration) -> Result<VehicleState, LookupError> {
        let mut states = self.states.lock();
        if states.front().is_some_and(|oldest| stamp < oldest.stamp) && states.len() == self.capacity {
            return Err(LookupError::Expired);
        }

        let deadline = std::time::Instant::now() + timeout;
        while states.back().is_none_or(|newest| newest.stamp < stamp) {
            if self.arrived.wait_until(&mut states, deadline).timed_out() {
                break;
            }
        }

        match Self::nearest(&states, stamp) {
            Some(state) => Ok(state),
            None if timeout.is_zero() => Err(LookupError::Empty),
            None => Err(LookupError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::sync::Arc;
    use uom::si::angle::degree;

    fn stamp(ms: i64) -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + TimeDelta::milliseconds(ms)
    }

    fn state(ms: i64, x: f64) -> VehicleState {
        VehicleState::level(stamp(ms), Vector3::new(x, 0.0, 1.5), Angle::new::<degree>(0.0))
    }

    #[test]
    fn level_state_has_no_tilt() {
        let state = state(0, 0.0);
        assert_relative_eq!(state.tilt().get::<degree>(), 0.0, epsilon = 1e-9);
        assert_relative_eq!(state.altitude.get::<meter>(), 1.5);
    }

    #[test]
    fn rolled_state_reports_tilt() {
        let mut state = state(0, 0.0);
        state.attitude = UnitQuaternion::from_euler_angles(10f64.to_radians(), 0.0, 0.0);
        assert_relative_eq!(state.tilt().get::<degree>(), 10.0, epsilon = 1e-9);
    }

    #[test]
    fn lookup_returns_nearest() {
        let buffer = PoseBuffer::new(8);
        buffer.record(state(0, 0.0));
        buffer.record(state(20, 2.0));
        buffer.record(state(10, 1.0));

        let found = buffer.lookup(stamp(12), Duration::ZERO).unwrap();
        assert_relative_eq!(found.position.x, 1.0);
        let found = buffer.lookup(stamp(17), Duration::ZERO).unwrap();
        assert_relative_eq!(found.position.x, 2.0);
    }

    #[test]
    fn empty_lookup_fails() {
        let buffer = PoseBuffer::new(4);
        assert_eq!(buffer.lookup(stamp(0), Duration::ZERO), Err(LookupError::Empty));
        assert_eq!(
            buffer.lookup(stamp(0), Duration::from_millis(5)),
            Err(LookupError::Timeout)
        );
    }

    #[test]
    fn expired_lookup_fails() {
        let buffer = PoseBuffer::new(2);
        buffer.record(state(10, 0.0));
        buffer.record(state(20, 0.0));
        assert_eq!(buffer.lookup(stamp(0), Duration::ZERO), Err(LookupError::Expired));
    }

    #[test]
    fn lookup_waits_for_newer_state() {
        let buffer = Arc::new(PoseBuffer::new(4));
        buffer.record(state(0, 0.0));

        let writer = Arc::clone(&buffer);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            writer.record(state(30, 3.0));
        });

        let found = buffer.lookup(stamp(30), Duration::from_secs(2)).unwrap();
        handle.join().unwrap();
        assert_relative_eq!(found.position.x, 3.0);
    }
}
