#![allow(dead_code)]

use arena_vision::{
    error::LookupError,
    frame::Frame,
    state::{PoseSource, VehicleState},
};
use chrono::{DateTime, TimeDelta, Utc};
use image::{Rgb, RgbImage};
use nalgebra::{UnitQuaternion, Vector2, Vector3};
use std::time::Duration;
use uom::si::{
    angle::{degree, radian},
    f64::{Angle, Length},
    length::meter,
};

pub const WIDTH: u32 = 320;
pub const HEIGHT: u32 = 240;

pub const FLOOR: Rgb<u8> = Rgb([40, 40, 40]);
pub const PAINT: Rgb<u8> = Rgb([220, 220, 220]);

pub fn stamp(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH + TimeDelta::milliseconds(ms)
}

pub fn state(x: f64, y: f64, altitude: f64, yaw_deg: f64) -> VehicleState {
    VehicleState {
        stamp: stamp(0),
        position: Vector3::new(x, y, altitude),
        attitude: UnitQuaternion::from_euler_angles(0.0, 0.0, yaw_deg.to_radians()),
        altitude: Length::new::<meter>(altitude),
        angular_velocity: Vector3::zeros(),
    }
}

/// Answers every lookup with a copy of one state stamped as requested.
#[derive(Clone)]
pub struct Steady(pub VehicleState);

impl PoseSource for Steady {
    fn lookup(&self, stamp: DateTime<Utc>, _: Duration) -> Result<VehicleState, LookupError> {
        Ok(VehicleState { stamp, ..self.0 })
    }
}

/// Render what a level camera with a horizontal angle of view of `fov_deg`
/// sees of a floor colored by `floor(world_x, world_y)`.
pub fn render<F>(camera: &VehicleState, fov_deg: f64, floor: F) -> RgbImage
where
    F: Fn(f64, f64) -> Rgb<u8>,
{
    let altitude = camera.altitude.get::<meter>();
    let fov = Angle::new::<degree>(fov_deg);
    let half_width = altitude * (fov.get::<radian>() / 2.0).tan();
    let ppm = WIDTH as f64 / (2.0 * half_width);
    let (cx, cy) = (WIDTH as f64 / 2.0, HEIGHT as f64 / 2.0);

    RgbImage::from_fn(WIDTH, HEIGHT, |u, v| {
        let body = Vector3::new((u as f64 - cx) / ppm, (cy - v as f64) / ppm, 0.0);
        let world = camera.attitude * body;
        floor(camera.position.x + world.x, camera.position.y + world.y)
    })
}

/// Lines of the given thickness at every whole meter in both axes.
pub fn grid_floor(thickness: f64) -> impl Fn(f64, f64) -> Rgb<u8> {
    move |x, y| {
        let near = |v: f64| (v - v.round()).abs() <= thickness / 2.0;
        match near(x) || near(y) {
            true => PAINT,
            false => FLOOR,
        }
    }
}

/// Square cells of pseudo random brightness.
pub fn textured_floor(cell: f64) -> impl Fn(f64, f64) -> Rgb<u8> {
    move |x, y| {
        let (i, j) = ((x / cell).floor() as i64, (y / cell).floor() as i64);
        let hash = i.wrapping_mul(73_856_093) ^ j.wrapping_mul(19_349_663);
        let level = [30, 90, 160, 230][hash.rem_euclid(4) as usize];
        Rgb([level, level, level])
    }
}

pub fn frame(image: RgbImage, ms: i64) -> Frame {
    Frame::new(image, stamp(ms))
}

pub fn distance(a: Vector2<f64>, b: Vector2<f64>) -> f64 {
    (a - b).norm()
}
