use image::GrayImage;
use rayon::prelude::*;
use std::{f64::consts::PI, ops::RangeInclusive};

/// A line in normal form, `x cos(theta) + y sin(theta) = rho`, in pixel
/// coordinates with the origin at the top left corner.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HoughLine {
    pub rho: f64,
    /// In [0, pi).
    pub theta: f64,
    pub votes: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct HoughParams {
    /// Distance resolution in pixels.
    pub rho_resolution: f64,
    /// Angle resolution in radians.
    pub theta_resolution: f64,
    /// Cells need more votes than this to become a line.
    pub threshold: u32,
}

/// Fixed resolution histogram over a closed interval.
struct Accumulator {
    resolution: f64,
    range: RangeInclusive<f64>,
    buffer: Vec<u32>,
}

impl Accumulator {
    fn new(resolution: f64, range: RangeInclusive<f64>) -> Self {
        let len = ((range.end() - range.start()) / resolution).floor() as usize + 1;
        let buffer = vec![0; len];

        Self {
            resolution,
            range,
            buffer,
        }
    }

    fn value_to_index(&self, value: f64) -> usize {
        ((value - self.range.start()) / self.resolution).floor() as usize
    }

    fn index_to_value(&self, index: usize) -> f64 {
        index as f64 * self.resolution + self.range.start()
    }

    /// Center of the bin at `index`.
    fn bin_center(&self, index: usize) -> f64 {
        self.index_to_value(index) + self.resolution / 2.0
    }

    fn vote(&mut self, value: f64) {
        let index = self.value_to_index(value);
        if let Some(count) = self.buffer.get_mut(index) {
            *count += 1;
        }
    }

    fn get(&self, index: isize) -> u32 {
        match usize::try_from(index) {
            Ok(index) => self.buffer.get(index).copied().unwrap_or(0),
            Err(_) => 0,
        }
    }

    fn len(&self) -> usize {
        self.buffer.len()
    }
}

/// Standard Hough transform over the set pixels of a binary edge image.
///
/// Every angle bin is voted in parallel. Only cells that are local maxima
/// among their four neighbors are reported, strongest first.
pub fn hough_lines(edges: &GrayImage, params: &HoughParams) -> Vec<HoughLine> {
    let (width, height) = edges.dimensions();
    let points: Vec<(f64, f64)> = edges
        .enumerate_pixels()
        .filter(|(_, _, px)| px.0[0] > 0)
        .map(|(x, y, _)| (x as f64, y as f64))
        .collect();

    let theta_bins = ((PI / params.theta_resolution).round() as usize).max(1);
    let theta_step = PI / theta_bins as f64;
    let extent = ((width as f64).hypot(height as f64) / params.rho_resolution).ceil()
        * params.rho_resolution;
    let half = params.rho_resolution / 2.0;

    // Bins are centered on multiples of the resolution.
    let rows: Vec<Accumulator> = (0..theta_bins)
        .into_par_iter()
        .map(|t| {
            let (sin, cos) = (t as f64 * theta_step).sin_cos();
            let mut acc = Accumulator::new(params.rho_resolution, (-extent - half)..=(extent + half));
            points
                .iter()
                .for_each(|(x, y)| acc.vote(x * cos + y * sin));
            acc
        })
        .collect();

    let mut lines: Vec<HoughLine> = rows
        .par_iter()
        .enumerate()
        .flat_map_iter(|(t, row)| {
            let prev = t.checked_sub(1).map(|i| &rows[i]);
            let next = rows.get(t + 1);
            (0..row.len()).filter_map(move |r| {
                let votes = row.get(r as isize);
                let peak = votes > params.threshold
                    && votes > row.get(r as isize - 1)
                    && votes >= row.get(r as isize + 1)
                    && votes > prev.map_or(0, |p| p.get(r as isize))
                    && votes >= next.map_or(0, |n| n.get(r as isize));
                peak.then(|| HoughLine {
                    rho: row.bin_center(r),
                    theta: t as f64 * theta_step,
                    votes,
                })
            })
        })
        .collect();

    lines.sort_by(|a, b| b.votes.cmp(&a.votes));
    lines
}
