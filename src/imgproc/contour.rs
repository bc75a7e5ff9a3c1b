use image::GrayImage;
use nalgebra::{Matrix2, Point2};
use std::collections::VecDeque;

/// Clockwise in image coordinates, starting west.
const DIRECTIONS: [(i32, i32); 8] = [
    (-1, 0),
    (-1, -1),
    (0, -1),
    (1, -1),
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
];

const NEIGHBORS_4: [(i32, i32); 4] = [(-1, 0), (1, 0), (0, -1), (0, 1)];

/// The outer boundary of one connected region, as an ordered list of pixel
/// centers.
#[derive(Clone, Debug, PartialEq)]
pub struct Contour {
    pub points: Vec<Point2<i32>>,
}

impl Contour {
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Area enclosed by the polygon through the boundary pixels.
    pub fn area(&self) -> f64 {
        self.moments().m00
    }

    /// Spatial moments up to second order of the polygon.
    pub fn moments(&self) -> Moments {
        let mut a = [0.0f64; 6];
        let Some(last) = self.points.last() else {
            return Moments::default();
        };

        let (mut xp, mut yp) = (last.x as f64, last.y as f64);
        for p in &self.points {
            let (x, y) = (p.x as f64, p.y as f64);
            let cross = xp * y - x * yp;
            let (xs, ys) = (xp + x, yp + y);

            a[0] += cross;
            a[1] += cross * xs;
            a[2] += cross * ys;
            a[3] += cross * (xp * xs + x * x);
            a[4] += cross * (xp * (ys + yp) + x * (ys + y));
            a[5] += cross * (yp * ys + y * y);
            (xp, yp) = (x, y);
        }

        let sign = if a[0] < 0.0 { -1.0 } else { 1.0 };
        Moments {
            m00: sign * a[0] / 2.0,
            m10: sign * a[1] / 6.0,
            m01: sign * a[2] / 6.0,
            m20: sign * a[3] / 12.0,
            m11: sign * a[4] / 24.0,
            m02: sign * a[5] / 12.0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Moments {
    pub m00: f64,
    pub m10: f64,
    pub m01: f64,
    pub m20: f64,
    pub m11: f64,
    pub m02: f64,
}

impl Moments {
    pub fn centroid(&self) -> Option<Point2<f64>> {
        (self.m00 != 0.0).then(|| Point2::new(self.m10 / self.m00, self.m01 / self.m00))
    }

    /// Second order central moments normalized by area, arranged as a
    /// covariance matrix.
    pub fn normalized_covariance(&self) -> Option<Matrix2<f64>> {
        let c = self.centroid()?;
        let scale = self.m00 * self.m00;
        let nu20 = (self.m20 - c.x * self.m10) / scale;
        let nu11 = (self.m11 - c.x * self.m01) / scale;
        let nu02 = (self.m02 - c.y * self.m01) / scale;
        Some(Matrix2::new(nu20, nu11, nu11, nu02))
    }
}

/// Boundaries of every region of set pixels that does not sit inside a hole
/// of another region.
///
/// Regions are 8-connected. Background is 4-connected so diagonal gaps do not
/// leak out of a hole.
pub fn external_contours(mask: &GrayImage) -> Vec<Contour> {
    let (width, height) = mask.dimensions();
    let (w, h) = (width as i32, height as i32);
    let index = |x: i32, y: i32| (y * w + x) as usize;
    let set = |x: i32, y: i32| mask.get_pixel(x as u32, y as u32).0[0] > 0;
    let inside = |x: i32, y: i32| x >= 0 && y >= 0 && x < w && y < h;

    // Background reachable from the image border.
    let mut outer = vec![false; (width * height) as usize];
    let mut queue = VecDeque::new();
    for x in 0..w {
        for y in [0, h - 1] {
            queue.push_back((x, y));
        }
    }
    for y in 0..h {
        for x in [0, w - 1] {
            queue.push_back((x, y));
        }
    }
    while let Some((x, y)) = queue.pop_front() {
        if !inside(x, y) || set(x, y) || outer[index(x, y)] {
            continue;
        }
        outer[index(x, y)] = true;
        NEIGHBORS_4
            .iter()
            .for_each(|(dx, dy)| queue.push_back((x + dx, y + dy)));
    }

    let mut labels = vec![0u32; (width * height) as usize];
    let mut next_label = 0;
    let mut contours = Vec::new();
    for y in 0..h {
        for x in 0..w {
            if !set(x, y) || labels[index(x, y)] != 0 {
                continue;
            }

            next_label += 1;
            let mut queue = VecDeque::from([(x, y)]);
            labels[index(x, y)] = next_label;
            while let Some((cx, cy)) = queue.pop_front() {
                for (dx, dy) in DIRECTIONS {
                    let (nx, ny) = (cx + dx, cy + dy);
                    if inside(nx, ny) && set(nx, ny) && labels[index(nx, ny)] == 0 {
                        labels[index(nx, ny)] = next_label;
                        queue.push_back((nx, ny));
                    }
                }
            }

            // (x, y) is the region's first pixel in raster order, so the pixel
            // above it lies outside the region and outside its holes.
            let external = y == 0 || outer[index(x, y - 1)];
            if external {
                let label = next_label;
                let member = |px: i32, py: i32| inside(px, py) && labels[index(px, py)] == label;
                contours.push(trace(Point2::new(x, y), 4 * labels.len() + 8, member));
            }
        }
    }

    contours
}

fn direction_of(delta: (i32, i32)) -> usize {
    DIRECTIONS.iter().position(|&d| d == delta).unwrap_or(0)
}

/// Moore neighbor boundary following from the region's first raster pixel.
fn trace<F>(start: Point2<i32>, limit: usize, member: F) -> Contour
where
    F: Fn(i32, i32) -> bool,
{
    let mut points = vec![start];
    let mut current = start;
    // Entered from the west, which is outside the region.
    let mut backtrack = 0;

    // Each boundary pixel is entered from at most four sides.
    for _ in 0..limit {
        let next = (1..=8).map(|k| (backtrack + k) % 8).find_map(|d| {
            let (dx, dy) = DIRECTIONS[d];
            member(current.x + dx, current.y + dy).then_some(d)
        });
        let Some(d) = next else {
            break;
        };

        let (dx, dy) = DIRECTIONS[d];
        let candidate = Point2::new(current.x + dx, current.y + dy);
        if current == start && points.len() > 1 && Some(&candidate) == points.get(1) {
            points.pop();
            break;
        }

        // The last background pixel checked becomes the new backtrack.
        let (bx, by) = DIRECTIONS[(d + 7) % 8];
        let back = (current.x + bx - candidate.x, current.y + by - candidate.y);
        backtrack = direction_of(back);
        points.push(candidate);
        current = candidate;
    }

    Contour { points }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imgproc::FOREGROUND;
    use approx::assert_relative_eq;
    use image::Luma;

    fn rect(mask: &mut GrayImage, x0: u32, y0: u32, w: u32, h: u32) {
        for y in y0..y0 + h {
            for x in x0..x0 + w {
                mask.put_pixel(x, y, Luma([FOREGROUND]));
            }
        }
    }

    #[test]
    fn traces_rectangle_clockwise() {
        let mut mask = GrayImage::new(10, 10);
        rect(&mut mask, 2, 3, 3, 2);
        let contours = external_contours(&mask);
        assert_eq!(contours.len(), 1);

        let expected: Vec<_> = [(2, 3), (3, 3), (4, 3), (4, 4), (3, 4), (2, 4)]
            .into_iter()
            .map(|(x, y)| Point2::new(x, y))
            .collect();
        assert_eq!(contours[0].points, expected);
        assert_relative_eq!(contours[0].area(), 2.0);
    }

    #[test]
    fn single_pixel_has_no_area() {
        let mut mask = GrayImage::new(4, 4);
        rect(&mut mask, 1, 1, 1, 1);
        let contours = external_contours(&mask);
        assert_eq!(contours[0].points, vec![Point2::new(1, 1)]);
        assert_relative_eq!(contours[0].area(), 0.0);
    }

    #[test]
    fn nested_region_is_not_external() {
        let mut mask = GrayImage::new(12, 12);
        rect(&mut mask, 1, 1, 10, 10);
        // Carve a hole and put an island in it.
        for y in 3..9 {
            for x in 3..9 {
                mask.put_pixel(x, y, Luma([0]));
            }
        }
        rect(&mut mask, 5, 5, 2, 2);

        let contours = external_contours(&mask);
        assert_eq!(contours.len(), 1);
        assert_relative_eq!(contours[0].area(), 81.0);
    }

    #[test]
    fn separate_regions_each_get_a_contour() {
        let mut mask = GrayImage::new(20, 10);
        rect(&mut mask, 1, 1, 4, 4);
        rect(&mut mask, 10, 2, 6, 5);
        rect(&mut mask, 0, 8, 3, 2);
        assert_eq!(external_contours(&mask).len(), 3);
    }

    #[test]
    fn rectangle_moments() {
        let mut mask = GrayImage::new(30, 30);
        rect(&mut mask, 5, 5, 11, 21);
        let contour = &external_contours(&mask)[0];
        let moments = contour.moments();

        assert_relative_eq!(moments.m00, 200.0);
        let c = moments.centroid().unwrap();
        assert_relative_eq!(c, Point2::new(10.0, 15.0), epsilon = 1e-9);

        let cov = moments.normalized_covariance().unwrap();
        assert!(cov[(1, 1)] > cov[(0, 0)]);
        assert_relative_eq!(cov[(0, 1)], 0.0, epsilon = 1e-12);
    }
}
