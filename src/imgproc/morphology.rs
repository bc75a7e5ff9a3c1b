use image::{GrayImage, Luma};

/// Kernel extent around the anchor. Even sizes extend one further before the
/// anchor than after it.
fn extent(size: u32) -> (i64, i64) {
    let before = (size / 2) as i64;
    (before, size as i64 - 1 - before)
}

/// Reduce every row then every column with `pick` over a square window.
/// Pixels outside the image never take part.
fn square_filter<F>(mask: &GrayImage, size: u32, pick: F) -> GrayImage
where
    F: Fn(u8, u8) -> u8 + Copy,
{
    let (width, height) = mask.dimensions();
    let (before, after) = extent(size.max(1));

    let pass = |source: &GrayImage, horizontal: bool| {
        GrayImage::from_fn(width, height, |x, y| {
            let (center, limit) = match horizontal {
                true => (x as i64, width as i64),
                false => (y as i64, height as i64),
            };
            let lo = (center - before).max(0);
            let hi = (center + after).min(limit - 1);
            let value = (lo..=hi)
                .map(|i| match horizontal {
                    true => source.get_pixel(i as u32, y).0[0],
                    false => source.get_pixel(x, i as u32).0[0],
                })
                .reduce(pick)
                .unwrap_or(0);
            Luma([value])
        })
    };

    pass(&pass(mask, true), false)
}

pub fn erode(mask: &GrayImage, size: u32) -> GrayImage {
    square_filter(mask, size, u8::min)
}

pub fn dilate(mask: &GrayImage, size: u32) -> GrayImage {
    square_filter(mask, size, u8::max)
}

/// Morphological opening with a `size` square kernel.
///
/// Erodes `iterations` times then dilates as many times, which removes
/// specks smaller than the effective kernel while keeping larger regions.
pub fn open(mask: &GrayImage, size: u32, iterations: u32) -> GrayImage {
    let eroded = (0..iterations).fold(mask.clone(), |m, _| erode(&m, size));
    (0..iterations).fold(eroded, |m, _| dilate(&m, size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imgproc::FOREGROUND;

    fn parse(rows: &[&str]) -> GrayImage {
        let width = rows[0].len() as u32;
        GrayImage::from_fn(width, rows.len() as u32, |x, y| {
            match rows[y as usize].as_bytes()[x as usize] {
                b'#' => Luma([FOREGROUND]),
                _ => Luma([0]),
            }
        })
    }

    fn render(mask: &GrayImage) -> String {
        mask.rows()
            .map(|row| {
                row.map(|px| if px.0[0] > 0 { '#' } else { '.' })
                    .collect::<String>()
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn opening_removes_specks() {
        let mask = parse(&[
            "..........",
            ".####...#.",
            ".####.....",
            ".####..##.",
            ".####.....",
            "......#...",
        ]);

        insta::assert_snapshot!(render(&open(&mask, 3, 1)), @r"
        ..........
        .####.....
        .####.....
        .####.....
        .####.....
        ..........
        ");
    }

    #[test]
    fn erosion_ignores_outside_pixels() {
        let mask = GrayImage::from_pixel(3, 3, Luma([FOREGROUND]));
        assert!(erode(&mask, 3).pixels().all(|px| px.0[0] == FOREGROUND));
    }

    #[test]
    fn dilation_grows_by_kernel_radius() {
        let mut mask = GrayImage::new(5, 5);
        mask.put_pixel(2, 2, Luma([FOREGROUND]));
        let grown = dilate(&mask, 3);
        assert_eq!(grown.pixels().filter(|px| px.0[0] > 0).count(), 9);
    }

    #[test]
    fn zero_iterations_is_identity() {
        let mask = parse(&["#..", ".#.", "..#"]);
        assert_eq!(open(&mask, 3, 0), mask);
    }
}
