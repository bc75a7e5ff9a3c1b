use crate::{
    config::HsvRange,
    imgproc::{color::hsv_mask, morphology},
};
use image::{GrayImage, RgbImage};

/// Where the mask stages of blob detection run.
///
/// Device resident images are opaque to the caller. Anything that needs pixel
/// access on the host has to go through [`ImageBackend::materialize`], which
/// is the synchronization point with any queued device work.
pub trait ImageBackend: Send + Sync {
    type Image: Send;
    type Mask: Send;

    fn upload(&self, image: &RgbImage) -> Self::Image;

    /// Pixels whose HSV value falls in any of `ranges`.
    fn hsv_mask(&self, image: &Self::Image, ranges: &[HsvRange]) -> Self::Mask;

    fn open(&self, mask: &Self::Mask, size: u32, iterations: u32) -> Self::Mask;

    fn materialize(&self, mask: &Self::Mask) -> GrayImage;
}

/// Runs every stage on the calling thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct CpuBackend;

impl ImageBackend for CpuBackend {
    type Image = RgbImage;
    type Mask = GrayImage;

    fn upload(&self, image: &RgbImage) -> Self::Image {
        image.clone()
    }

    fn hsv_mask(&self, image: &Self::Image, ranges: &[HsvRange]) -> Self::Mask {
        hsv_mask(image, |hsv| ranges.iter().any(|r| r.contains(hsv)))
    }

    fn open(&self, mask: &Self::Mask, size: u32, iterations: u32) -> Self::Mask {
        morphology::open(mask, size, iterations)
    }

    fn materialize(&self, mask: &Self::Mask) -> GrayImage {
        mask.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn cpu_mask_unions_ranges() {
        let mut image = RgbImage::new(3, 1);
        image.put_pixel(0, 0, Rgb([0, 200, 0]));
        image.put_pixel(1, 0, Rgb([200, 0, 0]));
        image.put_pixel(2, 0, Rgb([0, 0, 200]));

        let ranges = [
            HsvRange::new((30, 90), (100, 255), (20, 255)),
            HsvRange::new((0, 8), (100, 255), (20, 255)),
        ];
        let backend = CpuBackend;
        let mask = backend.hsv_mask(&backend.upload(&image), &ranges);
        assert_eq!(backend.materialize(&mask).as_raw(), &vec![255, 255, 0]);
    }
}
