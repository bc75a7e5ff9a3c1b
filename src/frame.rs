use chrono::{DateTime, Utc};
use image::{GrayImage, RgbImage};
use parking_lot::Mutex;
use std::collections::VecDeque;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FrameError {
    #[error("expected {expected} bytes for a {width}x{height} {encoding:?} frame but got: {actual}")]
    BufferSize {
        width: u32,
        height: u32,
        encoding: Encoding,
        expected: usize,
        actual: usize,
    },
}

/// Pixel layout of a raw camera buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
    Rgb8,
    Bgr8,
    Mono8,
}

impl Encoding {
    fn channels(&self) -> usize {
        match self {
            Encoding::Rgb8 | Encoding::Bgr8 => 3,
            Encoding::Mono8 => 1,
        }
    }
}

/// A single camera capture.
///
/// The image is always held as RGB regardless of the encoding it arrived in.
/// `encoding` records the nominal layout of the source buffer.
#[derive(Clone, Debug)]
pub struct Frame {
    image: RgbImage,
    stamp: DateTime<Utc>,
    encoding: Encoding,
}

impl Frame {
    pub fn new(image: RgbImage, stamp: DateTime<Utc>) -> Self {
        Self {
            image,
            stamp,
            encoding: Encoding::Rgb8,
        }
    }

    /// Create a frame from a row major buffer of bytes.
    ///
    /// ```text
    /// +--------+--------+-----+--------+
    /// |      0 |      1 | ... |    w-1 |
    /// +--------+--------+-----+--------+
    /// |      w |    w+1 | ... |   2w-1 |
    /// +--------+--------+-----+--------+
    /// ```
    ///
    /// Each cell holds one byte for `Mono8` and three bytes for `Rgb8` and
    /// `Bgr8`.
    pub fn from_raw(
        width: u32,
        height: u32,
        bytes: &[u8],
        encoding: Encoding,
        stamp: DateTime<Utc>,
    ) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize * encoding.channels();
        if bytes.len() != expected {
            return Err(FrameError::BufferSize {
                width,
                height,
                encoding,
                expected,
                actual: bytes.len(),
            });
        }

        let rgb: Vec<u8> = match encoding {
            Encoding::Rgb8 => bytes.to_vec(),
            Encoding::Bgr8 => bytes
                .chunks_exact(3)
                .flat_map(|px| [px[2], px[1], px[0]])
                .collect(),
            Encoding::Mono8 => bytes.iter().flat_map(|&v| [v, v, v]).collect(),
        };

        // Length was checked above.
        let image = RgbImage::from_raw(width, height, rgb).ok_or(FrameError::BufferSize {
            width,
            height,
            encoding,
            expected,
            actual: bytes.len(),
        })?;

        Ok(Self {
            image,
            stamp,
            encoding,
        })
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn stamp(&self) -> DateTime<Utc> {
        self.stamp
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    pub fn to_gray(&self) -> GrayImage {
        image::imageops::grayscale(&self.image)
    }
}

/// Bounded intake queue between frame acquisition and the estimators.
///
/// Acquisition never blocks. When a push overflows the queue every buffered
/// frame except the newest is discarded.
pub struct FrameQueue {
    capacity: usize,
    frames: Mutex<VecDeque<Frame>>,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            frames: Mutex::new(VecDeque::with_capacity(capacity + 1)),
        }
    }

    /// Enqueue a frame. Returns the number of frames dropped to make room.
    pub fn push(&self, frame: Frame) -> usize {
        let mut frames = self.frames.lock();
        frames.push_back(frame);
        if frames.len() <= self.capacity {
            return 0;
        }

        let dropped = frames.len() - 1;
        frames.drain(..dropped);
        warn!(dropped, "frame queue overflowed, keeping only the newest frame");
        dropped
    }

    /// Dequeue the oldest admitted frame.
    pub fn pop(&self) -> Option<Frame> {
        self.frames.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
