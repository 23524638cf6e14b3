//! Dense 4-axis tensor ("blob") with row-major strided indexing.

use anyhow::{bail, Result};
use rand::Rng;

/// Dense buffer over the axes (numbers, channels, height, width).
///
/// The flat storage always holds exactly `numbers * channels * height * width`
/// elements; `index_of` is the single source of truth for the layout. Blobs
/// are value-like and never resize after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Blob {
    numbers: usize,
    channels: usize,
    height: usize,
    width: usize,
    data: Vec<f32>,
}

impl Blob {
    /// Allocates a zero-initialized blob of the given dimensions.
    pub fn new(numbers: usize, channels: usize, height: usize, width: usize) -> Self {
        let len = numbers * channels * height * width;
        Blob {
            numbers,
            channels,
            height,
            width,
            data: vec![0.0; len],
        }
    }

    /// Wraps raw values, validating the length against the dimensions.
    pub fn from_vec(
        numbers: usize,
        channels: usize,
        height: usize,
        width: usize,
        data: Vec<f32>,
    ) -> Result<Self> {
        let expected = numbers * channels * height * width;
        if data.len() != expected {
            bail!(
                "blob data length ({}) does not match dims ({},{},{},{})",
                data.len(),
                numbers,
                channels,
                height,
                width
            );
        }
        Ok(Blob {
            numbers,
            channels,
            height,
            width,
            data,
        })
    }

    pub fn numbers(&self) -> usize {
        self.numbers
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn dims(&self) -> [usize; 4] {
        [self.numbers, self.channels, self.height, self.width]
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of elements in one sample row (channels * height * width).
    pub fn sample_len(&self) -> usize {
        self.channels * self.height * self.width
    }

    /// Flat offset of element `(n, c, h, w)`.
    ///
    /// Bounds are the caller's responsibility; debug builds assert them,
    /// release builds leave the hot path unchecked.
    #[inline]
    pub fn index_of(&self, n: usize, c: usize, h: usize, w: usize) -> usize {
        debug_assert!(n < self.numbers, "sample index {} out of {}", n, self.numbers);
        debug_assert!(c < self.channels, "channel index {} out of {}", c, self.channels);
        debug_assert!(h < self.height, "row index {} out of {}", h, self.height);
        debug_assert!(w < self.width, "column index {} out of {}", w, self.width);
        ((n * self.channels + c) * self.height + h) * self.width + w
    }

    #[inline]
    pub fn get(&self, n: usize, c: usize, h: usize, w: usize) -> f32 {
        self.data[self.index_of(n, c, h, w)]
    }

    #[inline]
    pub fn set(&mut self, n: usize, c: usize, h: usize, w: usize, value: f32) {
        let idx = self.index_of(n, c, h, w);
        self.data[idx] = value;
    }

    /// Overwrites every element with `value`.
    pub fn fill(&mut self, value: f32) {
        self.data.fill(value);
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Fills the blob with samples from `N(0, std^2)` via the Box-Muller
    /// transform.
    pub fn fill_gaussian(&mut self, std: f32, rng: &mut impl Rng) {
        let mut i = 0;
        while i < self.data.len() {
            let u1: f32 = rng.gen::<f32>().max(f32::MIN_POSITIVE);
            let u2: f32 = rng.gen::<f32>();
            let r = (-2.0 * u1.ln()).sqrt();
            let theta = 2.0 * std::f32::consts::PI * u2;
            self.data[i] = r * theta.cos() * std;
            i += 1;
            if i < self.data.len() {
                self.data[i] = r * theta.sin() * std;
                i += 1;
            }
        }
    }

    /// Returns a zeroed blob with the same dimensions as `self`.
    pub fn zeros_like(&self) -> Blob {
        Blob::new(self.numbers, self.channels, self.height, self.width)
    }
}
