//! Global thresholding with polarity and morphological cleanup.

use image::{GrayImage, Luma};
use imageproc::distance_transform::Norm;

use crate::config::Polarity;

/// Where a grayscale image was cut in two.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Cut {
    /// Otsu level: values at or below it form the dark class.
    Otsu(u8),
    /// Mean of a degenerate (single-valued) image: values strictly below it
    /// form the dark class.
    Mean(f64),
}

impl Cut {
    /// Otsu's level, or the mean when every pixel has the same value.
    pub fn of(gray: &GrayImage) -> Self {
        let mut values = gray.pixels().map(|p| p[0]);
        let Some(first) = values.next() else {
            return Self::Mean(0.0);
        };
        if values.all(|v| v == first) {
            return Self::Mean(first as f64);
        }
        Self::Otsu(imageproc::contrast::otsu_level(gray))
    }

    pub fn is_dark(&self, value: u8) -> bool {
        match *self {
            Self::Otsu(level) => value <= level,
            Self::Mean(mean) => (value as f64) < mean,
        }
    }

    pub fn is_light(&self, value: u8) -> bool {
        match *self {
            Self::Otsu(level) => value > level,
            Self::Mean(mean) => (value as f64) > mean,
        }
    }
}

/// Binarise `gray` (foreground = 255) at its own threshold.
pub fn binarize(gray: &GrayImage, polarity: Polarity) -> GrayImage {
    let cut = Cut::of(gray);
    let dark_is_foreground = match polarity {
        Polarity::Dark => true,
        Polarity::Light => false,
        Polarity::Auto => {
            let dark = gray.pixels().filter(|p| cut.is_dark(p[0])).count();
            let light = gray.pixels().filter(|p| cut.is_light(p[0])).count();
            dark <= light
        }
    };

    let mut out = GrayImage::new(gray.width(), gray.height());
    for (x, y, pixel) in gray.enumerate_pixels() {
        let value = pixel[0];
        let foreground = if dark_is_foreground {
            cut.is_dark(value)
        } else {
            cut.is_light(value)
        };
        if foreground {
            out.put_pixel(x, y, Luma([255]));
        }
    }
    out
}

/// Opening with a square of side `open_size`, then closing with a square of
/// side `close_size`.
pub fn open_close(mask: &GrayImage, open_size: u32, close_size: u32) -> GrayImage {
    let opened = imageproc::morphology::open(mask, Norm::LInf, radius(open_size));
    imageproc::morphology::close(&opened, Norm::LInf, radius(close_size))
}

/// Chebyshev radius of a square structuring element of the given side.
pub(crate) fn radius(size: u32) -> u8 {
    (size / 2).min(u8::MAX as u32) as u8
}

/// Keep pixels that are foreground in both masks.
pub fn intersect(mask: &mut GrayImage, keep: &GrayImage) {
    for (x, y, pixel) in mask.enumerate_pixels_mut() {
        if keep.get_pixel(x, y)[0] == 0 {
            *pixel = Luma([0]);
        }
    }
}

pub fn foreground_count(mask: &GrayImage) -> u64 {
    mask.pixels().filter(|p| p[0] > 0).count() as u64
}
