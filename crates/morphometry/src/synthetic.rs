//! Deterministic synthetic photographs: a light surface, printed markers
//! and dark elliptical beans.

use image::{DynamicImage, GrayImage, Luma};

use crate::algorithms::dictionary::{ARUCO_4X4_CODES, cell};

const INK: u8 = 20;
const PAPER: u8 = 245;

/// A marker placed axis-aligned with its top-left pixel at `(x, y)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkerSpec {
    pub code: u64,
    pub bits: u32,
    pub x: u32,
    pub y: u32,
    /// Side in pixels, border included.
    pub side: u32,
}

impl MarkerSpec {
    /// A marker from the built-in 4x4 dictionary. Ids wrap around the table.
    pub fn new(id: usize, x: u32, y: u32, side: u32) -> Self {
        Self::with_code(ARUCO_4X4_CODES[id % ARUCO_4X4_CODES.len()], 4, x, y, side)
    }

    pub fn with_code(code: u64, bits: u32, x: u32, y: u32, side: u32) -> Self {
        Self {
            code,
            bits,
            x,
            y,
            side,
        }
    }

    /// Ink colour of an image pixel, or `None` outside the marker.
    fn shade(&self, px: u32, py: u32) -> Option<u8> {
        if px < self.x || py < self.y || px >= self.x + self.side || py >= self.y + self.side {
            return None;
        }
        let cells = self.bits + 2;
        let col = (px - self.x) * cells / self.side;
        let row = (py - self.y) * cells / self.side;
        let border = row == 0 || col == 0 || row == cells - 1 || col == cells - 1;
        let white = !border && cell(self.code, self.bits, row - 1, col - 1);
        Some(if white { PAPER } else { INK })
    }
}

/// An elliptical bean. Pixel `(x, y)` belongs to it when its integer
/// coordinates fall inside the ellipse.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeanSpec {
    pub cx: f64,
    pub cy: f64,
    pub semi_major: f64,
    pub semi_minor: f64,
    /// Rotation of the major axis from the x axis, in radians.
    pub angle: f64,
}

impl BeanSpec {
    fn contains(&self, x: u32, y: u32) -> bool {
        let (dx, dy) = (x as f64 - self.cx, y as f64 - self.cy);
        let (sin, cos) = self.angle.sin_cos();
        let u = dx * cos + dy * sin;
        let v = -dx * sin + dy * cos;
        (u / self.semi_major).powi(2) + (v / self.semi_minor).powi(2) <= 1.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Scene {
    pub width: u32,
    pub height: u32,
    pub background: u8,
    pub bean_shade: u8,
    pub markers: Vec<MarkerSpec>,
    pub beans: Vec<BeanSpec>,
}

impl Scene {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            background: 220,
            bean_shade: 70,
            markers: Vec::new(),
            beans: Vec::new(),
        }
    }

    /// Add a marker. Later markers are drawn over earlier ones.
    pub fn with_marker(mut self, marker: MarkerSpec) -> Self {
        self.markers.push(marker);
        self
    }

    pub fn with_disk(self, cx: f64, cy: f64, radius: f64) -> Self {
        self.with_ellipse(cx, cy, radius, radius, 0.0)
    }

    pub fn with_ellipse(mut self, cx: f64, cy: f64, semi_major: f64, semi_minor: f64, angle: f64) -> Self {
        self.beans.push(BeanSpec {
            cx,
            cy,
            semi_major,
            semi_minor,
            angle,
        });
        self
    }

    /// A frame with a 20 mm marker at 5 px/mm and a handful of beans, two
    /// of them touching.
    pub fn demo() -> Self {
        Self::new(640, 480)
            .with_marker(MarkerSpec::new(0, 30, 30, 100))
            .with_ellipse(300.0, 120.0, 40.0, 28.0, 0.3)
            .with_ellipse(450.0, 300.0, 45.0, 30.0, -0.5)
            .with_ellipse(200.0, 340.0, 38.0, 26.0, 1.2)
            .with_ellipse(262.0, 372.0, 36.0, 25.0, 0.1)
    }

    pub fn render_gray(&self) -> GrayImage {
        GrayImage::from_fn(self.width, self.height, |x, y| {
            if let Some(shade) = self.markers.iter().rev().find_map(|m| m.shade(x, y)) {
                return Luma([shade]);
            }
            if self.beans.iter().any(|b| b.contains(x, y)) {
                Luma([self.bean_shade])
            } else {
                Luma([self.background])
            }
        })
    }

    /// The scene as an RGB photograph.
    pub fn render(&self) -> DynamicImage {
        DynamicImage::ImageRgb8(DynamicImage::ImageLuma8(self.render_gray()).to_rgb8())
    }
}
