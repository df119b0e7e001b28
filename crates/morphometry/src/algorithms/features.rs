//! Region properties of a separated bean, scaled to millimetres.

use std::f64::consts::{PI, SQRT_2};

use geo::{ConvexHull, Intersects};
use geo_types::{MultiPoint, Point as GeoPoint};
use image::GrayImage;

use crate::{
    error::{MorphometryError, Result},
    traits::FeatureExtractor,
    types::{BeanRegion, FeatureSet},
};

/// Pixel-domain descriptors before scaling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelProperties {
    pub area: f64,
    pub perimeter: f64,
    pub major_axis_length: f64,
    pub minor_axis_length: f64,
    pub eccentricity: f64,
    pub convex_area: f64,
    pub bbox_area: f64,
    pub mean_intensity: f64,
}

impl PixelProperties {
    pub fn measure(region: &BeanRegion, grayscale: &GrayImage) -> Result<Self> {
        let bounds = region.bounding_box;
        if bounds.right() > grayscale.width() || bounds.bottom() > grayscale.height() {
            return Err(MorphometryError::ImageProcessing(format!(
                "region {} at {:?} lies outside the {}x{} image",
                region.bean_index,
                bounds,
                grayscale.width(),
                grayscale.height()
            )));
        }
        if region.pixel_area == 0 {
            return Err(MorphometryError::ImageProcessing(format!(
                "region {} has no pixels",
                region.bean_index
            )));
        }

        let mask = &region.pixel_mask;
        let local: Vec<(f64, f64)> = mask
            .enumerate_pixels()
            .filter(|(_, _, p)| p[0] > 0)
            .map(|(x, y, _)| (x as f64, y as f64))
            .collect();
        let n = local.len() as f64;

        let intensity: f64 = region
            .pixels()
            .map(|(x, y)| grayscale.get_pixel(x, y)[0] as f64)
            .sum();

        // Second central moments in (row, col) order.
        let mean_col = local.iter().map(|p| p.0).sum::<f64>() / n;
        let mean_row = local.iter().map(|p| p.1).sum::<f64>() / n;
        let (mut rr, mut cc, mut rc) = (0.0, 0.0, 0.0);
        for &(col, row) in &local {
            rr += (row - mean_row) * (row - mean_row);
            cc += (col - mean_col) * (col - mean_col);
            rc += (row - mean_row) * (col - mean_col);
        }
        let (a, c, b) = (rr / n, cc / n, rc / n);
        let spread = (((a - c) / 2.0).powi(2) + b * b).sqrt();
        let l1 = ((a + c) / 2.0 + spread).max(0.0);
        let l2 = ((a + c) / 2.0 - spread).max(0.0);

        Ok(Self {
            area: n,
            perimeter: perimeter(mask),
            major_axis_length: 4.0 * l1.sqrt(),
            minor_axis_length: 4.0 * l2.sqrt(),
            eccentricity: if l1 > 0.0 { (1.0 - l2 / l1).sqrt() } else { 0.0 },
            convex_area: convex_area(mask) as f64,
            bbox_area: bounds.area() as f64,
            mean_intensity: intensity / n / 255.0,
        })
    }
}

/// Measures regions the way `regionprops` does: 4-connected border
/// perimeter, ellipse axes from second moments, and a convex hull over pixel
/// corners.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionPropsExtractor;

impl FeatureExtractor for RegionPropsExtractor {
    fn compute(&self, region: &BeanRegion, grayscale: &GrayImage, mm_per_pixel: f64) -> Result<FeatureSet> {
        if !mm_per_pixel.is_finite() || mm_per_pixel <= 0.0 {
            return Err(MorphometryError::ImageProcessing(format!(
                "scale must be positive, got {mm_per_pixel}"
            )));
        }
        let props = PixelProperties::measure(region, grayscale)?;
        Ok(scale(&props, mm_per_pixel))
    }
}

/// Apply a linear scale to lengths and its square to areas.
pub fn scale(props: &PixelProperties, mm_per_pixel: f64) -> FeatureSet {
    let k = mm_per_pixel;
    let k2 = k * k;
    let major = props.major_axis_length * k;
    let minor = props.minor_axis_length * k;

    FeatureSet {
        area_mm2: props.area * k2,
        perimeter_mm: props.perimeter * k,
        major_axis_length_mm: major,
        minor_axis_length_mm: minor,
        eccentricity: props.eccentricity,
        extent: if props.bbox_area > 0.0 { props.area / props.bbox_area } else { 0.0 },
        equivalent_diameter_mm: (4.0 * props.area / PI).sqrt() * k,
        solidity: if props.convex_area > 0.0 { props.area / props.convex_area } else { 0.0 },
        mean_intensity: props.mean_intensity,
        aspect_ratio: if minor > 0.0 { major / minor } else { 0.0 },
        convex_area_mm2: props.convex_area * k2,
    }
}

fn filled(mask: &GrayImage, x: i64, y: i64) -> bool {
    x >= 0 && y >= 0 && x < mask.width() as i64 && y < mask.height() as i64 && mask.get_pixel(x as u32, y as u32)[0] > 0
}

/// Foreground pixels with at least one 4-neighbour outside the region.
fn is_border(mask: &GrayImage, x: i64, y: i64) -> bool {
    filled(mask, x, y)
        && !(filled(mask, x - 1, y) && filled(mask, x + 1, y) && filled(mask, x, y - 1) && filled(mask, x, y + 1))
}

/// Perimeter estimated from the configuration of each border pixel's
/// border neighbours.
pub fn perimeter(mask: &GrayImage) -> f64 {
    const WEIGHTS: [(i64, i64, u32); 8] = [
        (-1, -1, 10),
        (0, -1, 2),
        (1, -1, 10),
        (-1, 0, 2),
        (1, 0, 2),
        (-1, 1, 10),
        (0, 1, 2),
        (1, 1, 10),
    ];

    let mut total = 0.0;
    for y in 0..mask.height() as i64 {
        for x in 0..mask.width() as i64 {
            if !is_border(mask, x, y) {
                continue;
            }
            let code: u32 = 1 + WEIGHTS
                .iter()
                .filter(|&&(dx, dy, _)| is_border(mask, x + dx, y + dy))
                .map(|&(_, _, w)| w)
                .sum::<u32>();
            total += match code {
                5 | 7 | 15 | 17 | 25 | 27 => 1.0,
                21 | 33 => SQRT_2,
                13 | 23 => (1.0 + SQRT_2) / 2.0,
                _ => 0.0,
            };
        }
    }
    total
}

/// Number of pixels whose centre falls inside the convex hull of the
/// region's pixel corners.
pub fn convex_area(mask: &GrayImage) -> u64 {
    let corners: Vec<(f64, f64)> = mask
        .enumerate_pixels()
        .filter(|&(x, y, _)| is_border(mask, x as i64, y as i64))
        .flat_map(|(x, y, _)| {
            let (x, y) = (x as f64, y as f64);
            [(x, y), (x + 1.0, y), (x, y + 1.0), (x + 1.0, y + 1.0)]
        })
        .collect();
    if corners.is_empty() {
        return 0;
    }

    let hull = MultiPoint::from(corners).convex_hull();
    let mut count = 0;
    for y in 0..mask.height() {
        for x in 0..mask.width() {
            if hull.intersects(&GeoPoint::new(x as f64 + 0.5, y as f64 + 0.5)) {
                count += 1;
            }
        }
    }
    count
}
