//! Square fiducial marker detection.
//!
//! Candidates are outer contours of dark blobs that simplify to a convex
//! quadrilateral. Each candidate is refined to sub-pixel corners, sampled
//! on the marker's cell grid through a projective map, and accepted only if
//! its border is dark and its inner bits match a dictionary code.

use geo::{EuclideanLength, Simplify};
use geo_types::{Coord, LineString};
use image::{GrayImage, Luma};
use imageproc::contours::{BorderType, find_contours};
use imageproc::geometric_transformations::Projection;
use tracing::debug;

use crate::{
    algorithms::dictionary::{self, DictionaryMatch},
    config::MarkerConfig,
    error::Result,
    traits::MarkerDetector,
    types::{MarkerCorners, Point, average_side_length},
};

/// A decoded marker.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedMarker {
    /// Index of the matched code in the dictionary.
    pub id: usize,
    /// Corners in canonical order: top-left, top-right, bottom-right,
    /// bottom-left as the marker is printed.
    pub corners: MarkerCorners,
    pub hamming_distance: u32,
}

/// Detector for black-bordered square markers with an `n x n` bit payload.
#[derive(Debug, Clone, Default)]
pub struct SquareMarkerDetector {
    pub config: MarkerConfig,
}

impl SquareMarkerDetector {
    pub fn new(config: MarkerConfig) -> Self {
        Self { config }
    }

    /// Binary images (dark = 255) the candidate search runs over.
    fn binarizations(&self, gray: &GrayImage) -> Vec<GrayImage> {
        let mut binaries: Vec<GrayImage> = self
            .config
            .adaptive_radii
            .iter()
            .map(|&radius| adaptive_dark(gray, radius, self.config.adaptive_offset))
            .collect();
        if let Some(global) = otsu_dark(gray) {
            binaries.push(global);
        }
        binaries
    }

    fn candidates(&self, binary: &GrayImage) -> Vec<(MarkerCorners, Vec<Point>)> {
        let longest_side = binary.width().max(binary.height()) as f64;
        let min_len = (self.config.min_perimeter_rate * longest_side).max(4.0);
        let max_len = self.config.max_perimeter_rate * longest_side;

        find_contours::<i32>(binary)
            .into_iter()
            .filter(|c| c.border_type == BorderType::Outer)
            .filter(|c| (min_len..=max_len).contains(&(c.points.len() as f64)))
            .filter_map(|contour| {
                let centres: Vec<Point> = contour
                    .points
                    .iter()
                    .map(|p| [p.x as f64 + 0.5, p.y as f64 + 0.5])
                    .collect();
                let quad = approximate_quad(&centres, self.config.polygon_accuracy_rate)?;
                let sides_ok = (0..4).all(|i| distance(quad[i], quad[(i + 1) % 4]) >= self.config.min_side_px);
                (sides_ok && is_convex(&quad)).then_some((quad, centres))
            })
            .collect()
    }

    fn decode(&self, gray: &GrayImage, corners: &MarkerCorners) -> Option<DetectedMarker> {
        let bits = self.config.bits;
        let cells = bits + 2;
        let extent = cells as f32;
        let to: [(f32, f32); 4] = corners.map(|[x, y]| (x as f32, y as f32));
        let projection =
            Projection::from_control_points([(0.0, 0.0), (extent, 0.0), (extent, extent), (0.0, extent)], to)?;

        let mut means = Vec::with_capacity((cells * cells) as usize);
        for row in 0..cells {
            for col in 0..cells {
                means.push(sample_cell(gray, &projection, row, col)?);
            }
        }

        let darkest = means.iter().copied().fold(f64::INFINITY, f64::min);
        let brightest = means.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if brightest - darkest < self.config.min_cell_contrast {
            return None;
        }
        let midpoint = (darkest + brightest) / 2.0;
        let white = |row: u32, col: u32| means[(row * cells + col) as usize] > midpoint;

        let border: Vec<bool> = (0..cells)
            .flat_map(|row| (0..cells).map(move |col| (row, col)))
            .filter(|&(row, col)| row == 0 || col == 0 || row == cells - 1 || col == cells - 1)
            .map(|(row, col)| white(row, col))
            .collect();
        let white_border = border.iter().filter(|&&w| w).count();
        if white_border as f64 > self.config.max_border_error_rate * border.len() as f64 {
            return None;
        }

        let payload: Vec<bool> = (1..=bits)
            .flat_map(|row| (1..=bits).map(move |col| (row, col)))
            .map(|(row, col)| white(row, col))
            .collect();
        let observed = dictionary::pack(&payload);
        let DictionaryMatch {
            id,
            rotation,
            distance,
        } = dictionary::lookup(&self.config.codes, bits, observed, self.config.max_correction_bits)?;

        // A quarter turn of the observed grid moves the top-right corner to
        // the top-left, so the canonical corners are a left rotation.
        let r = rotation as usize;
        let canonical = [0, 1, 2, 3].map(|i| corners[(i + r) % 4]);

        Some(DetectedMarker {
            id,
            corners: canonical,
            hamming_distance: distance,
        })
    }
}

impl MarkerDetector for SquareMarkerDetector {
    fn detect_markers(&self, gray: &GrayImage) -> Result<Vec<DetectedMarker>> {
        let mut markers: Vec<DetectedMarker> = Vec::new();
        if gray.width() == 0 || gray.height() == 0 {
            return Ok(markers);
        }

        for binary in self.binarizations(gray) {
            for (quad, contour) in self.candidates(&binary) {
                let corners = refine_corners(&quad, &contour);
                let Some(marker) = self.decode(gray, &corners) else {
                    continue;
                };
                let duplicate = markers.iter().any(|known| same_marker(known, &marker));
                if !duplicate {
                    markers.push(marker);
                }
            }
        }

        debug!(count = markers.len(), "square markers detected");
        Ok(markers)
    }
}

/// Dark pixels relative to a local box mean, marked 255.
fn adaptive_dark(gray: &GrayImage, radius: u32, offset: u8) -> GrayImage {
    let mean = imageproc::filter::box_filter(gray, radius, radius);
    let mut out = GrayImage::new(gray.width(), gray.height());
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let value = gray.get_pixel(x, y)[0] as i32;
        let local = mean.get_pixel(x, y)[0] as i32 - offset as i32;
        if value < local {
            *pixel = Luma([255]);
        }
    }
    out
}

/// Pixels at or below the global Otsu level, marked 255. `None` for flat images.
fn otsu_dark(gray: &GrayImage) -> Option<GrayImage> {
    let (lo, hi) = gray
        .pixels()
        .fold((u8::MAX, u8::MIN), |(lo, hi), p| (lo.min(p[0]), hi.max(p[0])));
    if lo >= hi {
        return None;
    }
    let level = imageproc::contrast::otsu_level(gray);
    let mut out = GrayImage::new(gray.width(), gray.height());
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        if gray.get_pixel(x, y)[0] <= level {
            *pixel = Luma([255]);
        }
    }
    Some(out)
}

/// Simplify a closed contour and keep it only if four vertices remain.
/// Corners come back in clockwise order on screen (y pointing down).
fn approximate_quad(points: &[Point], accuracy_rate: f64) -> Option<MarkerCorners> {
    let n = points.len();
    if n < 4 {
        return None;
    }

    // Start the ring on an extreme point so the fixed endpoint is a corner.
    let centre = centroid(points);
    let start = (0..n)
        .max_by(|&a, &b| distance(points[a], centre).total_cmp(&distance(points[b], centre)))
        .unwrap_or(0);
    let ring: LineString<f64> = (0..=n)
        .map(|i| {
            let [x, y] = points[(start + i) % n];
            Coord { x, y }
        })
        .collect();

    let epsilon = accuracy_rate * ring.euclidean_length();
    let simplified = ring.simplify(&epsilon);
    let vertices: Vec<Point> = simplified.coords().map(|c| [c.x, c.y]).collect();
    if vertices.len() != 5 {
        return None;
    }

    let mut quad = [vertices[0], vertices[1], vertices[2], vertices[3]];
    if signed_area(&quad) < 0.0 {
        quad.swap(1, 3);
    }
    Some(quad)
}

fn is_convex(quad: &MarkerCorners) -> bool {
    let crosses: Vec<f64> = (0..4)
        .map(|i| {
            let [ax, ay] = quad[i];
            let [bx, by] = quad[(i + 1) % 4];
            let [cx, cy] = quad[(i + 2) % 4];
            (bx - ax) * (cy - by) - (by - ay) * (cx - bx)
        })
        .collect();
    crosses.iter().all(|&c| c > 0.0) || crosses.iter().all(|&c| c < 0.0)
}

/// Straight line through `origin` along unit vector `direction`.
#[derive(Debug, Clone, Copy)]
struct Line {
    origin: Point,
    direction: Point,
}

impl Line {
    fn through(a: Point, b: Point) -> Option<Self> {
        let length = distance(a, b);
        (length > f64::EPSILON).then(|| Self {
            origin: a,
            direction: [(b[0] - a[0]) / length, (b[1] - a[1]) / length],
        })
    }

    /// Total least squares fit.
    fn fit(points: &[Point]) -> Option<Self> {
        if points.len() < 2 {
            return None;
        }
        let [mx, my] = centroid(points);
        let (mut sxx, mut syy, mut sxy) = (0.0, 0.0, 0.0);
        for &[x, y] in points {
            sxx += (x - mx) * (x - mx);
            syy += (y - my) * (y - my);
            sxy += (x - mx) * (y - my);
        }
        if sxx + syy <= f64::EPSILON {
            return None;
        }
        let angle = 0.5 * (2.0 * sxy).atan2(sxx - syy);
        Some(Self {
            origin: [mx, my],
            direction: [angle.cos(), angle.sin()],
        })
    }

    /// Move the line by `amount` along its normal, away from `inside`.
    fn pushed_away_from(self, inside: Point, amount: f64) -> Self {
        let mut normal = [-self.direction[1], self.direction[0]];
        let towards = [self.origin[0] - inside[0], self.origin[1] - inside[1]];
        if normal[0] * towards[0] + normal[1] * towards[1] < 0.0 {
            normal = [-normal[0], -normal[1]];
        }
        Self {
            origin: [self.origin[0] + amount * normal[0], self.origin[1] + amount * normal[1]],
            direction: self.direction,
        }
    }

    fn intersect(&self, other: &Line) -> Option<Point> {
        let [dx1, dy1] = self.direction;
        let [dx2, dy2] = other.direction;
        let denom = dx1 * dy2 - dy1 * dx2;
        if denom.abs() < 1e-9 {
            return None;
        }
        let wx = other.origin[0] - self.origin[0];
        let wy = other.origin[1] - self.origin[1];
        let t = (wx * dy2 - wy * dx2) / denom;
        Some([self.origin[0] + t * dx1, self.origin[1] + t * dy1])
    }
}

/// Fit each side to the contour points nearest it, push the fitted lines
/// half a pixel outward onto the pixel boundary, and re-intersect.
fn refine_corners(quad: &MarkerCorners, contour: &[Point]) -> MarkerCorners {
    let centre = centroid(quad);
    let shortest = (0..4)
        .map(|i| distance(quad[i], quad[(i + 1) % 4]))
        .fold(f64::INFINITY, f64::min);
    let corner_margin = (0.1 * shortest).max(2.0);

    let mut per_side: [Vec<Point>; 4] = Default::default();
    for &p in contour {
        if quad.iter().any(|&c| distance(c, p) < corner_margin) {
            continue;
        }
        let side = (0..4)
            .min_by(|&a, &b| {
                segment_distance(p, quad[a], quad[(a + 1) % 4])
                    .total_cmp(&segment_distance(p, quad[b], quad[(b + 1) % 4]))
            })
            .unwrap_or(0);
        per_side[side].push(p);
    }

    let lines: Vec<Option<Line>> = (0..4)
        .map(|i| {
            Line::fit(&per_side[i])
                .or_else(|| Line::through(quad[i], quad[(i + 1) % 4]))
                .map(|line| line.pushed_away_from(centre, 0.5))
        })
        .collect();

    let mut refined = *quad;
    for (i, corner) in refined.iter_mut().enumerate() {
        let previous = lines[(i + 3) % 4];
        let next = lines[i];
        if let (Some(a), Some(b)) = (previous, next) {
            if let Some(p) = a.intersect(&b) {
                if distance(p, quad[i]) <= corner_margin * 2.0 {
                    *corner = p;
                }
            }
        }
    }
    refined
}

/// Mean brightness of one grid cell, sampled on a 3x3 lattice inside it.
fn sample_cell(gray: &GrayImage, projection: &Projection, row: u32, col: u32) -> Option<f64> {
    const OFFSETS: [f32; 3] = [0.3, 0.5, 0.7];
    let mut total = 0.0;
    for dy in OFFSETS {
        for dx in OFFSETS {
            let (x, y) = *projection * (col as f32 + dx, row as f32 + dy);
            if !(x >= 0.0 && y >= 0.0 && x < gray.width() as f32 && y < gray.height() as f32) {
                return None;
            }
            total += gray.get_pixel(x as u32, y as u32)[0] as f64;
        }
    }
    Some(total / (OFFSETS.len() * OFFSETS.len()) as f64)
}

fn same_marker(a: &DetectedMarker, b: &DetectedMarker) -> bool {
    let tolerance = (0.05 * average_side_length(&a.corners)).max(2.0);
    let mean_offset: f64 = (0..4).map(|i| distance(a.corners[i], b.corners[i])).sum::<f64>() / 4.0;
    mean_offset < tolerance
}

fn centroid(points: &[Point]) -> Point {
    let n = points.len().max(1) as f64;
    let (sx, sy) = points
        .iter()
        .fold((0.0, 0.0), |(sx, sy), &[x, y]| (sx + x, sy + y));
    [sx / n, sy / n]
}

fn distance(a: Point, b: Point) -> f64 {
    ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2)).sqrt()
}

fn segment_distance(p: Point, a: Point, b: Point) -> f64 {
    let (abx, aby) = (b[0] - a[0], b[1] - a[1]);
    let len2 = abx * abx + aby * aby;
    if len2 <= f64::EPSILON {
        return distance(p, a);
    }
    let t = (((p[0] - a[0]) * abx + (p[1] - a[1]) * aby) / len2).clamp(0.0, 1.0);
    distance(p, [a[0] + t * abx, a[1] + t * aby])
}

/// Shoelace area; positive for clockwise order on screen.
fn signed_area(quad: &MarkerCorners) -> f64 {
    (0..4)
        .map(|i| {
            let [x0, y0] = quad[i];
            let [x1, y1] = quad[(i + 1) % 4];
            x0 * y1 - x1 * y0
        })
        .sum::<f64>()
        / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::dictionary::{ARUCO_4X4_CODES, rotate};
    use crate::synthetic::{MarkerSpec, Scene};

    fn detector() -> SquareMarkerDetector {
        SquareMarkerDetector::new(MarkerConfig::default())
    }

    #[test]
    fn test_detects_axis_aligned_marker_with_exact_corners() {
        let scene = Scene::new(300, 240).with_marker(MarkerSpec::new(0, 40, 50, 120));
        let markers = detector().detect_markers(&scene.render_gray()).unwrap();

        assert_eq!(markers.len(), 1);
        let marker = &markers[0];
        assert_eq!(marker.id, 0);
        let expected = [[40.0, 50.0], [160.0, 50.0], [160.0, 170.0], [40.0, 170.0]];
        for (found, want) in marker.corners.iter().zip(expected.iter()) {
            assert!((found[0] - want[0]).abs() < 1e-6, "{found:?} vs {want:?}");
            assert!((found[1] - want[1]).abs() < 1e-6, "{found:?} vs {want:?}");
        }
    }

    #[test]
    fn test_rotated_payload_still_decodes() {
        // Printing the marker a quarter turn round is the same as printing
        // the rotated code upright.
        let mut config = MarkerConfig::default();
        config.codes = vec![ARUCO_4X4_CODES[7]];
        let upright_code = rotate(ARUCO_4X4_CODES[7], 4);
        let scene = Scene::new(240, 240).with_marker(MarkerSpec::with_code(upright_code, 4, 60, 60, 96));

        let markers = SquareMarkerDetector::new(config).detect_markers(&scene.render_gray()).unwrap();
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].id, 0);
    }

    #[test]
    fn test_decodes_ids_across_the_dictionary() {
        let scene = Scene::new(400, 200)
            .with_marker(MarkerSpec::new(23, 30, 50, 100))
            .with_marker(MarkerSpec::new(49, 250, 50, 100));
        let mut ids: Vec<usize> = detector()
            .detect_markers(&scene.render_gray())
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![23, 49]);
    }

    #[test]
    fn test_plain_dark_square_is_not_a_marker() {
        let mut gray = GrayImage::from_pixel(200, 200, Luma([230]));
        for y in 50..150 {
            for x in 50..150 {
                gray.put_pixel(x, y, Luma([10]));
            }
        }
        assert!(detector().detect_markers(&gray).unwrap().is_empty());
    }

    #[test]
    fn test_blank_image_has_no_markers() {
        let gray = GrayImage::from_pixel(120, 80, Luma([200]));
        assert!(detector().detect_markers(&gray).unwrap().is_empty());
        assert!(detector().detect_markers(&GrayImage::new(0, 0)).unwrap().is_empty());
    }

    #[test]
    fn test_quad_approximation_orders_clockwise() {
        let mut points = Vec::new();
        for x in 0..20 {
            points.push([x as f64, 0.0]);
        }
        for y in 0..20 {
            points.push([20.0, y as f64]);
        }
        for x in (1..=20).rev() {
            points.push([x as f64, 20.0]);
        }
        for y in (1..=20).rev() {
            points.push([0.0, y as f64]);
        }
        points.reverse();

        let quad = approximate_quad(&points, 0.03).unwrap();
        assert!(signed_area(&quad) > 0.0);
        assert!(is_convex(&quad));
    }

    #[test]
    fn test_line_intersection() {
        let horizontal = Line::through([0.0, 1.0], [5.0, 1.0]).unwrap();
        let vertical = Line::through([2.0, -3.0], [2.0, 7.0]).unwrap();
        let p = horizontal.intersect(&vertical).unwrap();
        assert!((p[0] - 2.0).abs() < 1e-12 && (p[1] - 1.0).abs() < 1e-12);
        assert!(horizontal.intersect(&horizontal).is_none());
    }
}
