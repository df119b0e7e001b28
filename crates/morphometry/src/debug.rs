//! Annotated views of a pipeline result, for inspection.

use image::{DynamicImage, Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect;

use crate::types::PipelineResult;

const MARKER_COLOUR: Rgb<u8> = Rgb([0, 200, 0]);
const BEAN_COLOUR: Rgb<u8> = Rgb([220, 30, 30]);

/// Copy of `image` with the marker outline and every bean's bounding box.
pub fn annotate(image: &DynamicImage, result: &PipelineResult) -> RgbImage {
    let mut canvas = image.to_rgb8();

    if let Some(corners) = result.calibration.marker_corners {
        for i in 0..4 {
            let [ax, ay] = corners[i];
            let [bx, by] = corners[(i + 1) % 4];
            draw_line_segment_mut(&mut canvas, (ax as f32, ay as f32), (bx as f32, by as f32), MARKER_COLOUR);
        }
    }

    for bean in &result.beans {
        let b = bean.region.bounding_box;
        let rect = Rect::at(b.x as i32, b.y as i32).of_size(b.width.max(1), b.height.max(1));
        draw_hollow_rect_mut(&mut canvas, rect, BEAN_COLOUR);
    }
    canvas
}

/// Bean pixels on a black background.
pub fn isolate_beans(image: &DynamicImage, result: &PipelineResult) -> RgbImage {
    let source = image.to_rgb8();
    let mut canvas = RgbImage::new(source.width(), source.height());
    for bean in &result.beans {
        for (x, y) in bean.region.pixels() {
            if let Some(pixel) = source.get_pixel_checked(x, y) {
                canvas.put_pixel(x, y, *pixel);
            }
        }
    }
    canvas
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Bean, BeanRegion, CalibrationResult, FeatureSet};

    fn result_with_one_bean() -> PipelineResult {
        let corners = [[2.0, 2.0], [12.0, 2.0], [12.0, 12.0], [2.0, 12.0]];
        let pixels: Vec<(u32, u32)> = (20..25).flat_map(|y| (20..30).map(move |x| (x, y))).collect();
        let region = BeanRegion::from_pixels(1, &pixels).unwrap();
        let features = FeatureSet {
            area_mm2: 2.0,
            perimeter_mm: 1.0,
            major_axis_length_mm: 1.0,
            minor_axis_length_mm: 0.5,
            eccentricity: 0.8,
            extent: 1.0,
            equivalent_diameter_mm: 1.6,
            solidity: 1.0,
            mean_intensity: 0.5,
            aspect_ratio: 2.0,
            convex_area_mm2: 2.0,
        };
        PipelineResult {
            calibration: CalibrationResult::from_marker(corners, 20.0, 40, 40).unwrap(),
            beans: vec![Bean::new(region, features)],
        }
    }

    #[test]
    fn test_annotate_draws_marker_and_box() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(40, 40, Rgb([255, 255, 255])));
        let annotated = annotate(&image, &result_with_one_bean());

        assert_eq!(*annotated.get_pixel(7, 2), MARKER_COLOUR);
        assert_eq!(*annotated.get_pixel(20, 22), BEAN_COLOUR);
        assert_eq!(*annotated.get_pixel(35, 35), Rgb([255, 255, 255]));
    }

    #[test]
    fn test_isolate_keeps_only_bean_pixels() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(40, 40, Rgb([90, 60, 30])));
        let isolated = isolate_beans(&image, &result_with_one_bean());

        assert_eq!(*isolated.get_pixel(22, 22), Rgb([90, 60, 30]));
        assert_eq!(*isolated.get_pixel(5, 5), Rgb([0, 0, 0]));
        assert_eq!(isolated.pixels().filter(|p| p.0 != [0, 0, 0]).count(), 50);
    }
}
