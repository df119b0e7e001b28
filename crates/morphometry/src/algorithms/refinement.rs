use image::{GrayImage, Luma};
use imageproc::region_labelling::{Connectivity, connected_components};
use tracing::debug;

use crate::{
    algorithms::threshold::{binarize, open_close},
    config::{PipelineConfig, Polarity},
    error::{MorphometryError, Result},
    traits::RegionRefiner,
    types::PixelBox,
};

/// Per-region Otsu thresholding followed by opening and closing.
///
/// Each connected region of the coarse mask is thresholded inside its own
/// bounding box, so uneven lighting across the frame does not bias the cut.
/// The refined pixels never leave the region they came from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalOtsuRefiner {
    pub polarity: Polarity,
    pub open_size: u32,
    pub close_size: u32,
}

impl Default for LocalOtsuRefiner {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

impl LocalOtsuRefiner {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            polarity: config.polarity,
            open_size: config.open_size,
            close_size: config.close_size,
        }
    }
}

impl RegionRefiner for LocalOtsuRefiner {
    fn refine(&self, grayscale: &GrayImage, coarse_mask: &GrayImage) -> Result<GrayImage> {
        if grayscale.dimensions() != coarse_mask.dimensions() {
            return Err(MorphometryError::InvalidImage(format!(
                "mask is {:?} but image is {:?}",
                coarse_mask.dimensions(),
                grayscale.dimensions()
            )));
        }

        let labels = connected_components(coarse_mask, Connectivity::Eight, Luma([0u8]));
        let mut extents: Vec<Option<(u32, u32, u32, u32)>> = Vec::new();
        for (x, y, label) in labels.enumerate_pixels() {
            let label = label[0] as usize;
            if label == 0 {
                continue;
            }
            if extents.len() < label {
                extents.resize(label, None);
            }
            let slot = &mut extents[label - 1];
            *slot = Some(match *slot {
                None => (x, y, x, y),
                Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
            });
        }

        let mut refined = GrayImage::new(grayscale.width(), grayscale.height());
        for (index, extent) in extents.iter().enumerate() {
            let Some((x0, y0, x1, y1)) = *extent else {
                continue;
            };
            let label = index as u32 + 1;
            let bounds = PixelBox::from_extent(x0, y0, x1, y1);
            let crop = image::imageops::crop_imm(grayscale, bounds.x, bounds.y, bounds.width, bounds.height).to_image();

            let mut local = binarize(&crop, self.polarity);
            let in_region = |x: u32, y: u32| labels.get_pixel(bounds.x + x, bounds.y + y)[0] == label;
            for (x, y, pixel) in local.enumerate_pixels_mut() {
                if !in_region(x, y) {
                    *pixel = Luma([0]);
                }
            }

            let cleaned = open_close(&local, self.open_size, self.close_size);
            for (x, y, pixel) in cleaned.enumerate_pixels() {
                if pixel[0] > 0 && in_region(x, y) {
                    refined.put_pixel(bounds.x + x, bounds.y + y, Luma([255]));
                }
            }
        }

        debug!(regions = extents.len(), "refined coarse regions");
        Ok(refined)
    }
}
