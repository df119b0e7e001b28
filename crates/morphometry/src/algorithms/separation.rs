//! Watershed splitting of touching beans.
//!
//! The distance to background is flooded downhill from its prominent peaks.
//! Distances are kept squared so every comparison is exact integer math.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use image::{GrayImage, Luma};
use tracing::debug;

use crate::{
    config::PipelineConfig,
    error::Result,
    traits::InstanceSeparator,
    types::BeanRegion,
};

const NEIGHBOURS: [(i64, i64); 8] = [(-1, -1), (0, -1), (1, -1), (-1, 0), (1, 0), (-1, 1), (0, 1), (1, 1)];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatershedSeparator {
    /// Side of the square window a seed must dominate.
    pub peak_footprint: u32,
    /// Minimum drop, in pixels of distance, between a peak and the pass to a
    /// higher one. Ridge jitter along an elongated bean stays well below a
    /// pixel; the waist between two touching beans does not.
    pub min_prominence_px: f64,
    /// Regions with this many pixels or fewer are dropped.
    pub noise_floor_px: u64,
}

impl Default for WatershedSeparator {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

impl WatershedSeparator {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            peak_footprint: config.peak_footprint,
            min_prominence_px: config.min_peak_prominence_px,
            noise_floor_px: config.noise_floor_px,
        }
    }
}

impl InstanceSeparator for WatershedSeparator {
    fn separate(&self, mask: &GrayImage) -> Result<Vec<BeanRegion>> {
        let grid = Grid::new(mask);
        if !grid.foreground.iter().any(|&f| f) {
            return Ok(Vec::new());
        }

        let distance = squared_distance_to_background(mask);
        let seeds = find_seeds(&grid, &distance, self.peak_footprint, self.min_prominence_px);
        let labels = flood(&grid, &distance, &seeds);

        let mut pixels: Vec<Vec<(u32, u32)>> = vec![Vec::new(); seeds.len()];
        for (index, &label) in labels.iter().enumerate() {
            if label > 0 {
                pixels[label as usize - 1].push(grid.coords(index));
            }
        }

        let regions: Vec<BeanRegion> = pixels
            .iter()
            .filter(|p| p.len() as u64 > self.noise_floor_px)
            .enumerate()
            .filter_map(|(i, p)| BeanRegion::from_pixels(i + 1, p))
            .collect();

        debug!(
            seeds = seeds.len(),
            regions = regions.len(),
            dropped = seeds.len() - regions.len(),
            "watershed separation"
        );
        Ok(regions)
    }
}

/// Row-major view of a binary mask.
struct Grid {
    width: usize,
    height: usize,
    foreground: Vec<bool>,
}

impl Grid {
    fn new(mask: &GrayImage) -> Self {
        Self {
            width: mask.width() as usize,
            height: mask.height() as usize,
            foreground: mask.pixels().map(|p| p[0] > 0).collect(),
        }
    }

    fn coords(&self, index: usize) -> (u32, u32) {
        ((index % self.width) as u32, (index / self.width) as u32)
    }

    fn offset(&self, index: usize, dx: i64, dy: i64) -> Option<usize> {
        let x = (index % self.width) as i64 + dx;
        let y = (index / self.width) as i64 + dy;
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return None;
        }
        Some(y as usize * self.width + x as usize)
    }

    fn neighbours(&self, index: usize) -> impl Iterator<Item = usize> + '_ {
        NEIGHBOURS.iter().filter_map(move |&(dx, dy)| self.offset(index, dx, dy))
    }
}

/// Squared Euclidean distance from each foreground pixel to the nearest
/// background pixel, row-major. Pixels outside the image count as background.
pub fn squared_distance_to_background(mask: &GrayImage) -> Vec<u64> {
    let (width, height) = mask.dimensions();
    let padded = GrayImage::from_fn(width + 2, height + 2, |x, y| {
        let inside = x >= 1 && y >= 1 && x <= width && y <= height;
        if inside && mask.get_pixel(x - 1, y - 1)[0] > 0 {
            Luma([0])
        } else {
            Luma([255])
        }
    });
    let distances = imageproc::distance_transform::euclidean_squared_distance_transform(&padded);

    let mut out = Vec::with_capacity((width * height) as usize);
    for y in 0..height {
        for x in 0..width {
            out.push(distances.get_pixel(x + 1, y + 1)[0].round() as u64);
        }
    }
    out
}

const UNVISITED: usize = usize::MAX;

/// Union-find over visited pixels. Pixels are visited highest first, so a
/// group's root is always its peak.
struct Basins {
    parent: Vec<usize>,
}

impl Basins {
    fn new(len: usize) -> Self {
        Self {
            parent: vec![UNVISITED; len],
        }
    }

    fn visited(&self, index: usize) -> bool {
        self.parent[index] != UNVISITED
    }

    fn find(&mut self, index: usize) -> usize {
        let mut root = index;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut current = index;
        while self.parent[current] != root {
            let next = self.parent[current];
            self.parent[current] = root;
            current = next;
        }
        root
    }
}

/// Whether `index` is at least as high as everything in its footprint window.
fn dominates_window(grid: &Grid, distance: &[u64], index: usize, footprint: u32) -> bool {
    let footprint = footprint.max(1) as i64;
    let (before, after) = (footprint / 2, (footprint - 1) / 2);
    let value = distance[index];
    (-before..=after).all(|dy| {
        (-before..=after).all(|dx| grid.offset(index, dx, dy).is_none_or(|n| distance[n] <= value))
    })
}

/// Seed pixels in raster order. Seed `i` floods label `i + 1`.
///
/// Foreground pixels are visited from the highest distance down and joined
/// to their visited neighbours. When two groups meet, the lower peak's group
/// ends there; that peak still seeds if it rises at least `min_prominence`
/// above the meeting pixel and dominates its footprint window. The highest
/// peak of every blob always seeds, so a blob with a flat ridge still
/// yields exactly one region.
fn find_seeds(grid: &Grid, distance: &[u64], footprint: u32, min_prominence: f64) -> Vec<usize> {
    let mut order: Vec<usize> = (0..distance.len()).filter(|&i| grid.foreground[i]).collect();
    order.sort_unstable_by_key(|&i| (Reverse(distance[i]), i));

    let mut basins = Basins::new(distance.len());
    let mut seeds = Vec::new();
    for &index in &order {
        let visited: Vec<usize> = grid.neighbours(index).filter(|&n| basins.visited(n)).collect();
        let mut roots: Vec<usize> = visited.into_iter().map(|n| basins.find(n)).collect();
        roots.sort_unstable();
        roots.dedup();

        // Visited earlier means higher, or level and earlier in raster order.
        let Some(&highest) = roots.iter().min_by_key(|&&r| (Reverse(distance[r]), r)) else {
            basins.parent[index] = index;
            continue;
        };
        for &root in roots.iter().filter(|&&r| r != highest) {
            let prominence = (distance[root] as f64).sqrt() - (distance[index] as f64).sqrt();
            if prominence >= min_prominence && dominates_window(grid, distance, root, footprint) {
                seeds.push(root);
            }
            basins.parent[root] = highest;
        }
        basins.parent[index] = highest;
    }

    seeds.extend(order.iter().copied().filter(|&i| basins.parent[i] == i));
    seeds.sort_unstable();
    seeds
}

/// Priority flood from the seeds over the foreground, highest distance
/// first. Ties are served in arrival order.
fn flood(grid: &Grid, distance: &[u64], seeds: &[usize]) -> Vec<u32> {
    let mut labels = vec![0u32; distance.len()];
    let mut queue = BinaryHeap::new();
    let mut arrival = 0u64;

    for (i, &index) in seeds.iter().enumerate() {
        labels[index] = i as u32 + 1;
        queue.push((distance[index], Reverse(arrival), index));
        arrival += 1;
    }

    while let Some((_, _, index)) = queue.pop() {
        let label = labels[index];
        for n in grid.neighbours(index) {
            if grid.foreground[n] && labels[n] == 0 {
                labels[n] = label;
                queue.push((distance[n], Reverse(arrival), n));
                arrival += 1;
            }
        }
    }
    labels
}
