// THEORY:
// Perception turns one video frame into at most one `Measurement` of the marker.
// The alignment core only knows the `TargetPerception` contract: same frame in,
// same answer out, and `None` when there is no marker. It never sees masks or
// contours.
//
// `ColorMarkerDetector` is the stock implementation for the two-colour
// nested-square marker:
// 1.  **Thresholding**: each pixel is converted to HSV (OpenCV scale) and tested
//     against the outer and inner colour boxes, producing two binary masks.
// 2.  **Blob extraction**: the largest 4-connected region of each mask that is at
//     least `min_area` pixels becomes a candidate square. While flooding, the
//     region's centroid and its four extreme points (min/max of x+y and x-y) are
//     accumulated; the extreme points are the square's corners.
// 3.  **Nesting check**: the inner square must lie strictly inside the outer one,
//     which rejects stray patches of either colour.
// 4.  **Geometry**: offset of the outer centroid from the image centre, the ratio
//     of the left and right vertical edges (yaw skew), and a distance estimate
//     from the mean edge length.

use crate::config::{HsvRange, MarkerConfig};
use image::RgbImage;

/// Where the marker is relative to the camera, for one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    /// Horizontal pixel offset of the marker centre from the image centre; positive is right.
    pub dx: i32,
    /// Vertical pixel offset; positive is down.
    pub dy: i32,
    /// Estimated distance to the marker, in metres.
    pub distance: f64,
    /// Left edge length over right edge length; 1.0 when seen head-on.
    pub ratio: f64,
}

impl Measurement {
    pub fn new(dx: i32, dy: i32, distance: f64, ratio: f64) -> Self {
        Self {
            dx,
            dy,
            distance,
            ratio,
        }
    }
}

pub trait TargetPerception {
    /// Looks for the marker in `frame`. Deterministic for a given frame.
    fn find_target(&self, frame: &RgbImage) -> Option<Measurement>;
}

type Point = (f64, f64);

/// Corners of a detected square, clockwise in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quad {
    pub top_left: Point,
    pub top_right: Point,
    pub bottom_right: Point,
    pub bottom_left: Point,
}

impl Quad {
    fn corners(&self) -> [Point; 4] {
        [
            self.top_left,
            self.top_right,
            self.bottom_right,
            self.bottom_left,
        ]
    }

    /// Strict point-in-quad test for a convex, clockwise quad.
    pub fn contains(&self, p: Point) -> bool {
        let c = self.corners();
        (0..4).all(|i| {
            let a = c[i];
            let b = c[(i + 1) % 4];
            (b.0 - a.0) * (p.1 - a.1) - (b.1 - a.1) * (p.0 - a.0) > 0.0
        })
    }

    pub fn contains_quad(&self, other: &Quad) -> bool {
        other.corners().iter().all(|&p| self.contains(p))
    }

    pub fn left_edge(&self) -> f64 {
        (self.bottom_left.1 - self.top_left.1).abs()
    }

    pub fn right_edge(&self) -> f64 {
        (self.bottom_right.1 - self.top_right.1).abs()
    }
}

/// A connected region of one colour mask.
#[derive(Debug, Clone, PartialEq)]
pub struct Blob {
    pub area: u32,
    pub centroid: Point,
    pub quad: Quad,
}

/// Converts RGB to HSV with hue halved into 0..=180, as OpenCV does for 8-bit images.
pub fn rgb_to_hsv([r, g, b]: [u8; 3]) -> [u8; 3] {
    let (rf, gf, bf) = (r as f64, g as f64, b as f64);
    let v = rf.max(gf).max(bf);
    let min = rf.min(gf).min(bf);
    let delta = v - min;
    let s = if v == 0.0 { 0.0 } else { 255.0 * delta / v };
    let mut h = if delta == 0.0 {
        0.0
    } else if v == rf {
        60.0 * (gf - bf) / delta
    } else if v == gf {
        120.0 + 60.0 * (bf - rf) / delta
    } else {
        240.0 + 60.0 * (rf - gf) / delta
    };
    if h < 0.0 {
        h += 360.0;
    }
    [(h / 2.0).round() as u8, s.round() as u8, v as u8]
}

pub fn threshold(frame: &RgbImage, range: &HsvRange) -> Vec<bool> {
    frame
        .pixels()
        .map(|pixel| range.contains(rgb_to_hsv(pixel.0)))
        .collect()
}

/// Largest 4-connected region of `mask` with at least `min_area` pixels.
pub fn largest_blob(mask: &[bool], width: u32, height: u32, min_area: u32) -> Option<Blob> {
    let (w, h) = (width as usize, height as usize);
    let mut visited = vec![false; mask.len()];
    let mut stack = Vec::new();
    let mut best: Option<Blob> = None;

    for start in 0..mask.len() {
        if !mask[start] || visited[start] {
            continue;
        }
        visited[start] = true;
        stack.push(start);

        let mut area = 0u32;
        let (mut sum_x, mut sum_y) = (0f64, 0f64);
        let first = ((start % w) as f64, (start / w) as f64);
        let (mut min_sum, mut max_sum, mut min_diff, mut max_diff) = (first, first, first, first);

        while let Some(idx) = stack.pop() {
            let (x, y) = (idx % w, idx / w);
            let p = (x as f64, y as f64);
            area += 1;
            sum_x += p.0;
            sum_y += p.1;
            if p.0 + p.1 < min_sum.0 + min_sum.1 {
                min_sum = p;
            }
            if p.0 + p.1 > max_sum.0 + max_sum.1 {
                max_sum = p;
            }
            if p.0 - p.1 < min_diff.0 - min_diff.1 {
                min_diff = p;
            }
            if p.0 - p.1 > max_diff.0 - max_diff.1 {
                max_diff = p;
            }

            let mut visit = |n: usize| {
                if mask[n] && !visited[n] {
                    visited[n] = true;
                    stack.push(n);
                }
            };
            if x > 0 {
                visit(idx - 1);
            }
            if x + 1 < w {
                visit(idx + 1);
            }
            if y > 0 {
                visit(idx - w);
            }
            if y + 1 < h {
                visit(idx + w);
            }
        }

        if area < min_area || best.as_ref().is_some_and(|b| b.area >= area) {
            continue;
        }
        best = Some(Blob {
            area,
            centroid: (sum_x / area as f64, sum_y / area as f64),
            quad: Quad {
                top_left: min_sum,
                top_right: max_diff,
                bottom_right: max_sum,
                bottom_left: min_diff,
            },
        });
    }
    best
}

/// Finds a square of one colour nested inside a square of another.
#[derive(Debug, Clone)]
pub struct ColorMarkerDetector {
    config: MarkerConfig,
}

impl ColorMarkerDetector {
    pub fn new(config: MarkerConfig) -> Self {
        Self { config }
    }

    /// The outer and inner squares, if both are present and properly nested.
    pub fn find_squares(&self, frame: &RgbImage) -> Option<(Blob, Blob)> {
        let (width, height) = frame.dimensions();
        let outer_mask = threshold(frame, &self.config.outer);
        let outer = largest_blob(&outer_mask, width, height, self.config.min_area)?;
        let inner_mask = threshold(frame, &self.config.inner);
        let inner = largest_blob(&inner_mask, width, height, self.config.min_area)?;
        outer.quad.contains_quad(&inner.quad).then_some((outer, inner))
    }
}

impl TargetPerception for ColorMarkerDetector {
    fn find_target(&self, frame: &RgbImage) -> Option<Measurement> {
        let (outer, _inner) = self.find_squares(frame)?;
        let (left, right) = (outer.quad.left_edge(), outer.quad.right_edge());
        if left <= 0.0 || right <= 0.0 {
            return None;
        }
        let (width, height) = frame.dimensions();
        let dx = outer.centroid.0.round() as i32 - (width / 2) as i32;
        let dy = outer.centroid.1.round() as i32 - (height / 2) as i32;
        Some(Measurement {
            dx,
            dy,
            distance: self.config.distance_factor / ((left + right) / 2.0),
            ratio: left / right,
        })
    }
}
