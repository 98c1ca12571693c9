//! Face alignment via a 4-DOF similarity transform.
//!
//! Warps a detected face onto the canonical 112×112 ArcFace crop using the
//! five reference landmarks.

use image::{Rgb, RgbImage};

/// ArcFace reference landmarks for a 112×112 output.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: u32 = 112;

const DEGENERATE_EPS: f32 = 1e-8;

/// Scale + rotation + translation:
///
/// ```text
/// | a  -b  tx |
/// | b   a  ty |
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Similarity {
    /// Least-squares similarity mapping `src` onto `dst`.
    ///
    /// Closed form on centred coordinates; reflections are excluded. If the
    /// source points coincide only the translation between centroids is kept.
    pub fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Self {
        let (scx, scy) = centroid(src);
        let (dcx, dcy) = centroid(dst);

        let mut dot = 0.0f32;
        let mut cross = 0.0f32;
        let mut spread = 0.0f32;
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
            let (sx, sy) = (sx - scx, sy - scy);
            let (dx, dy) = (dx - dcx, dy - dcy);
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
            spread += sx * sx + sy * sy;
        }

        let (a, b) = if spread > DEGENERATE_EPS {
            (dot / spread, cross / spread)
        } else {
            (1.0, 0.0)
        };

        Self {
            a,
            b,
            tx: dcx - (a * scx - b * scy),
            ty: dcy - (b * scx + a * scy),
        }
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    /// Inverse transform, `None` when the scale collapses to zero.
    pub fn inverse(&self) -> Option<Self> {
        let det = self.a * self.a + self.b * self.b;
        if det <= DEGENERATE_EPS {
            return None;
        }
        let a = self.a / det;
        let b = -self.b / det;
        Some(Self {
            a,
            b,
            tx: -(a * self.tx - b * self.ty),
            ty: -(b * self.tx + a * self.ty),
        })
    }
}

fn centroid(points: &[(f32, f32); 5]) -> (f32, f32) {
    let (sx, sy) = points
        .iter()
        .fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
    (sx / points.len() as f32, sy / points.len() as f32)
}

/// Align a face to the canonical 112×112 crop.
///
/// Pixels that map outside the source image are black.
pub fn align_face(image: &RgbImage, landmarks: &[(f32, f32); 5]) -> RgbImage {
    let forward = Similarity::estimate(landmarks, &REFERENCE_LANDMARKS_112);
    let Some(backward) = forward.inverse() else {
        tracing::warn!("degenerate landmark transform; resizing whole image instead");
        return image::imageops::resize(
            image,
            ALIGNED_SIZE,
            ALIGNED_SIZE,
            image::imageops::FilterType::Triangle,
        );
    };

    RgbImage::from_fn(ALIGNED_SIZE, ALIGNED_SIZE, |u, v| {
        let (x, y) = backward.apply((u as f32, v as f32));
        sample_bilinear(image, x, y)
    })
}

fn sample_bilinear(image: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (w, h) = (image.width() as i64, image.height() as i64);
    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let fetch = |px: i64, py: i64| -> [f32; 3] {
        if px < 0 || py < 0 || px >= w || py >= h {
            return [0.0; 3];
        }
        let p = image.get_pixel(px as u32, py as u32);
        [p[0] as f32, p[1] as f32, p[2] as f32]
    };

    let tl = fetch(x0, y0);
    let tr = fetch(x0 + 1, y0);
    let bl = fetch(x0, y0 + 1);
    let br = fetch(x0 + 1, y0 + 1);

    Rgb(std::array::from_fn(|c| {
        let top = tl[c] * (1.0 - fx) + tr[c] * fx;
        let bottom = bl[c] * (1.0 - fx) + br[c] * fx;
        (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8
    }))
}
