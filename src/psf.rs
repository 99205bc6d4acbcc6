//! PSF models and the stamps they produce.

use crate::image::Box2I;
use crate::types::CrowdError;
use ndarray::Array2;
use std::fmt::Debug;

/// Rectangular PSF realisation placed at an integer origin in the parent
/// frame.  `array[[iy, ix]]` is the value at parent pixel
/// `(origin.0 + ix, origin.1 + iy)`.
#[derive(Debug, Clone, PartialEq)]
pub struct PsfStamp {
    pub array: Array2<f64>,
    pub origin: (i32, i32),
}

impl PsfStamp {
    pub fn width(&self) -> usize {
        self.array.ncols()
    }

    pub fn height(&self) -> usize {
        self.array.nrows()
    }

    pub fn bbox(&self) -> Box2I {
        Box2I::new(self.origin.0, self.origin.1, self.width(), self.height())
    }

    /// Stamp-local index → parent pixel.
    pub fn index_to_position(&self, ix: usize, iy: usize) -> (i32, i32) {
        (self.origin.0 + ix as i32, self.origin.1 + iy as i32)
    }

    pub fn get_local(&self, ix: usize, iy: usize) -> Option<f64> {
        self.array.get([iy, ix]).copied()
    }

    pub fn get_parent(&self, x: i32, y: i32) -> Option<f64> {
        if self.bbox().contains(x, y) {
            self.get_local((x - self.origin.0) as usize, (y - self.origin.1) as usize)
        } else {
            None
        }
    }

    pub fn sum(&self) -> f64 {
        self.array.sum()
    }
}

/// A PSF model that can be realised at any sub-pixel position.
pub trait Psf: Debug {
    fn compute_image(&self, x: f64, y: f64) -> PsfStamp;
}

// ─────────────────────────────────────────────────────────────
//  Circular Gaussian
// ─────────────────────────────────────────────────────────────

const FWHM_PER_SIGMA: f64 = 2.354_820_045_030_949_3;

/// Circular Gaussian sampled at pixel centres, unit sum.
///
/// The stamp is `(2 r + 1)²` pixels centred on the pixel nearest the
/// source, so moving the source by one pixel moves the origin by one.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianPsf {
    sigma: f64,
    radius: usize,
}

impl GaussianPsf {
    pub fn new(sigma: f64, radius: usize) -> Result<Self, CrowdError> {
        if !(sigma.is_finite() && sigma > 0.0) {
            return Err(CrowdError::InvalidOption(format!("PSF sigma must be positive, got {sigma}")));
        }
        Ok(Self { sigma, radius })
    }

    /// Radius defaults to ⌈4σ⌉.
    pub fn from_fwhm(fwhm: f64) -> Result<Self, CrowdError> {
        let sigma = fwhm / FWHM_PER_SIGMA;
        Self::new(sigma, (4.0 * sigma).ceil().max(1.0) as usize)
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    pub fn radius(&self) -> usize {
        self.radius
    }

    pub fn stamp_size(&self) -> usize {
        2 * self.radius + 1
    }
}

impl Psf for GaussianPsf {
    fn compute_image(&self, x: f64, y: f64) -> PsfStamp {
        let r = self.radius as i32;
        // Round half up, so a unit nudge always moves the origin by one.
        let origin = ((x + 0.5).floor() as i32 - r, (y + 0.5).floor() as i32 - r);
        let n = self.stamp_size();
        let two_s2 = 2.0 * self.sigma * self.sigma;

        let mut array = Array2::from_shape_fn((n, n), |(iy, ix)| {
            let dx = (origin.0 + ix as i32) as f64 - x;
            let dy = (origin.1 + iy as i32) as f64 - y;
            (-(dx * dx + dy * dy) / two_s2).exp()
        });
        let total = array.sum();
        if total > 0.0 {
            array /= total;
        }
        PsfStamp { array, origin }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamp_is_normalised_and_centred() {
        let psf = GaussianPsf::from_fwhm(4.0).unwrap();
        let stamp = psf.compute_image(20.2, 30.7);
        assert!((stamp.sum() - 1.0).abs() < 1e-12);
        let r = psf.radius() as i32;
        assert_eq!(stamp.origin, (20 - r, 31 - r));
        assert_eq!(stamp.width(), psf.stamp_size());
        assert_eq!(stamp.index_to_position(0, 0), stamp.origin);
    }

    #[test]
    fn unit_nudge_shifts_origin_by_one() {
        let psf = GaussianPsf::from_fwhm(3.0).unwrap();
        let a = psf.compute_image(10.0, 10.0);
        let b = psf.compute_image(11.0, 10.0);
        assert_eq!(b.origin.0 - a.origin.0, 1);
        assert_eq!(b.origin.1, a.origin.1);
        assert!((a.get_parent(10, 10).unwrap() - b.get_parent(11, 10).unwrap()).abs() < 1e-15);
    }

    #[test]
    fn rejects_bad_sigma() {
        assert!(GaussianPsf::new(0.0, 3).is_err());
        assert!(GaussianPsf::new(f64::NAN, 3).is_err());
    }
}
