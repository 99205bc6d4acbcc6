//! In-memory exposure: an image plane and a mask plane sharing one integer
//! bounding box in the parent (global) pixel frame.
//!
//! Arrays are indexed `[[row, col]]`, i.e. `[[y - y0, x - x0]]`.

use crate::types::CrowdError;
use ndarray::Array2;
use std::collections::BTreeMap;

// ─────────────────────────────────────────────────────────────
//  Integer bounding box
// ─────────────────────────────────────────────────────────────

/// Half-open integer box `[x0, x1) × [y0, y1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Box2I {
    pub x0: i32,
    pub y0: i32,
    pub x1: i32,
    pub y1: i32,
}

impl Box2I {
    pub fn new(x0: i32, y0: i32, width: usize, height: usize) -> Self {
        Self {
            x0,
            y0,
            x1: x0 + width as i32,
            y1: y0 + height as i32,
        }
    }

    pub fn width(&self) -> usize {
        (self.x1 - self.x0).max(0) as usize
    }

    pub fn height(&self) -> usize {
        (self.y1 - self.y0).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x0 && x < self.x1 && y >= self.y0 && y < self.y1
    }

    /// Intersection with `other`; may be empty.
    pub fn clip(&self, other: &Box2I) -> Box2I {
        let x0 = self.x0.max(other.x0);
        let y0 = self.y0.max(other.y0);
        Box2I {
            x0,
            y0,
            x1: self.x1.min(other.x1).max(x0),
            y1: self.y1.min(other.y1).max(y0),
        }
    }

    /// Parent-frame pixels in raster order (y outer, x inner).
    pub fn pixels(&self) -> impl Iterator<Item = (i32, i32)> + '_ {
        (self.y0..self.y1).flat_map(move |y| (self.x0..self.x1).map(move |x| (x, y)))
    }
}

// ─────────────────────────────────────────────────────────────
//  Mask planes
// ─────────────────────────────────────────────────────────────

/// Named mask planes → bit index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskPlaneDict {
    planes: BTreeMap<String, u32>,
}

impl Default for MaskPlaneDict {
    fn default() -> Self {
        let names = [
            "BAD", "SAT", "INTRP", "CR", "EDGE", "DETECTED", "DETECTED_NEGATIVE", "SUSPECT", "NO_DATA",
        ];
        Self {
            planes: names.iter().enumerate().map(|(bit, n)| (n.to_string(), bit as u32)).collect(),
        }
    }
}

impl MaskPlaneDict {
    /// Register a plane, returning its bit.  Existing planes keep their bit.
    pub fn add_plane(&mut self, name: &str) -> Result<u32, CrowdError> {
        if let Some(&bit) = self.planes.get(name) {
            return Ok(bit);
        }
        let bit = self.planes.len() as u32;
        if bit >= u32::BITS {
            return Err(CrowdError::Shape(format!("no free mask bit for plane {name}")));
        }
        self.planes.insert(name.to_string(), bit);
        Ok(bit)
    }

    pub fn bit(&self, name: &str) -> Option<u32> {
        self.planes.get(name).copied()
    }

    /// OR of the bits of every named plane.
    pub fn bit_mask<S: AsRef<str>>(&self, names: &[S]) -> Result<u32, CrowdError> {
        names.iter().try_fold(0u32, |mask, name| {
            let name = name.as_ref();
            self.bit(name)
                .map(|b| mask | (1 << b))
                .ok_or_else(|| CrowdError::UnknownMaskPlane(name.to_string()))
        })
    }
}

// ─────────────────────────────────────────────────────────────
//  Exposure
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Exposure {
    image: Array2<f64>,
    mask: Array2<u32>,
    x0: i32,
    y0: i32,
    planes: MaskPlaneDict,
}

impl Exposure {
    /// Blank exposure with its origin at (0, 0).
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            image: Array2::zeros((height, width)),
            mask: Array2::zeros((height, width)),
            x0: 0,
            y0: 0,
            planes: MaskPlaneDict::default(),
        }
    }

    pub fn from_arrays(image: Array2<f64>, mask: Array2<u32>) -> Result<Self, CrowdError> {
        if image.dim() != mask.dim() {
            return Err(CrowdError::Shape(format!(
                "image is {:?} but mask is {:?}", image.dim(), mask.dim()
            )));
        }
        Ok(Self { image, mask, x0: 0, y0: 0, planes: MaskPlaneDict::default() })
    }

    /// Place the exposure at (x0, y0) in the parent frame.
    pub fn with_origin(mut self, x0: i32, y0: i32) -> Self {
        self.x0 = x0;
        self.y0 = y0;
        self
    }

    pub fn bbox(&self) -> Box2I {
        Box2I::new(self.x0, self.y0, self.width(), self.height())
    }

    pub fn width(&self) -> usize {
        self.image.ncols()
    }

    pub fn height(&self) -> usize {
        self.image.nrows()
    }

    pub fn image(&self) -> &Array2<f64> {
        &self.image
    }

    pub fn image_mut(&mut self) -> &mut Array2<f64> {
        &mut self.image
    }

    pub fn mask(&self) -> &Array2<u32> {
        &self.mask
    }

    pub fn mask_planes(&self) -> &MaskPlaneDict {
        &self.planes
    }

    pub fn mask_planes_mut(&mut self) -> &mut MaskPlaneDict {
        &mut self.planes
    }

    pub fn plane_bit_mask<S: AsRef<str>>(&self, names: &[S]) -> Result<u32, CrowdError> {
        self.planes.bit_mask(names)
    }

    fn local_index(&self, x: i32, y: i32) -> Option<[usize; 2]> {
        if self.bbox().contains(x, y) {
            Some([(y - self.y0) as usize, (x - self.x0) as usize])
        } else {
            None
        }
    }

    /// Intensity at parent pixel (x, y).
    pub fn get_image(&self, x: i32, y: i32) -> Option<f64> {
        self.local_index(x, y).map(|idx| self.image[idx])
    }

    /// Mask word at parent pixel (x, y).
    pub fn get_mask(&self, x: i32, y: i32) -> Option<u32> {
        self.local_index(x, y).map(|idx| self.mask[idx])
    }

    pub fn set_image(&mut self, x: i32, y: i32, value: f64) -> bool {
        match self.local_index(x, y) {
            Some(idx) => {
                self.image[idx] = value;
                true
            }
            None => false,
        }
    }

    /// Set the named planes' bits at parent pixel (x, y).
    pub fn set_mask_planes(&mut self, x: i32, y: i32, names: &[&str]) -> Result<bool, CrowdError> {
        let bits = self.planes.bit_mask(names)?;
        Ok(match self.local_index(x, y) {
            Some(idx) => {
                self.mask[idx] |= bits;
                true
            }
            None => false,
        })
    }
}
