//! Re-centroiding sources on a neighbour-subtracted image.
//!
//! Every fitted source is subtracted, then each one in turn is put back
//! alone and measured with an intensity-weighted first moment over a square
//! window around its catalog position.

use crate::catalog::{FluxKey, PointKey, SourceCatalog};
use crate::image::{Box2I, Exposure};
use crate::model::{replace_source, subtract_model};
use crate::psf::Psf;
use crate::types::{CrowdError, DEFAULT_REJECTION_PLANES};

/// First-moment centroid of the positive, unrejected pixels within
/// `radius` of `(x, y)`.  `None` if the window holds no positive signal.
pub fn first_moment(exposure: &Exposure, x: f64, y: f64, radius: usize, rejection_mask: u32) -> Option<(f64, f64)> {
    let r = radius as i32;
    let cx = (x + 0.5).floor() as i32;
    let cy = (y + 0.5).floor() as i32;
    let side = 2 * radius + 1;
    let window = Box2I::new(cx - r, cy - r, side, side).clip(&exposure.bbox());

    let mut total = 0.0;
    let mut sx = 0.0;
    let mut sy = 0.0;
    for (px, py) in window.pixels() {
        if exposure.get_mask(px, py).unwrap_or(0) & rejection_mask != 0 {
            continue;
        }
        let value = exposure.get_image(px, py).unwrap_or(0.0);
        if value <= 0.0 {
            continue;
        }
        total += value;
        sx += value * px as f64;
        sy += value * py as f64;
    }

    (total > 0.0).then(|| (sx / total, sy / total))
}

/// Measure every fitted source on its own and store the result in
/// `centroid_key`.
///
/// Works on a copy of `exposure`.  Records without a finite flux, or
/// whose window carries no signal, keep their previous `centroid_key`
/// value.  Returns the number of sources measured.
pub fn recentroid(
    exposure: &Exposure,
    psf: &dyn Psf,
    catalog: &mut SourceCatalog,
    flux_key: FluxKey,
    centroid_key: PointKey,
    radius: usize,
) -> Result<usize, CrowdError> {
    let rejection_mask = exposure.plane_bit_mask(DEFAULT_REJECTION_PLANES.as_slice())?;
    let mut residual = exposure.clone();
    subtract_model(&mut residual, psf, catalog, flux_key);

    let mut measured = 0;
    for index in 0..catalog.len() {
        let Some(record) = catalog.get(index) else {
            continue;
        };
        if !record.get(flux_key).is_finite() {
            continue;
        }
        let (x, y) = record.centroid();
        let centroid = {
            let alone = replace_source(&mut residual, psf, record, flux_key)?;
            first_moment(&alone, x, y, radius, rejection_mask)
        };
        if let (Some(c), Some(record)) = (centroid, catalog.get_mut(index)) {
            record.set_point(centroid_key, c);
            measured += 1;
        }
    }
    Ok(measured)
}
