//! Model images built from fitted catalogs.
//!
//! `render_model` paints `flux × PSF` for every record; `subtract_model`
//! removes that model from an exposure in place.  [`ReplacedSource`] puts
//! one source back into a model-subtracted exposure for as long as the
//! guard lives.

use crate::catalog::{FluxKey, SourceCatalog, SourceRecord};
use crate::image::{Box2I, Exposure};
use crate::psf::{Psf, PsfStamp};
use crate::types::CrowdError;
use ndarray::Array2;
use std::ops::Deref;

/// `image += scale · stamp` over the overlap of the stamp and `bbox`, the
/// parent-frame box that `image` covers.
pub fn add_scaled_stamp(image: &mut Array2<f64>, bbox: Box2I, stamp: &PsfStamp, scale: f64) {
    let overlap = stamp.bbox().clip(&bbox);
    for (x, y) in overlap.pixels() {
        if let Some(value) = stamp.get_parent(x, y) {
            image[[(y - bbox.y0) as usize, (x - bbox.x0) as usize]] += scale * value;
        }
    }
}

/// Model image with the exposure's shape.  Records whose flux is not
/// finite (e.g. never fitted) are skipped.
pub fn render_model(exposure: &Exposure, psf: &dyn Psf, catalog: &SourceCatalog, flux_key: FluxKey) -> Array2<f64> {
    let bbox = exposure.bbox();
    let mut model = Array2::zeros((exposure.height(), exposure.width()));
    for rec in catalog {
        let flux = rec.get(flux_key);
        if !flux.is_finite() {
            continue;
        }
        let (x, y) = rec.centroid();
        add_scaled_stamp(&mut model, bbox, &psf.compute_image(x, y), flux);
    }
    model
}

/// Subtract the catalog model from `exposure` and return the model.
pub fn subtract_model(
    exposure: &mut Exposure,
    psf: &dyn Psf,
    catalog: &SourceCatalog,
    flux_key: FluxKey,
) -> Array2<f64> {
    let model = render_model(exposure, psf, catalog, flux_key);
    *exposure.image_mut() -= &model;
    model
}

// ─────────────────────────────────────────────────────────────
//  Scoped re-insertion
// ─────────────────────────────────────────────────────────────

/// A source added back into an exposure; removed again on drop.
pub struct ReplacedSource<'e> {
    exposure: &'e mut Exposure,
    stamp: PsfStamp,
    flux: f64,
}

impl ReplacedSource<'_> {
    pub fn flux(&self) -> f64 {
        self.flux
    }

    pub fn stamp(&self) -> &PsfStamp {
        &self.stamp
    }
}

impl Deref for ReplacedSource<'_> {
    type Target = Exposure;

    fn deref(&self) -> &Exposure {
        &*self.exposure
    }
}

impl Drop for ReplacedSource<'_> {
    fn drop(&mut self) {
        let bbox = self.exposure.bbox();
        add_scaled_stamp(self.exposure.image_mut(), bbox, &self.stamp, -self.flux);
    }
}

/// Add `record`'s fitted source back into `exposure` until the returned
/// guard is dropped.
pub fn replace_source<'e>(
    exposure: &'e mut Exposure,
    psf: &dyn Psf,
    record: &SourceRecord,
    flux_key: FluxKey,
) -> Result<ReplacedSource<'e>, CrowdError> {
    let flux = record.get(flux_key);
    if !flux.is_finite() {
        return Err(CrowdError::InvalidOption(format!("cannot re-insert a source with flux {flux}")));
    }
    let (x, y) = record.centroid();
    let stamp = psf.compute_image(x, y);
    let bbox = exposure.bbox();
    add_scaled_stamp(exposure.image_mut(), bbox, &stamp, flux);
    Ok(ReplacedSource { exposure, stamp, flux })
}
