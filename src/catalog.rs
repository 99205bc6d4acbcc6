//! Minimal source catalog with schema-issued field handles.
//!
//! Every record carries a centroid.  Extra scalar fields (fluxes, flux
//! estimates) and 2D point fields (corrected centroids) are declared on a
//! [`Schema`] before the catalog is created and addressed through the
//! keys the schema returns.

use crate::types::CrowdError;

/// Handle to a scalar `f64` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FluxKey(usize);

/// Handle to a 2D `(x, y)` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PointKey(usize);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    scalars: Vec<String>,
    points: Vec<String>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a scalar field.  Re-declaring a name returns the existing key.
    pub fn add_scalar(&mut self, name: &str) -> FluxKey {
        match self.scalars.iter().position(|n| n == name) {
            Some(i) => FluxKey(i),
            None => {
                self.scalars.push(name.to_string());
                FluxKey(self.scalars.len() - 1)
            }
        }
    }

    /// Declare a point field.  Re-declaring a name returns the existing key.
    pub fn add_point(&mut self, name: &str) -> PointKey {
        match self.points.iter().position(|n| n == name) {
            Some(i) => PointKey(i),
            None => {
                self.points.push(name.to_string());
                PointKey(self.points.len() - 1)
            }
        }
    }

    pub fn find_scalar(&self, name: &str) -> Option<FluxKey> {
        self.scalars.iter().position(|n| n == name).map(FluxKey)
    }

    pub fn find_point(&self, name: &str) -> Option<PointKey> {
        self.points.iter().position(|n| n == name).map(PointKey)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    centroid: (f64, f64),
    scalars: Vec<f64>,
    points: Vec<(f64, f64)>,
}

impl SourceRecord {
    pub fn centroid(&self) -> (f64, f64) {
        self.centroid
    }

    pub fn set_centroid(&mut self, x: f64, y: f64) {
        self.centroid = (x, y);
    }

    /// Scalar field value; `NaN` until set.
    pub fn get(&self, key: FluxKey) -> f64 {
        self.scalars[key.0]
    }

    pub fn set(&mut self, key: FluxKey, value: f64) {
        self.scalars[key.0] = value;
    }

    /// Point field value; `(NaN, NaN)` until set.
    pub fn get_point(&self, key: PointKey) -> (f64, f64) {
        self.points[key.0]
    }

    pub fn set_point(&mut self, key: PointKey, value: (f64, f64)) {
        self.points[key.0] = value;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceCatalog {
    schema: Schema,
    records: Vec<SourceRecord>,
}

impl SourceCatalog {
    pub fn new(schema: Schema) -> Self {
        Self { schema, records: Vec::new() }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Append a record at `(x, y)` with every field unset.
    pub fn add_record(&mut self, x: f64, y: f64) -> &mut SourceRecord {
        self.records.push(SourceRecord {
            centroid: (x, y),
            scalars: vec![f64::NAN; self.schema.scalars.len()],
            points: vec![(f64::NAN, f64::NAN); self.schema.points.len()],
        });
        let last = self.records.len() - 1;
        &mut self.records[last]
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&SourceRecord> {
        self.records.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut SourceRecord> {
        self.records.get_mut(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SourceRecord> {
        self.records.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, SourceRecord> {
        self.records.iter_mut()
    }

    pub fn centroids(&self) -> Vec<(f64, f64)> {
        self.records.iter().map(|r| r.centroid).collect()
    }

    /// Check that keys handed in from elsewhere belong to this schema.
    pub fn check_keys(&self, keys: &CatalogKeys) -> Result<(), CrowdError> {
        let n_scalar = self.schema.scalars.len();
        let n_point = self.schema.points.len();
        let scalar_ok = |k: FluxKey| k.0 < n_scalar;
        if !scalar_ok(keys.flux) || !keys.flux_estimate.map_or(true, scalar_ok) {
            return Err(CrowdError::Shape("flux key is not part of the catalog schema".into()));
        }
        if !keys.centroid_out.map_or(true, |k| k.0 < n_point) {
            return Err(CrowdError::Shape("centroid key is not part of the catalog schema".into()));
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a SourceCatalog {
    type Item = &'a SourceRecord;
    type IntoIter = std::slice::Iter<'a, SourceRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

/// Fields the matrix engine reads from and writes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogKeys {
    /// Fitted flux is written here.
    pub flux: FluxKey,
    /// Linearisation flux for centroid derivatives.
    pub flux_estimate: Option<FluxKey>,
    /// Corrected centroid (input centroid + fitted offset) is written here.
    pub centroid_out: Option<PointKey>,
}

impl CatalogKeys {
    pub fn flux_only(flux: FluxKey) -> Self {
        Self { flux, flux_estimate: None, centroid_out: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_start_unset() {
        let mut schema = Schema::new();
        let flux = schema.add_scalar("psf_flux");
        let cen = schema.add_point("centroid_fit");
        assert_eq!(schema.add_scalar("psf_flux"), flux);
        let mut cat = SourceCatalog::new(schema);
        let rec = cat.add_record(3.0, 4.0);
        assert!(rec.get(flux).is_nan());
        rec.set(flux, 12.0);
        rec.set_point(cen, (1.0, 2.0));
        assert_eq!(cat.get(0).unwrap().get(flux), 12.0);
        assert_eq!(cat.get(0).unwrap().get_point(cen), (1.0, 2.0));
    }

    #[test]
    fn foreign_keys_are_rejected() {
        let mut other = Schema::new();
        other.add_scalar("a");
        let foreign = other.add_scalar("b");
        let mut schema = Schema::new();
        schema.add_scalar("flux");
        let cat = SourceCatalog::new(schema);
        assert!(cat.check_keys(&CatalogKeys::flux_only(foreign)).is_err());
    }
}
