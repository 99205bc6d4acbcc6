//! Dense index bookkeeping for the design matrix.
//!
//! Rows are image pixels, discovered as sources touch them; columns are
//! per-source parameters.  Both are numbered in first-seen order so the
//! sparse system never carries rows for untouched pixels.

use crate::types::{CrowdError, ParameterSlot};
use std::collections::hash_map::Entry;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct ParameterTracker {
    n_parameters: usize,
    n_sources: usize,
    /// image (x, y) → matrix row
    pixel_rows: HashMap<(i32, i32), usize>,
    /// row → image (x, y)
    pixels: Vec<(i32, i32)>,
    /// (source, slot) → matrix column
    parameter_columns: HashMap<(usize, ParameterSlot), usize>,
    /// column → (source, slot)
    parameters: Vec<(usize, ParameterSlot)>,
}

impl ParameterTracker {
    /// `n_parameters` is clamped to the available slots (1..=3).
    pub fn new(n_parameters: usize) -> Self {
        Self {
            n_parameters: n_parameters.clamp(1, ParameterSlot::ALL.len()),
            n_sources: 0,
            pixel_rows: HashMap::new(),
            pixels: Vec::new(),
            parameter_columns: HashMap::new(),
            parameters: Vec::new(),
        }
    }

    /// Register the parameter columns of `source_id`, in slot order.
    ///
    /// Registering the same id twice leaves the existing columns untouched.
    pub fn add_source(&mut self, source_id: usize) {
        let mut added = false;
        for &slot in &ParameterSlot::ALL[..self.n_parameters] {
            let next = self.parameters.len();
            if let Entry::Vacant(e) = self.parameter_columns.entry((source_id, slot)) {
                e.insert(next);
                self.parameters.push((source_id, slot));
                added = true;
            }
        }
        if added {
            self.n_sources += 1;
        }
    }

    /// Row of pixel (x, y), minting a new one on first sight.
    pub fn mint_or_lookup_pixel_row(&mut self, x: i32, y: i32) -> usize {
        let next = self.pixels.len();
        let row = *self.pixel_rows.entry((x, y)).or_insert(next);
        if row == next {
            self.pixels.push((x, y));
        }
        row
    }

    /// Row of pixel (x, y) if some source touched it.  Never mutates.
    pub fn lookup_pixel_row(&self, x: i32, y: i32) -> Option<usize> {
        self.pixel_rows.get(&(x, y)).copied()
    }

    pub fn parameter_column(&self, source_id: usize, slot: ParameterSlot) -> Result<usize, CrowdError> {
        self.parameter_columns
            .get(&(source_id, slot))
            .copied()
            .ok_or(CrowdError::ParameterNotRegistered { source: source_id, slot: slot.index() })
    }

    pub fn row_count(&self) -> usize {
        self.pixels.len()
    }

    pub fn column_count(&self) -> usize {
        self.parameters.len()
    }

    pub fn n_parameters(&self) -> usize {
        self.n_parameters
    }

    pub fn source_count(&self) -> usize {
        self.n_sources
    }

    /// Pixel of each row, indexed by row.
    pub fn pixels(&self) -> &[(i32, i32)] {
        &self.pixels
    }

    /// `((x, y), row)` pairs in row order.
    pub fn pixel_mapping(&self) -> Vec<((i32, i32), usize)> {
        self.pixels.iter().enumerate().map(|(row, &p)| (p, row)).collect()
    }

    /// `((source, slot), column)` pairs in column order.
    pub fn parameter_mapping(&self) -> Vec<((usize, ParameterSlot), usize)> {
        self.parameters.iter().enumerate().map(|(col, &k)| (k, col)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_rows_follow_first_seen_order() {
        let mut t = ParameterTracker::new(1);
        assert_eq!(t.mint_or_lookup_pixel_row(5, 7), 0);
        assert_eq!(t.mint_or_lookup_pixel_row(-1, 3), 1);
        assert_eq!(t.mint_or_lookup_pixel_row(5, 7), 0);
        assert_eq!(t.row_count(), 2);
        assert_eq!(t.lookup_pixel_row(-1, 3), Some(1));
        assert_eq!(t.lookup_pixel_row(0, 0), None);
        assert_eq!(t.row_count(), 2);
    }

    #[test]
    fn centroid_mode_mints_three_columns_per_source() {
        let mut t = ParameterTracker::new(3);
        t.add_source(0);
        t.add_source(1);
        assert_eq!(t.column_count(), 6);
        assert_eq!(t.parameter_column(1, ParameterSlot::Flux).unwrap(), 3);
        assert_eq!(t.parameter_column(1, ParameterSlot::Dy).unwrap(), 5);
    }

    #[test]
    fn unregistered_parameter_is_an_error() {
        let mut t = ParameterTracker::new(1);
        t.add_source(0);
        assert_eq!(
            t.parameter_column(0, ParameterSlot::Dx),
            Err(CrowdError::ParameterNotRegistered { source: 0, slot: 1 })
        );
        assert!(t.parameter_column(4, ParameterSlot::Flux).is_err());
    }

    #[test]
    fn re_registering_a_source_keeps_its_columns() {
        let mut t = ParameterTracker::new(1);
        t.add_source(2);
        t.add_source(2);
        assert_eq!(t.column_count(), 1);
        assert_eq!(t.source_count(), 1);
    }
}
