//! Solve tests — convergence semantics of the CG least-squares driver and
//! end-to-end flux / centroid recovery with catalog write-back.

use crowd::model::add_scaled_stamp;
use crowd::solve::solve_least_squares;
use crowd::*;
use sprs::TriMat;

// ─────────────────────────────────────────────────────────────
//  Helpers
// ─────────────────────────────────────────────────────────────

fn dense_to_csr(rows: &[&[f64]]) -> sprs::CsMat<f64> {
    let ncols = rows.first().map_or(0, |r| r.len());
    let mut tri = TriMat::new((rows.len(), ncols));
    for (i, row) in rows.iter().enumerate() {
        for (j, &v) in row.iter().enumerate() {
            if v != 0.0 {
                tri.add_triplet(i, j, v);
            }
        }
    }
    tri.to_csr()
}

fn mat_vec(rows: &[&[f64]], x: &[f64]) -> Vec<f64> {
    rows.iter().map(|r| r.iter().zip(x).map(|(a, b)| a * b).sum()).collect()
}

/// FWHM 4 → σ ≈ 1.70, radius 7, 15 × 15 stamps.
fn make_psf() -> GaussianPsf {
    GaussianPsf::from_fwhm(4.0).unwrap()
}

/// Noise-free exposure holding `flux × PSF` at each position.
fn inject_stars(width: usize, height: usize, psf: &GaussianPsf, stars: &[(f64, f64, f64)]) -> Exposure {
    let mut exposure = Exposure::new(width, height);
    let bbox = exposure.bbox();
    for &(x, y, flux) in stars {
        add_scaled_stamp(exposure.image_mut(), bbox, &psf.compute_image(x, y), flux);
    }
    exposure
}

fn relative_error(got: f64, want: f64) -> f64 {
    ((got - want) / want).abs()
}

// ─────────────────────────────────────────────────────────────
//  Convergence semantics
// ─────────────────────────────────────────────────────────────

#[test]
fn diagonally_dominant_system_converges() {
    let rows: [&[f64]; 5] = [
        &[4.0, -1.0, 0.0, 0.0],
        &[-1.0, 4.0, -1.0, 0.0],
        &[0.0, -1.0, 4.0, -1.0],
        &[0.0, 0.0, -1.0, 4.0],
        &[1.0, 1.0, 1.0, 1.0],
    ];
    let x_true = [1.0, 2.0, 3.0, 4.0];
    let b = mat_vec(&rows, &x_true);
    let a = dense_to_csr(&rows);

    let options = FitOptions::default().with_tolerance(1e-10);
    let solution = solve_least_squares(&a, &b, &options).unwrap();

    assert_eq!(solution.status, SolveStatus::Converged);
    assert!(solution.iterations > 0);
    assert!(solution.iterations < options.max_iterations);
    for (got, want) in solution.x.iter().zip(&x_true) {
        assert!((got - want).abs() < 1e-6, "got {got}, want {want}");
    }
}

#[test]
fn exhausting_the_iteration_cap_is_not_convergence() {
    let rows: [&[f64]; 3] = [&[1.0, 0.0, 0.0], &[0.0, 2.0, 0.0], &[0.0, 0.0, 3.0]];
    let a = dense_to_csr(&rows);
    let b = [1.0, 1.0, 1.0];

    let options = FitOptions::default().with_tolerance(1e-12).with_max_iterations(1);
    let solution = solve_least_squares(&a, &b, &options).unwrap();

    assert_eq!(solution.status, SolveStatus::NotConverged);
    assert_eq!(solution.iterations, 1);
    // The unconverged iterate is still handed back.
    assert_eq!(solution.x.len(), 3);
    assert!(solution.x.iter().all(|v| v.is_finite()));
    assert!(solution.residual_norm > 0.0);
}

#[test]
fn overdetermined_system_gives_least_squares_answer() {
    // Fit y = c to three samples: the answer is their mean.
    let rows: [&[f64]; 3] = [&[1.0], &[1.0], &[1.0]];
    let a = dense_to_csr(&rows);
    let solution = solve_least_squares(&a, &[1.0, 2.0, 6.0], &FitOptions::default()).unwrap();
    assert!((solution.x[0] - 3.0).abs() < 1e-9);
    assert!(solution.status == SolveStatus::Converged);
}

#[test]
fn data_length_must_match_rows() {
    let rows: [&[f64]; 2] = [&[1.0], &[1.0]];
    let a = dense_to_csr(&rows);
    assert!(matches!(
        solve_least_squares(&a, &[1.0], &FitOptions::default()),
        Err(CrowdError::Shape(_))
    ));
}

#[test]
fn zero_data_solves_to_zero() {
    let rows: [&[f64]; 2] = [&[1.0, 0.5], &[0.0, 1.0]];
    let a = dense_to_csr(&rows);
    let solution = solve_least_squares(&a, &[0.0, 0.0], &FitOptions::default()).unwrap();
    assert_eq!(solution.x, vec![0.0, 0.0]);
    assert_eq!(solution.iterations, 0);
    assert_eq!(solution.status, SolveStatus::Converged);
}

// ─────────────────────────────────────────────────────────────
//  End-to-end photometry
// ─────────────────────────────────────────────────────────────

#[test]
fn isolated_star_flux_is_written_back() {
    let psf = make_psf();
    let exposure = inject_stars(64, 64, &psf, &[(31.3, 30.6, 1000.0)]);

    let mut schema = Schema::new();
    let flux_key = schema.add_scalar("crowd_flux");
    let mut catalog = SourceCatalog::new(schema);
    catalog.add_record(31.3, 30.6);

    {
        let mut matrix = CrowdedFieldMatrix::from_catalog(
            &exposure,
            &psf,
            Some(&mut catalog),
            CatalogKeys::flux_only(flux_key),
            FitOptions::default(),
        )
        .unwrap();
        let result = matrix.solve().unwrap();
        assert!(result.converged());
        assert!(relative_error(result.sources[0].flux, 1000.0) < 0.01);
        assert_eq!(result.sources[0].dx, None);
        assert_eq!(matrix.iterations(), Some(result.iterations));
    }

    let flux = catalog.get(0).unwrap().get(flux_key);
    assert!(relative_error(flux, 1000.0) < 0.01, "flux {flux}");
}

#[test]
fn blended_stars_are_separated() {
    let psf = make_psf();
    let stars = [(30.0, 30.0, 1000.0), (33.0, 31.0, 500.0), (28.5, 34.2, 250.0)];
    let exposure = inject_stars(64, 64, &psf, &stars);

    let x: Vec<f64> = stars.iter().map(|s| s.0).collect();
    let y: Vec<f64> = stars.iter().map(|s| s.1).collect();
    let options = FitOptions::default().with_tolerance(1e-10);
    let mut matrix = CrowdedFieldMatrix::from_positions(&exposure, &psf, &x, &y, options).unwrap();
    let result = matrix.solve().unwrap();

    assert!(result.converged());
    for (fit, star) in result.sources.iter().zip(&stars) {
        assert!(relative_error(fit.flux, star.2) < 0.01, "flux {} vs {}", fit.flux, star.2);
    }
}

#[test]
fn faint_blend_converges_to_the_same_relative_accuracy() {
    let psf = make_psf();
    let stars: Vec<(f64, f64, f64)> = [(28.0, 30.0), (31.0, 30.5), (29.5, 33.0), (33.5, 32.0), (26.5, 27.5), (32.0, 27.0)]
        .iter()
        .enumerate()
        .map(|(i, &(x, y))| (x, y, 1e-4 * (i + 1) as f64))
        .collect();
    let exposure = inject_stars(64, 64, &psf, &stars);

    let x: Vec<f64> = stars.iter().map(|s| s.0).collect();
    let y: Vec<f64> = stars.iter().map(|s| s.1).collect();
    let mut matrix = CrowdedFieldMatrix::from_positions(&exposure, &psf, &x, &y, FitOptions::default()).unwrap();
    let result = matrix.solve().unwrap();

    assert!(result.converged());
    assert!(result.iterations > 1);
    for (fit, star) in result.sources.iter().zip(&stars) {
        assert!(relative_error(fit.flux, star.2) < 0.01, "flux {} vs {}", fit.flux, star.2);
    }
}

#[test]
fn centroid_offsets_are_in_pixels_without_a_flux_estimate() {
    let psf = make_psf();
    let exposure = inject_stars(64, 64, &psf, &[(30.3, 30.0, 1000.0)]);

    let options = FitOptions::default().with_mode(FitMode::FluxAndCentroid);
    let mut matrix = CrowdedFieldMatrix::from_positions(&exposure, &psf, &[30.0], &[30.0], options).unwrap();
    let result = matrix.solve().unwrap();

    let fit = result.sources[0];
    let dx = fit.dx.unwrap();
    let dy = fit.dy.unwrap();
    assert!(dx > 0.1 && dx < 0.5, "dx {dx}");
    assert!(dy.abs() < 0.05, "dy {dy}");
    assert!(relative_error(fit.flux, 1000.0) < 0.1);
}

#[test]
fn centroid_offsets_do_not_depend_on_the_flux_estimate() {
    let psf = make_psf();
    let exposure = inject_stars(64, 64, &psf, &[(30.3, 29.8, 1000.0)]);
    let options = FitOptions::default().with_mode(FitMode::FluxAndCentroid).with_tolerance(1e-12);

    let mut offsets = Vec::new();
    for estimate in [200.0, 1000.0, 5000.0] {
        let mut matrix = CrowdedFieldMatrix::new(&exposure, &psf, options.clone()).unwrap();
        matrix.add_source_with_flux(30.0, 30.0, estimate).unwrap();
        let fit = matrix.solve().unwrap().sources[0];
        offsets.push((fit.dx.unwrap(), fit.dy.unwrap()));
    }
    for &(dx, dy) in &offsets[1..] {
        assert!((dx - offsets[0].0).abs() < 1e-4, "dx {dx} vs {}", offsets[0].0);
        assert!((dy - offsets[0].1).abs() < 1e-4, "dy {dy} vs {}", offsets[0].1);
    }
}

#[test]
fn centroid_fit_moves_towards_the_truth() {
    let psf = make_psf();
    let truth = (32.3, 31.8);
    let exposure = inject_stars(64, 64, &psf, &[(truth.0, truth.1, 1000.0)]);

    let mut schema = Schema::new();
    let flux_key = schema.add_scalar("crowd_flux");
    let estimate_key = schema.add_scalar("flux_estimate");
    let centroid_key = schema.add_point("crowd_centroid");
    let mut catalog = SourceCatalog::new(schema);
    catalog.add_record(32.0, 32.0).set(estimate_key, 1000.0);

    let keys = CatalogKeys {
        flux: flux_key,
        flux_estimate: Some(estimate_key),
        centroid_out: Some(centroid_key),
    };
    let options = FitOptions::default().with_mode(FitMode::FluxAndCentroid);
    {
        let mut matrix = CrowdedFieldMatrix::from_catalog(&exposure, &psf, Some(&mut catalog), keys, options).unwrap();
        assert_eq!(matrix.column_count(), 3);
        let result = matrix.solve().unwrap();
        assert!(result.converged());
        assert!(result.sources[0].dx.unwrap() > 0.0);
        assert!(result.sources[0].dy.unwrap() < 0.0);
    }

    let rec = catalog.get(0).unwrap();
    let (fx, fy) = rec.get_point(centroid_key);
    let before = ((32.0 - truth.0).powi(2) + (32.0 - truth.1).powi(2)).sqrt();
    let after = ((fx - truth.0).powi(2) + (fy - truth.1).powi(2)).sqrt();
    assert!(after < before, "centroid error {after} not below {before}");
    // Input centroid is left alone.
    assert_eq!(rec.centroid(), (32.0, 32.0));
    assert!(relative_error(rec.get(flux_key), 1000.0) < 0.1);
}

#[test]
fn missing_catalog_is_a_precondition_failure() {
    let psf = make_psf();
    let exposure = Exposure::new(16, 16);
    let mut schema = Schema::new();
    let flux_key = schema.add_scalar("crowd_flux");
    let err = CrowdedFieldMatrix::from_catalog(
        &exposure,
        &psf,
        None,
        CatalogKeys::flux_only(flux_key),
        FitOptions::default(),
    )
    .err();
    assert_eq!(err, Some(CrowdError::MissingCatalog));
}

#[test]
fn non_convergence_still_writes_the_catalog() {
    let psf = make_psf();
    let stars = [(30.0, 30.0, 1000.0), (32.0, 30.0, 800.0), (31.0, 32.0, 600.0)];
    let exposure = inject_stars(64, 64, &psf, &stars);

    let mut schema = Schema::new();
    let flux_key = schema.add_scalar("crowd_flux");
    let mut catalog = SourceCatalog::new(schema);
    for s in &stars {
        catalog.add_record(s.0, s.1);
    }

    let options = FitOptions::default().with_tolerance(1e-14).with_max_iterations(1);
    let status = {
        let mut matrix = CrowdedFieldMatrix::from_catalog(
            &exposure, &psf, Some(&mut catalog), CatalogKeys::flux_only(flux_key), options,
        )
        .unwrap();
        matrix.solve().unwrap().status
    };
    assert_eq!(status, SolveStatus::NotConverged);
    assert!(catalog.iter().all(|rec| rec.get(flux_key).is_finite()));
}

#[test]
fn repeated_solve_reuses_the_matrix() {
    let psf = make_psf();
    let exposure = inject_stars(48, 48, &psf, &[(20.0, 20.0, 300.0)]);
    let mut matrix = CrowdedFieldMatrix::from_positions(&exposure, &psf, &[20.0], &[20.0], FitOptions::default()).unwrap();

    let first = matrix.solve().unwrap();
    let entries = matrix.matrix_entries().len();
    let second = matrix.solve().unwrap();
    assert_eq!(matrix.matrix_entries().len(), entries);
    assert_eq!(first.parameters, second.parameters);
    assert_eq!(matrix.state(), MatrixState::Solved);
}

#[test]
fn solve_reports_shape_and_outcome() {
    let psf = make_psf();
    let exposure = inject_stars(48, 48, &psf, &[(20.0, 20.0, 300.0)]);
    let sink = RecordingSink::new();
    let mut matrix = CrowdedFieldMatrix::from_positions(&exposure, &psf, &[20.0], &[20.0], FitOptions::default())
        .unwrap()
        .with_sink(&sink);
    let result = matrix.solve().unwrap();

    let side = psf.stamp_size();
    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0], Diagnostic::MatrixShape { rows: side * side, columns: 1, entries: side * side });
    match events[1] {
        Diagnostic::SolveFinished { iterations, converged, .. } => {
            assert_eq!(iterations, result.iterations);
            assert!(converged);
        }
        ref other => panic!("unexpected diagnostic {other:?}"),
    }
}
