//! Function-level laws: every analytic gradient agrees with a central
//! finite difference, and the closed-form identities hold.

use approx::assert_relative_eq;
use doseplan::{CsrMatrix, DoseArtifact, Entry, EntryMeta, FunctionType};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Central finite difference gradient.
fn finite_diff_grad(f: impl Fn(&[f64]) -> f64, x: &[f64], h: f64) -> Vec<f64> {
    let n = x.len();
    let mut grad = vec![0.0; n];
    for i in 0..n {
        let mut xp = x.to_vec();
        let mut xm = x.to_vec();
        xp[i] += h;
        xm[i] -= h;
        grad[i] = (f(&xp) - f(&xm)) / (2.0 * h);
    }
    grad
}

/// Random sparse matrix with `per_row` nonzeros in each row, values in
/// (0.1, 1.0) so doses stay positive for positive iterates.
fn random_matrix(rng: &mut StdRng, rows: usize, cols: usize, per_row: usize) -> CsrMatrix<f64> {
    let mut values = Vec::new();
    let mut col_indices = Vec::new();
    let mut row_ptrs = vec![0u32];
    for _ in 0..rows {
        let mut picked: Vec<u32> = Vec::new();
        while picked.len() < per_row {
            let col = rng.gen_range(0..cols) as u32;
            if !picked.contains(&col) {
                picked.push(col);
            }
        }
        picked.sort_unstable();
        for col in picked {
            values.push(rng.gen_range(0.1..1.0));
            col_indices.push(col);
        }
        row_ptrs.push(values.len() as u32);
    }
    CsrMatrix::from_csr_parts(rows, cols, values, col_indices, row_ptrs)
}

fn random_x(rng: &mut StdRng, n: usize) -> Vec<f64> {
    (0..n).map(|_| rng.gen_range(0.5..2.0)).collect()
}

fn make_entry(
    function_type: FunctionType,
    rhs: f64,
    parameters: Vec<f64>,
    c: f64,
    artifact: &DoseArtifact,
) -> Entry {
    let meta = EntryMeta {
        roi_name: format!("{function_type} test"),
        data_id: 1,
        function_type,
        is_constraint: false,
        minimise: true,
        active: true,
        rhs,
        weight: 1.0,
        c,
        parameters,
        num_vars: artifact.num_vars() as u32,
    };
    Entry::from_meta(meta, artifact).unwrap()
}

/// Assert the analytic gradient matches the finite difference within
/// `1e-5 · (1 + |f|)` per component.
fn check_gradient(entry: &Entry, artifact: &DoseArtifact, x: &[f64]) {
    let f = entry.value(artifact, x);
    let mut analytic = vec![0.0; x.len()];
    entry.gradient(artifact, x, &mut analytic, false);

    let numeric = finite_diff_grad(|x| entry.value(artifact, x), x, 1e-6);
    let tol = 1e-5 * (1.0 + f.abs());
    for i in 0..x.len() {
        assert!(
            (analytic[i] - numeric[i]).abs() <= tol,
            "component {i}: analytic {} vs numeric {} (tol {tol})",
            analytic[i],
            numeric[i],
        );
    }
}

#[test]
fn min_penalty_gradient_agrees_with_finite_difference() {
    let mut rng = StdRng::seed_from_u64(11);
    let artifact = DoseArtifact::Matrix(random_matrix(&mut rng, 30, 12, 4));
    let entry = make_entry(FunctionType::Min, 1.5, Vec::new(), 0.0, &artifact);
    check_gradient(&entry, &artifact, &random_x(&mut rng, 12));
}

#[test]
fn max_penalty_gradient_agrees_with_finite_difference() {
    let mut rng = StdRng::seed_from_u64(12);
    let artifact = DoseArtifact::Matrix(random_matrix(&mut rng, 30, 12, 4));
    let entry = make_entry(FunctionType::Max, 1.5, Vec::new(), 0.0, &artifact);
    check_gradient(&entry, &artifact, &random_x(&mut rng, 12));
}

#[test]
fn quadratic_gradient_agrees_with_finite_difference() {
    let mut rng = StdRng::seed_from_u64(13);
    let artifact = DoseArtifact::Matrix(random_matrix(&mut rng, 30, 12, 4));
    let entry = make_entry(FunctionType::Quadratic, 0.0, Vec::new(), 0.3, &artifact);
    check_gradient(&entry, &artifact, &random_x(&mut rng, 12));
}

#[test]
fn geud_gradient_agrees_with_finite_difference() {
    let mut rng = StdRng::seed_from_u64(14);
    let artifact = DoseArtifact::Matrix(random_matrix(&mut rng, 30, 12, 4));
    // Non-integer exponent exercises the fractional power path.
    let entry = make_entry(FunctionType::Geud, 0.0, vec![2.6], 0.0, &artifact);
    check_gradient(&entry, &artifact, &random_x(&mut rng, 12));
}

#[test]
fn ltcp_gradient_agrees_with_finite_difference() {
    let mut rng = StdRng::seed_from_u64(15);
    let artifact = DoseArtifact::Matrix(random_matrix(&mut rng, 30, 12, 4));
    let entry = make_entry(FunctionType::Ltcp, 0.0, vec![5.0, 0.4], 0.0, &artifact);
    check_gradient(&entry, &artifact, &random_x(&mut rng, 12));
}

#[test]
fn mean_gradient_agrees_with_finite_difference() {
    let mut rng = StdRng::seed_from_u64(16);
    let mu: Vec<f64> = (0..12).map(|_| rng.gen_range(0.0..0.2)).collect();
    let artifact = DoseArtifact::MeanVector(mu);
    let entry = make_entry(FunctionType::Mean, 0.0, Vec::new(), 0.0, &artifact);
    check_gradient(&entry, &artifact, &random_x(&mut rng, 12));
}

#[test]
fn quadratic_identity() {
    // f(x) = ½·xᵀAᵀAx + c and ∇f(x) = AᵀA·x.
    let mut rng = StdRng::seed_from_u64(17);
    let matrix = random_matrix(&mut rng, 10, 6, 3);
    let x = random_x(&mut rng, 6);

    let mut y = vec![0.0; 10];
    matrix.spmv(&x, &mut y);
    let quad_form: f64 = y.iter().map(|yi| yi * yi).sum();
    let mut expected_grad = vec![0.0; 6];
    matrix.spmv_transpose(&y, &mut expected_grad);

    let artifact = DoseArtifact::Matrix(matrix);
    let entry = make_entry(FunctionType::Quadratic, 0.0, Vec::new(), 0.25, &artifact);
    assert_relative_eq!(
        entry.value(&artifact, &x),
        0.5 * quad_form + 0.25,
        max_relative = 1e-14
    );

    let mut grad = vec![0.0; 6];
    entry.gradient(&artifact, &x, &mut grad, false);
    for i in 0..6 {
        assert_relative_eq!(grad[i], expected_grad[i], max_relative = 1e-14, epsilon = 1e-14);
    }
}

#[test]
fn mean_identity_is_independent_of_x() {
    let mu = vec![0.2, 0.0, 0.8];
    let artifact = DoseArtifact::MeanVector(mu.clone());
    let entry = make_entry(FunctionType::Mean, 0.0, Vec::new(), 0.0, &artifact);

    for x in [[1.0, 2.0, 3.0], [10.0, -4.0, 0.5]] {
        let expected: f64 = mu.iter().zip(x.iter()).map(|(m, xi)| m * xi).sum();
        assert_eq!(entry.value(&artifact, &x), expected);

        let mut grad = vec![0.0; 3];
        entry.gradient(&artifact, &x, &mut grad, false);
        assert_eq!(grad, mu);
    }
}

#[test]
fn one_sided_penalties_vanish_on_the_feasible_side() {
    let mut rng = StdRng::seed_from_u64(18);
    let artifact = DoseArtifact::Matrix(random_matrix(&mut rng, 20, 8, 3));
    let x = random_x(&mut rng, 8);

    // Every row dose is below 0.1·8 = way under rhs = 100.
    let max_entry = make_entry(FunctionType::Max, 100.0, Vec::new(), 0.0, &artifact);
    assert_eq!(max_entry.value(&artifact, &x), 0.0);

    // Every row dose is positive, above rhs = 0.
    let min_entry = make_entry(FunctionType::Min, 0.0, Vec::new(), 0.0, &artifact);
    assert_eq!(min_entry.value(&artifact, &x), 0.0);
}

#[test]
fn geud_is_positively_homogeneous() {
    let mut rng = StdRng::seed_from_u64(19);
    let artifact = DoseArtifact::Matrix(random_matrix(&mut rng, 25, 10, 4));
    let entry = make_entry(FunctionType::Geud, 0.0, vec![3.4], 0.0, &artifact);

    let x = random_x(&mut rng, 10);
    for t in [0.5, 2.0, 7.5] {
        let scaled: Vec<f64> = x.iter().map(|xi| t * xi).collect();
        let f = entry.value(&artifact, &x);
        let f_scaled = entry.value(&artifact, &scaled);
        assert_relative_eq!(f_scaled, t * f, max_relative = 1e-10);
    }
}
