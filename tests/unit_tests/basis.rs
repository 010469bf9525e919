use matfree::basis::Basis;
use matfree::error::Error;
use matfree::{Context, EvalMode, TransposeMode};
use matrixcompare::assert_scalar_eq;

fn host() -> Context {
    Context::init("host").unwrap()
}

#[test]
fn interpolation_preserves_constants() {
    let ctx = host();
    for dim in 1..=3 {
        let basis = Basis::create_tensor_h1_lagrange(&ctx, dim, 1, 3, 4).unwrap();
        let u = vec![2.5; basis.num_nodes()];
        let mut v = vec![0.0; basis.num_quadrature_points()];
        basis
            .apply(1, TransposeMode::NoTranspose, EvalMode::Interp, &u, &mut v)
            .unwrap();
        for &value in &v {
            assert_scalar_eq!(value, 2.5, comp = abs, tol = 1e-12);
        }
    }
}

#[test]
fn gradient_of_linear_field_is_constant() {
    let ctx = host();
    let basis = Basis::create_tensor_h1_lagrange(&ctx, 1, 1, 2, 3).unwrap();
    // Nodal values of u(x) = x on the reference interval.
    let u = vec![-1.0, 1.0];
    let mut v = vec![0.0; basis.num_quadrature_points()];
    basis
        .apply(1, TransposeMode::NoTranspose, EvalMode::Grad, &u, &mut v)
        .unwrap();
    for &value in &v {
        assert_scalar_eq!(value, 1.0, comp = abs, tol = 1e-13);
    }
}

#[test]
fn gradient_of_bilinear_field_in_2d() {
    let ctx = host();
    let basis = Basis::create_tensor_h1_lagrange(&ctx, 2, 1, 2, 2).unwrap();
    let q = basis.num_quadrature_points();
    // u(x, y) = x + 2 y at the four corner nodes (x fastest).
    let u = vec![-3.0, -1.0, 1.0, 3.0];
    let mut v = vec![0.0; 2 * q];
    basis
        .apply(1, TransposeMode::NoTranspose, EvalMode::Grad, &u, &mut v)
        .unwrap();
    for iq in 0..q {
        assert_scalar_eq!(v[iq], 1.0, comp = abs, tol = 1e-13);
        assert_scalar_eq!(v[q + iq], 2.0, comp = abs, tol = 1e-13);
    }
}

#[test]
fn quadrature_weights_sum_to_reference_volume() {
    let ctx = host();
    for dim in 1..=3 {
        let basis = Basis::create_tensor_h1_lagrange(&ctx, dim, 1, 2, 3).unwrap();
        let mut v = vec![0.0; basis.num_quadrature_points()];
        basis
            .apply(1, TransposeMode::NoTranspose, EvalMode::Weight, &[], &mut v)
            .unwrap();
        let total: f64 = v.iter().sum();
        assert_scalar_eq!(total, 2.0f64.powi(dim as i32), comp = abs, tol = 1e-12);
    }
}

#[test]
fn transpose_is_the_adjoint_of_interpolation() {
    let ctx = host();
    let basis = Basis::create_tensor_h1_lagrange(&ctx, 2, 1, 3, 3).unwrap();
    let p = basis.num_nodes();
    let q = basis.num_quadrature_points();

    let u: Vec<f64> = (0..p).map(|i| (i as f64 * 0.7).sin()).collect();
    let w: Vec<f64> = (0..q).map(|i| (i as f64 * 0.3).cos()).collect();

    let mut bu = vec![0.0; q];
    basis
        .apply(1, TransposeMode::NoTranspose, EvalMode::Interp, &u, &mut bu)
        .unwrap();
    let mut btw = vec![0.0; p];
    basis
        .apply(1, TransposeMode::Transpose, EvalMode::Interp, &w, &mut btw)
        .unwrap();

    let lhs: f64 = bu.iter().zip(&w).map(|(a, b)| a * b).sum();
    let rhs: f64 = u.iter().zip(&btw).map(|(a, b)| a * b).sum();
    assert_scalar_eq!(lhs, rhs, comp = abs, tol = 1e-12);
}

#[test]
fn batched_application_treats_elements_independently() {
    let ctx = host();
    let basis = Basis::create_tensor_h1_lagrange(&ctx, 1, 1, 2, 2).unwrap();
    let q = basis.num_quadrature_points();
    // Element 0 holds a constant, element 1 a linear field.
    let u = vec![4.0, 4.0, -1.0, 1.0];
    let mut v = vec![0.0; 2 * q];
    basis
        .apply(2, TransposeMode::NoTranspose, EvalMode::Interp, &u, &mut v)
        .unwrap();
    for iq in 0..q {
        assert_scalar_eq!(v[iq], 4.0, comp = abs, tol = 1e-13);
    }
    let x = 1.0 / 3.0f64.sqrt();
    assert_scalar_eq!(v[q], -x, comp = abs, tol = 1e-13);
    assert_scalar_eq!(v[q + 1], x, comp = abs, tol = 1e-13);
}

#[test]
fn generic_h1_identity_tables_pass_data_through() {
    let ctx = host();
    let n = 3;
    let mut interp = vec![0.0; n * n];
    for i in 0..n {
        interp[i * n + i] = 1.0;
    }
    let grad = vec![0.0; n * n];
    let weights = vec![1.0; n];
    let basis = Basis::create_h1(&ctx, 1, 1, n, n, &interp, &grad, &weights).unwrap();

    let u = vec![3.0, -1.0, 2.0];
    let mut v = vec![0.0; n];
    basis
        .apply(1, TransposeMode::NoTranspose, EvalMode::Interp, &u, &mut v)
        .unwrap();
    assert_eq!(v, u);
}

#[test]
fn hdiv_divergence_applies_the_divergence_table() {
    let ctx = host();
    // One quadrature point, two vector-valued basis functions in 2D.
    let interp = vec![1.0, 0.0, 0.0, 1.0];
    let div = vec![0.5, -0.5];
    let weights = vec![4.0];
    let basis = Basis::create_hdiv(&ctx, 2, 1, 2, 1, &interp, &div, &weights).unwrap();

    let u = vec![2.0, 6.0];
    let mut v = vec![0.0; 1];
    basis
        .apply(1, TransposeMode::NoTranspose, EvalMode::Div, &u, &mut v)
        .unwrap();
    assert_scalar_eq!(v[0], -2.0, comp = abs, tol = 1e-14);

    // Vector-valued interpolation produces one value per direction.
    let mut v = vec![0.0; 2];
    basis
        .apply(1, TransposeMode::NoTranspose, EvalMode::Interp, &u, &mut v)
        .unwrap();
    assert_eq!(v, vec![2.0, 6.0]);
}

#[test]
fn inconsistent_table_dimensions_are_rejected() {
    let ctx = host();
    let result = Basis::create_tensor_h1(&ctx, 2, 1, 2, 2, &[0.0; 3], &[0.0; 4], &[0.0; 2], &[0.0; 2]);
    assert!(matches!(result, Err(Error::InvalidConfiguration { .. })));

    let result = Basis::create_h1(&ctx, 2, 1, 4, 4, &[0.0; 16], &[0.0; 16], &[0.0; 4]);
    assert!(matches!(result, Err(Error::InvalidConfiguration { .. })));
}

#[test]
fn gradient_mode_is_rejected_for_hdiv_bases() {
    let ctx = host();
    let basis = Basis::create_hdiv(
        &ctx,
        2,
        1,
        2,
        1,
        &[1.0, 0.0, 0.0, 1.0],
        &[0.5, -0.5],
        &[4.0],
    )
    .unwrap();
    let u = vec![1.0, 1.0];
    let mut v = vec![0.0; 2];
    assert!(basis
        .apply(1, TransposeMode::NoTranspose, EvalMode::Grad, &u, &mut v)
        .is_err());
}
