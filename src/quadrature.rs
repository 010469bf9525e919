//! Univariate quadrature rules and node spacings on the reference interval
//! `[-1, 1]`, used to construct tensor-product bases.

use crate::Scalar;
use std::f64::consts::PI;

/// Recurrence relation for Legendre polynomials.
///
/// The derivative formula is undefined at |x| == 1, so evaluation is only
/// valid in the open interval (-1, 1).
#[derive(Debug, Default)]
struct LegendreRecurrence {
    n: usize,
    x: f64,
    // The current value, i.e. p_n(x)
    p1: f64,
    // The previous value in the recurrence, i.e. p_{n - 1}(x)
    p2: f64,
}

impl LegendreRecurrence {
    fn evaluate(n: usize, x: f64) -> Self {
        // m P_m(x) = (2m - 1) * x P_{m - 1}(x) - (m - 1) P_{m - 2}(x)
        let mut p1 = 1.0;
        let mut p2 = 0.0;
        let mut p3;
        for m in 1..=n {
            let m = m as f64;
            p3 = p2;
            p2 = p1;
            p1 = ((2.0 * m - 1.0) * x * p2 - (m - 1.0) * p3) / m;
        }
        Self { n, x, p1, p2 }
    }

    fn value(&self) -> f64 {
        self.p1
    }

    fn derivative(&self) -> f64 {
        let Self { n, x, p1, p2 } = &self;
        let n = *n as f64;
        // dp_n/dx (x) = n * (x * p_n(x) - p_{n - 1}(x)) / (x^2 - 1)
        n * (x * p1 - p2) / (x * x - 1.0)
    }

    fn value_and_derivative(&self) -> (f64, f64) {
        (self.value(), self.derivative())
    }
}

/// Gauss quadrature for the reference interval [-1, 1].
///
/// Returns `(weights, points)` for the rule with the given number of points.
/// Given `n` points, the rule integrates polynomials of order up to `2n - 1`
/// exactly.
///
/// # Panics
///
/// Panics if zero points are requested.
pub fn gauss(num_points: usize) -> (Vec<Scalar>, Vec<Scalar>) {
    let n = num_points;
    assert!(n > 0, "number of points must be positive");

    let m = (n + 1) / 2;
    let mut points = Vec::with_capacity(n);
    let mut weights = Vec::with_capacity(n);

    // Only find the first m roots; the rest follow by symmetry.
    for i in 0..m {
        // Fairly accurate initial guess
        let mut x = (PI * (i as f64 + 0.75) / (n as f64 + 0.5)).cos();
        let (mut p, mut dp) = LegendreRecurrence::evaluate(n, x).value_and_derivative();

        // Newton's method
        'newton: loop {
            let dx = -p / dp;
            x += dx;
            let (p_new, dp_new) = LegendreRecurrence::evaluate(n, x).value_and_derivative();
            p = p_new;
            dp = dp_new;
            if dx.abs() <= 1e-15 {
                break 'newton;
            }
        }

        let w = 2.0 / ((1.0 - x * x) * dp * dp);
        points.push(x);
        weights.push(w);
    }

    for i in m..n {
        let mirror_idx = n - i - 1;
        points.push(-points[mirror_idx]);
        weights.push(weights[mirror_idx]);
    }

    // Roots were found from +1 downwards; report them in ascending order.
    points.reverse();
    weights.reverse();

    assert_eq!(points.len(), n);
    (weights, points)
}

/// Chebyshev–Gauss–Lobatto node spacing on [-1, 1], in ascending order.
///
/// Used for placing Lagrange interpolation nodes; includes both endpoints
/// for `num_nodes >= 2`. A single node sits at the interval midpoint.
pub fn lobatto_nodes(num_nodes: usize) -> Vec<Scalar> {
    assert!(num_nodes > 0, "number of nodes must be positive");
    if num_nodes == 1 {
        return vec![0.0];
    }
    let n = num_nodes - 1;
    (0..=n)
        .map(|i| -(PI * i as f64 / n as f64).cos())
        .collect()
}
