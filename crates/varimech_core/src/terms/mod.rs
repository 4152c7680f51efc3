//! Energy, force and constraint terms.
//!
//! Terms are closed sum types resolved from name-based specs when they are registered
//! with a [`System`](crate::system::System). Scalar terms (potentials and constraints)
//! share the [`ScalarTerm`] capability: a single `partial` method returning the
//! derivative with respect to a multiset of configuration indices, from which value,
//! gradient, Hessian and third derivative follow.

pub mod constraint;
pub mod force;
pub mod potential;

pub use constraint::{Constraint, ConstraintSpec};
pub use force::{Force, ForcePoint, ForceSpec, WrenchAxes, WrenchComponent, WrenchSpec};
pub use potential::{Potential, PotentialSpec};

use nalgebra::{DMatrix, DVector, Matrix3, Vector3};

use crate::tree::{KinematicTree, TreeState};

/// Highest configuration derivative order a scalar term provides.
pub const TERM_ORDER: usize = 3;

pub trait ScalarTerm {
    /// Derivative with respect to the listed configuration indices (empty = value).
    /// `indices.len()` must not exceed [`TERM_ORDER`], and the tree state must have been
    /// evaluated to at least that order.
    fn partial(&self, tree: &KinematicTree, state: &TreeState, indices: &[usize]) -> f64;

    fn value(&self, tree: &KinematicTree, state: &TreeState) -> f64 {
        self.partial(tree, state, &[])
    }

    fn gradient(&self, tree: &KinematicTree, state: &TreeState) -> DVector<f64> {
        let n = tree.nq();
        DVector::from_fn(n, |k, _| self.partial(tree, state, &[k]))
    }

    fn hessian(&self, tree: &KinematicTree, state: &TreeState) -> DMatrix<f64> {
        let n = tree.nq();
        let mut out = DMatrix::zeros(n, n);
        for k in 0..n {
            for l in k..n {
                let v = self.partial(tree, state, &[k, l]);
                out[(k, l)] = v;
                out[(l, k)] = v;
            }
        }
        out
    }

    /// Third derivative, indexed `[k][(l, m)]`.
    fn third(&self, tree: &KinematicTree, state: &TreeState) -> Vec<DMatrix<f64>> {
        let n = tree.nq();
        let mut out = vec![DMatrix::zeros(n, n); n];
        for k in 0..n {
            for l in k..n {
                for m in l..n {
                    let v = self.partial(tree, state, &[k, l, m]);
                    for (a, b, c) in permutations3(k, l, m) {
                        out[a][(b, c)] = v;
                    }
                }
            }
        }
        out
    }
}

pub(crate) fn permutations3(a: usize, b: usize, c: usize) -> [(usize, usize, usize); 6] {
    [
        (a, b, c),
        (a, c, b),
        (b, a, c),
        (b, c, a),
        (c, a, b),
        (c, b, a),
    ]
}

/// Sums `term(S1, S2)` over every split of `indices` into two sub-multisets (by position).
/// This is the general Leibniz rule for the derivative of a product.
pub(crate) fn leibniz(indices: &[usize], mut term: impl FnMut(&[usize], &[usize]) -> f64) -> f64 {
    let n = indices.len();
    let mut left = Vec::with_capacity(n);
    let mut right = Vec::with_capacity(n);
    let mut total = 0.0;
    for mask in 0..(1u32 << n) {
        left.clear();
        right.clear();
        for (bit, &i) in indices.iter().enumerate() {
            if mask & (1 << bit) != 0 {
                left.push(i);
            } else {
                right.push(i);
            }
        }
        total += term(&left, &right);
    }
    total
}

/// Derivative of `phi(y(q))` given `phi` and its first three derivatives at `y(q)`.
pub(crate) fn compose(phi: [f64; 4], y: impl Fn(&[usize]) -> f64, indices: &[usize]) -> f64 {
    match *indices {
        [] => phi[0],
        [a] => phi[1] * y(&[a]),
        [a, b] => phi[2] * y(&[a]) * y(&[b]) + phi[1] * y(&[a, b]),
        [a, b, c] => {
            phi[3] * y(&[a]) * y(&[b]) * y(&[c])
                + phi[2] * (y(&[a, b]) * y(&[c]) + y(&[a, c]) * y(&[b]) + y(&[b, c]) * y(&[a]))
                + phi[1] * y(&[a, b, c])
        }
        _ => {
            debug_assert!(false, "composition supports at most third derivatives");
            f64::NAN
        }
    }
}

/// `sqrt` and its first three derivatives at `s`.
pub(crate) fn sqrt_derivatives(s: f64) -> [f64; 4] {
    let r = s.sqrt();
    [
        r,
        0.5 / r,
        -0.25 / (s * r),
        0.375 / (s * s * r),
    ]
}

/// Derivatives of the squared distance between two frame origins.
pub(crate) fn squared_distance(
    state: &TreeState,
    frame1: usize,
    frame2: usize,
    indices: &[usize],
) -> f64 {
    let r = |s: &[usize]| state.position_partial(frame1, s) - state.position_partial(frame2, s);
    leibniz(indices, |a, b| r(a).dot(&r(b)))
}

/// Derivative of the distance between two frame origins.
pub(crate) fn distance(state: &TreeState, frame1: usize, frame2: usize, indices: &[usize]) -> f64 {
    let s0 = squared_distance(state, frame1, frame2, &[]);
    compose(
        sqrt_derivatives(s0),
        |s| squared_distance(state, frame1, frame2, s),
        indices,
    )
}

pub(crate) fn vee(m: &Matrix3<f64>) -> Vector3<f64> {
    Vector3::new(m[(2, 1)], m[(0, 2)], m[(1, 0)])
}

pub(crate) fn with_index(indices: &[usize], extra: usize) -> Vec<usize> {
    let mut out = Vec::with_capacity(indices.len() + 1);
    out.extend_from_slice(indices);
    out.push(extra);
    out
}
