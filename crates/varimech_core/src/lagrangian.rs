//! Kinetic energy and its derivatives in `y = (q, q̇)`.
//!
//! For a body with pseudo-inertia `G`, `T = ½ tr(ġ G ġᵀ)` with `ġ = Σ_i q̇_i ∂_i g`.
//! Differentiating with respect to a multiset `S` of configuration variables (holding
//! `q̇` fixed) only ever needs the velocity-contracted partials `Ġ_S = Σ_i q̇_i D_{S∪i} g`
//! and the plain partials `D_S g`, combined through the Leibniz rule:
//!
//! * `∂_S T = ½ Σ_{S1⊆S} tr(Ġ_{S1} G Ġ_{S∖S1}ᵀ)`
//! * `∂_S ∂_{q̇_i} T = Σ_{S1⊆S} tr(D_{S1∪i} g G Ġ_{S∖S1}ᵀ)`
//! * `∂_S ∂_{q̇_i} ∂_{q̇_j} T = ∂_S M_ij = Σ_{S1⊆S} tr(D_{S1∪i} g G D_{S∖S1∪j} gᵀ)`

use std::collections::HashMap;

use nalgebra::{DMatrix, DVector, Matrix4};

use crate::terms::{leibniz, permutations3, with_index};
use crate::tree::{DerivKey, KinematicTree, TreeState};

/// Kinetic contribution of one massive frame at a fixed `(q, q̇)`.
struct Body<'a> {
    state: &'a TreeState,
    frame: usize,
    inertia: [f64; 4],
    velocity: HashMap<DerivKey, Matrix4<f64>>,
}

impl<'a> Body<'a> {
    fn new(
        state: &'a TreeState,
        frame: usize,
        inertia: [f64; 4],
        path: &[usize],
        dq: &DVector<f64>,
        depth: usize,
    ) -> Self {
        let mut velocity = HashMap::new();
        for set in multisets(path, depth) {
            let mut sum = Matrix4::zeros();
            let mut any = false;
            for &i in path {
                if let Some(d) = state.partial(frame, &with_index(&set, i)) {
                    sum += d * dq[i];
                    any = true;
                }
            }
            if any {
                if let Some(key) = DerivKey::new(&set) {
                    velocity.insert(key, sum);
                }
            }
        }
        Self {
            state,
            frame,
            inertia,
            velocity,
        }
    }

    fn trace(&self, x: Option<&Matrix4<f64>>, y: Option<&Matrix4<f64>>) -> f64 {
        let (Some(x), Some(y)) = (x, y) else {
            return 0.0;
        };
        let mut total = 0.0;
        for (c, weight) in self.inertia.iter().enumerate() {
            if *weight == 0.0 {
                continue;
            }
            let mut column = 0.0;
            for r in 0..3 {
                column += x[(r, c)] * y[(r, c)];
            }
            total += weight * column;
        }
        total
    }

    fn d(&self, set: &[usize]) -> Option<&Matrix4<f64>> {
        self.state.partial(self.frame, set)
    }

    fn v(&self, set: &[usize]) -> Option<&Matrix4<f64>> {
        self.velocity.get(&DerivKey::new(set)?)
    }

    fn kinetic(&self, set: &[usize]) -> f64 {
        0.5 * leibniz(set, |a, b| self.trace(self.v(a), self.v(b)))
    }

    fn kinetic_dq(&self, set: &[usize], i: usize) -> f64 {
        leibniz(set, |a, b| self.trace(self.d(&with_index(a, i)), self.v(b)))
    }

    fn mass(&self, set: &[usize], i: usize, j: usize) -> f64 {
        leibniz(set, |a, b| {
            self.trace(self.d(&with_index(a, i)), self.d(&with_index(b, j)))
        })
    }
}

/// All multisets (as sorted lists) of `items` with at most `depth` elements.
fn multisets(items: &[usize], depth: usize) -> Vec<Vec<usize>> {
    let mut out = vec![Vec::new()];
    let mut frontier = vec![(Vec::new(), 0usize)];
    for _ in 0..depth {
        let mut next = Vec::new();
        for (set, start) in &frontier {
            for (pos, &item) in items.iter().enumerate().skip(*start) {
                let extended = with_index(set, item);
                out.push(extended.clone());
                next.push((extended, pos));
            }
        }
        frontier = next;
    }
    out
}

/// Kinetic energy and its `y`-derivatives up to `order` (1, 2 or 3).
pub(crate) struct KineticPoint {
    pub energy: f64,
    pub t_y: DVector<f64>,
    pub t_yy: DMatrix<f64>,
    pub t_yyy: Option<Vec<DMatrix<f64>>>,
    pub mass_matrix: DMatrix<f64>,
}

/// Mass matrix only; `state` needs order ≥ 1.
pub(crate) fn mass_matrix(tree: &KinematicTree, state: &TreeState) -> DMatrix<f64> {
    let n = tree.nq();
    let dq = DVector::zeros(n);
    let mut out = DMatrix::zeros(n, n);
    for (frame, props) in tree.mass_frames() {
        let path = &tree.frames()[frame].path;
        let body = Body::new(state, frame, props.pseudo_inertia(), path, &dq, 0);
        accumulate_mass(&body, path, &[], &mut out);
    }
    out
}

fn accumulate_mass(body: &Body<'_>, path: &[usize], set: &[usize], out: &mut DMatrix<f64>) {
    for (a, &i) in path.iter().enumerate() {
        for &j in &path[a..] {
            let value = body.mass(set, i, j);
            out[(i, j)] += value;
            if i != j {
                out[(j, i)] += value;
            }
        }
    }
}

/// Kinetic terms at `(q, q̇)`; `state` must be evaluated to order `order + 1`.
pub(crate) fn kinetic(
    tree: &KinematicTree,
    state: &TreeState,
    dq: &DVector<f64>,
    order: usize,
) -> KineticPoint {
    let n = tree.nq();
    let ny = 2 * n;
    let mut point = KineticPoint {
        energy: 0.0,
        t_y: DVector::zeros(ny),
        t_yy: DMatrix::zeros(ny, ny),
        t_yyy: (order >= 3).then(|| vec![DMatrix::zeros(ny, ny); ny]),
        mass_matrix: DMatrix::zeros(n, n),
    };

    for (frame, props) in tree.mass_frames() {
        let path = &tree.frames()[frame].path;
        let body = Body::new(state, frame, props.pseudo_inertia(), path, dq, order.min(3));
        point.energy += body.kinetic(&[]);
        accumulate_mass(&body, path, &[], &mut point.mass_matrix);

        for &k in path {
            point.t_y[k] += body.kinetic(&[k]);
            point.t_y[n + k] += body.kinetic_dq(&[], k);
        }
        if order < 2 {
            continue;
        }

        for (a, &k) in path.iter().enumerate() {
            for &l in &path[a..] {
                let value = body.kinetic(&[k, l]);
                point.t_yy[(k, l)] += value;
                if k != l {
                    point.t_yy[(l, k)] += value;
                }
            }
            for &i in path {
                let value = body.kinetic_dq(&[k], i);
                point.t_yy[(k, n + i)] += value;
                point.t_yy[(n + i, k)] += value;
            }
        }

        let Some(t_yyy) = point.t_yyy.as_mut() else {
            continue;
        };
        for (a, &k) in path.iter().enumerate() {
            for (b, &l) in path.iter().enumerate().skip(a) {
                for &m in &path[b..] {
                    let value = body.kinetic(&[k, l, m]);
                    add_symmetric(t_yyy, (k, l, m), value);
                }
                for &i in path {
                    let value = body.kinetic_dq(&[k, l], i);
                    add_symmetric(t_yyy, (k, l, n + i), value);
                }
            }
            for (c, &i) in path.iter().enumerate() {
                for &j in &path[c..] {
                    let value = body.mass(&[k], i, j);
                    add_symmetric(t_yyy, (k, n + i, n + j), value);
                }
            }
        }
    }

    // The mass block of the Hessian is the mass matrix itself.
    if order >= 2 {
        point
            .t_yy
            .view_mut((n, n), (n, n))
            .copy_from(&point.mass_matrix);
    }
    point
}

/// Adds `value` at every distinct permutation of `(a, b, c)`.
pub(crate) fn add_symmetric(tensor: &mut [DMatrix<f64>], (a, b, c): (usize, usize, usize), value: f64) {
    let mut seen: Vec<(usize, usize, usize)> = Vec::with_capacity(6);
    for perm in permutations3(a, b, c) {
        if !seen.contains(&perm) {
            seen.push(perm);
            tensor[perm.0][(perm.1, perm.2)] += value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{rz, tx, ty};

    fn cart_pendulum() -> KinematicTree {
        KinematicTree::new(&[tx("x").named("Cart").mass(10.0).child(
            rz("theta").child(ty(-1.0).named("Bob").mass(1.0)),
        )])
        .unwrap()
    }

    #[test]
    fn multisets_enumerate_without_repeats() {
        let sets = multisets(&[0, 2], 2);
        assert_eq!(
            sets,
            vec![
                vec![],
                vec![0],
                vec![2],
                vec![0, 0],
                vec![0, 2],
                vec![2, 2]
            ]
        );
    }

    #[test]
    fn cart_pendulum_mass_matrix_has_closed_form() {
        let tree = cart_pendulum();
        let theta: f64 = 0.6;
        let q = DVector::from_vec(vec![0.3, theta]);
        let state = tree.evaluate(&q, 1).unwrap();
        let m = mass_matrix(&tree, &state);
        assert!((m[(0, 0)] - 11.0).abs() < 1e-12);
        assert!((m[(0, 1)] - theta.cos()).abs() < 1e-12);
        assert!((m[(1, 0)] - theta.cos()).abs() < 1e-12);
        assert!((m[(1, 1)] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn rotational_inertia_enters_mass_matrix() {
        let tree = KinematicTree::new(&[rz("a").named("Disk").mass(2.0).inertia(0.1, 0.2, 0.3)])
            .unwrap();
        let state = tree.evaluate(&DVector::from_vec(vec![0.4]), 1).unwrap();
        assert!((mass_matrix(&tree, &state)[(0, 0)] - 0.3).abs() < 1e-12);
    }

    fn kinetic_at(tree: &KinematicTree, y: &DVector<f64>, order: usize) -> KineticPoint {
        let n = tree.nq();
        let q = y.rows(0, n).into_owned();
        let dq = y.rows(n, n).into_owned();
        let state = tree.evaluate(&q, order + 1).unwrap();
        kinetic(tree, &state, &dq, order)
    }

    #[test]
    fn kinetic_derivatives_match_finite_differences() {
        let tree = KinematicTree::new(&[tx("x").named("Cart").mass(3.0).child(
            rz("a").child(ty(-1.0).named("Elbow").mass(1.0).inertia(0.1, 0.2, 0.3).child(
                rz("b").child(ty(-0.5).named("Hand").mass(0.5)),
            )),
        )])
        .unwrap();
        let y = DVector::from_vec(vec![0.2, 0.7, -0.4, 0.5, -1.1, 0.8]);
        let base = kinetic_at(&tree, &y, 3);
        let t_yyy = base.t_yyy.as_ref().unwrap();
        let h = 1e-6;
        for col in 0..6 {
            let mut plus = y.clone();
            plus[col] += h;
            let mut minus = y.clone();
            minus[col] -= h;
            let (p, m) = (kinetic_at(&tree, &plus, 3), kinetic_at(&tree, &minus, 3));
            let d_energy = (p.energy - m.energy) / (2.0 * h);
            assert!((base.t_y[col] - d_energy).abs() < 1e-6, "T_y[{col}]");
            for row in 0..6 {
                let d_grad = (p.t_y[row] - m.t_y[row]) / (2.0 * h);
                assert!(
                    (base.t_yy[(row, col)] - d_grad).abs() < 1e-6,
                    "T_yy[{row},{col}]"
                );
                for k in 0..6 {
                    let d_hess = (p.t_yy[(row, k)] - m.t_yy[(row, k)]) / (2.0 * h);
                    assert!(
                        (t_yyy[row][(k, col)] - d_hess).abs() < 1e-6,
                        "T_yyy[{row}][{k},{col}]"
                    );
                }
            }
        }
        // T = ½ q̇ᵀ M q̇.
        let dq = y.rows(3, 3).into_owned();
        let expected = 0.5 * dq.dot(&(&base.mass_matrix * &dq));
        assert!((base.energy - expected).abs() < 1e-12);
    }
}
