use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use super::{distance, leibniz, vee, with_index};
use crate::error::{MechanismError, Result};
use crate::tree::{KinematicTree, TreeState};

/// One wrench component: a fixed value or a named input channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WrenchSpec {
    Constant(f64),
    Input(String),
}

/// Name-based generalized force description. Input names are declared by the force
/// that uses them and must be unique across the system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ForceSpec {
    /// `−c_i q̇_i` on every configuration; `coefficients` override `default` by name.
    Damping {
        #[serde(default)]
        default: f64,
        #[serde(default)]
        coefficients: BTreeMap<String, f64>,
    },
    /// Generalized force on one configuration driven directly by an input.
    JointForce { config: String, input: String },
    /// Force `[fx, fy, fz]` and torque `[τx, τy, τz]` in the axes of `frame`, applied at
    /// its origin.
    BodyWrench { frame: String, wrench: [WrenchSpec; 6] },
    /// Force and torque in world axes, applied at the origin of `frame`.
    HybridWrench { frame: String, wrench: [WrenchSpec; 6] },
    /// Force and moment about the world origin, in world axes, acting on `frame`.
    SpatialWrench { frame: String, wrench: [WrenchSpec; 6] },
    /// `−c ḋ ∂d/∂q` where `d` is the distance between two frame origins.
    LinearDamper {
        frame1: String,
        frame2: String,
        coefficient: f64,
    },
}

/// Coordinates a wrench is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrenchAxes {
    Body,
    Hybrid,
    Spatial,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WrenchComponent {
    Constant(f64),
    Input(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Force {
    Damping { coefficients: Vec<f64> },
    JointForce { config: usize, input: usize },
    Wrench {
        frame: usize,
        axes: WrenchAxes,
        wrench: [WrenchComponent; 6],
    },
    LinearDamper {
        frame1: usize,
        frame2: usize,
        coefficient: f64,
    },
}

/// Generalized force and its derivatives with respect to `w = (q, q̇, u)`.
#[derive(Debug, Clone)]
pub struct ForcePoint {
    pub f: DVector<f64>,
    /// `n × (2n + nu)`.
    pub f_w: DMatrix<f64>,
    /// `f_ww[i]` is the `(2n + nu)²` Hessian of `F_i`.
    pub f_ww: Option<Vec<DMatrix<f64>>>,
}

impl ForcePoint {
    pub fn zeros(nq: usize, nu: usize, second_order: bool) -> Self {
        let nw = 2 * nq + nu;
        Self {
            f: DVector::zeros(nq),
            f_w: DMatrix::zeros(nq, nw),
            f_ww: second_order.then(|| vec![DMatrix::zeros(nw, nw); nq]),
        }
    }
}

impl ForceSpec {
    pub fn joint_force(config: impl Into<String>, input: impl Into<String>) -> Self {
        ForceSpec::JointForce {
            config: config.into(),
            input: input.into(),
        }
    }

    pub fn damping(default: f64) -> Self {
        ForceSpec::Damping {
            default,
            coefficients: BTreeMap::new(),
        }
    }

    /// Resolves names against the tree and appends any newly declared inputs to
    /// `inputs`. On error `inputs` is left untouched.
    pub fn resolve(&self, tree: &KinematicTree, inputs: &mut Vec<String>) -> Result<Force> {
        let mut declared: Vec<String> = Vec::new();
        let mut declare = |name: &str| -> Result<usize> {
            if inputs.iter().chain(declared.iter()).any(|n| n == name) {
                return Err(MechanismError::DuplicateName {
                    kind: "input",
                    name: name.to_string(),
                });
            }
            declared.push(name.to_string());
            Ok(inputs.len() + declared.len() - 1)
        };

        let force = match self {
            ForceSpec::Damping {
                default,
                coefficients,
            } => {
                let mut values = vec![*default; tree.nq()];
                for (name, value) in coefficients {
                    values[tree.config_index(name)?] = *value;
                }
                Force::Damping {
                    coefficients: values,
                }
            }
            ForceSpec::JointForce { config, input } => {
                let config = tree.config_index(config)?;
                Force::JointForce {
                    config,
                    input: declare(input)?,
                }
            }
            ForceSpec::BodyWrench { frame, wrench }
            | ForceSpec::HybridWrench { frame, wrench }
            | ForceSpec::SpatialWrench { frame, wrench } => {
                let axes = match self {
                    ForceSpec::BodyWrench { .. } => WrenchAxes::Body,
                    ForceSpec::HybridWrench { .. } => WrenchAxes::Hybrid,
                    _ => WrenchAxes::Spatial,
                };
                let frame = tree.frame_index(frame)?;
                let mut components = [WrenchComponent::Constant(0.0); 6];
                for (slot, spec) in components.iter_mut().zip(wrench) {
                    *slot = match spec {
                        WrenchSpec::Constant(v) => WrenchComponent::Constant(*v),
                        WrenchSpec::Input(name) => WrenchComponent::Input(declare(name)?),
                    };
                }
                Force::Wrench {
                    frame,
                    axes,
                    wrench: components,
                }
            }
            ForceSpec::LinearDamper {
                frame1,
                frame2,
                coefficient,
            } => Force::LinearDamper {
                frame1: tree.frame_index(frame1)?,
                frame2: tree.frame_index(frame2)?,
                coefficient: *coefficient,
            },
        };
        inputs.extend(declared);
        Ok(force)
    }
}

impl Force {
    /// Adds this force's contribution at `(q, q̇, u)` to `out`. The tree state must be
    /// evaluated to order 2, or 3 when `out` carries second derivatives.
    pub fn accumulate(
        &self,
        tree: &KinematicTree,
        state: &TreeState,
        dq: &DVector<f64>,
        u: &DVector<f64>,
        out: &mut ForcePoint,
    ) {
        let n = dq.len();
        match self {
            Force::Damping { coefficients } => {
                for (i, c) in coefficients.iter().enumerate() {
                    out.f[i] -= c * dq[i];
                    out.f_w[(i, n + i)] -= c;
                }
            }
            Force::JointForce { config, input } => {
                out.f[*config] += u[*input];
                out.f_w[(*config, 2 * n + input)] += 1.0;
            }
            Force::Wrench {
                frame,
                axes,
                wrench,
            } => {
                let path = &tree.frames()[*frame].path;
                for (component, source) in wrench.iter().enumerate() {
                    let (weight, input) = match *source {
                        WrenchComponent::Constant(v) if v == 0.0 => continue,
                        WrenchComponent::Constant(v) => (v, None),
                        WrenchComponent::Input(a) => (u[a], Some(2 * n + a)),
                    };
                    for &i in path {
                        let basis =
                            |s: &[usize]| wrench_basis(state, *axes, *frame, i, component, s);
                        let gamma = basis(&[]);
                        out.f[i] += weight * gamma;
                        if let Some(col) = input {
                            out.f_w[(i, col)] += gamma;
                        }
                        for &k in path {
                            let first = basis(&[k]);
                            out.f_w[(i, k)] += weight * first;
                            if let Some(f_ww) = out.f_ww.as_mut() {
                                for &l in path {
                                    f_ww[i][(k, l)] += weight * basis(&[k, l]);
                                }
                                if let Some(col) = input {
                                    f_ww[i][(k, col)] += first;
                                    f_ww[i][(col, k)] += first;
                                }
                            }
                        }
                    }
                }
            }
            Force::LinearDamper {
                frame1,
                frame2,
                coefficient,
            } => linear_damper(tree, state, (*frame1, *frame2), *coefficient, dq, out),
        }
    }
}

/// `F_i = −c ḋ d_i` with `ḋ = Σ_j d_j q̇_j`, where subscripts are configuration
/// derivatives of the distance `d`.
fn linear_damper(
    tree: &KinematicTree,
    state: &TreeState,
    (frame1, frame2): (usize, usize),
    c: f64,
    dq: &DVector<f64>,
    out: &mut ForcePoint,
) {
    let n = dq.len();
    let mut vars: Vec<usize> = tree.frames()[frame1]
        .path
        .iter()
        .chain(&tree.frames()[frame2].path)
        .copied()
        .collect();
    vars.sort_unstable();
    vars.dedup();
    let m = vars.len();
    let d = |s: &[usize]| distance(state, frame1, frame2, s);

    let d1: Vec<f64> = vars.iter().map(|&i| d(&[i])).collect();
    let d2 = DMatrix::from_fn(m, m, |a, b| d(&[vars[a], vars[b]]));
    let rate: f64 = (0..m).map(|a| d1[a] * dq[vars[a]]).sum();
    let rate_q: Vec<f64> = (0..m)
        .map(|b| (0..m).map(|a| d2[(a, b)] * dq[vars[a]]).sum::<f64>())
        .collect();

    for a in 0..m {
        let i = vars[a];
        out.f[i] -= c * rate * d1[a];
        for b in 0..m {
            let k = vars[b];
            out.f_w[(i, k)] -= c * (rate_q[b] * d1[a] + rate * d2[(a, b)]);
            out.f_w[(i, n + k)] -= c * d1[b] * d1[a];
        }
    }

    let Some(f_ww) = out.f_ww.as_mut() else {
        return;
    };
    let d3: Vec<DMatrix<f64>> = (0..m)
        .map(|a| DMatrix::from_fn(m, m, |b, e| d(&[vars[a], vars[b], vars[e]])))
        .collect();
    let rate_qq = DMatrix::from_fn(m, m, |b, e| {
        (0..m).map(|j| d3[j][(b, e)] * dq[vars[j]]).sum::<f64>()
    });
    for a in 0..m {
        let i = vars[a];
        for b in 0..m {
            let k = vars[b];
            for e in 0..m {
                let l = vars[e];
                f_ww[i][(k, l)] -= c
                    * (rate_qq[(b, e)] * d1[a]
                        + rate_q[b] * d2[(a, e)]
                        + rate_q[e] * d2[(a, b)]
                        + rate * d3[a][(b, e)]);
                let mixed = c * (d2[(e, b)] * d1[a] + d1[e] * d2[(a, b)]);
                f_ww[i][(k, n + l)] -= mixed;
                f_ww[i][(n + l, k)] -= mixed;
            }
        }
    }
}

/// Derivative of the `component`-th wrench direction for configuration `i`.
///
/// Body axes use `Rᵀ ∂_i p` and `vee(Rᵀ ∂_i R)`. World axes use `vee(∂_i R Rᵀ)` for
/// torques, with `∂_i p` for forces at the frame origin (hybrid) or
/// `∂_i p − ∂_i R Rᵀ p` for forces about the world origin (spatial).
fn wrench_basis(
    state: &TreeState,
    axes: WrenchAxes,
    frame: usize,
    i: usize,
    component: usize,
    indices: &[usize],
) -> f64 {
    let rotation = |s: &[usize]| state.rotation_partial(frame, s);
    let position = |s: &[usize]| state.position_partial(frame, s);
    match (axes, component < 3) {
        (WrenchAxes::Body, true) => leibniz(indices, |a, b| {
            (rotation(a).transpose() * position(&with_index(b, i)))[component]
        }),
        (WrenchAxes::Body, false) => leibniz(indices, |a, b| {
            vee(&(rotation(a).transpose() * rotation(&with_index(b, i))))[component - 3]
        }),
        (_, false) => leibniz(indices, |a, b| {
            vee(&(rotation(&with_index(a, i)) * rotation(b).transpose()))[component - 3]
        }),
        (WrenchAxes::Hybrid, true) => position(&with_index(indices, i))[component],
        (WrenchAxes::Spatial, true) => {
            // D_s (∂_i R · Rᵀp), with `Rᵀp` expanded by a nested Leibniz sum.
            let moment_arm = leibniz(indices, |a, b| {
                let outer = rotation(&with_index(a, i));
                (0..3)
                    .map(|j| {
                        outer[(component, j)]
                            * leibniz(b, |e, f| (rotation(e).transpose() * position(f))[j])
                    })
                    .sum::<f64>()
            });
            position(&with_index(indices, i))[component] - moment_arm
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{rx, rz, tx, ty};

    fn chain() -> KinematicTree {
        KinematicTree::new(&[tx("x").child(
            rz("a").child(ty(-1.0).child(rx("b").child(ty(0.5).named("Hand").mass(1.0)))),
        )])
        .unwrap()
    }

    fn wrench(names: [&str; 6]) -> [WrenchSpec; 6] {
        names.map(|n| match n.parse::<f64>() {
            Ok(v) => WrenchSpec::Constant(v),
            Err(_) => WrenchSpec::Input(n.to_string()),
        })
    }

    fn evaluate(
        force: &Force,
        tree: &KinematicTree,
        q: &DVector<f64>,
        dq: &DVector<f64>,
        u: &DVector<f64>,
    ) -> ForcePoint {
        let state = tree.evaluate(q, 3).unwrap();
        let mut out = ForcePoint::zeros(q.len(), u.len(), true);
        force.accumulate(tree, &state, dq, u, &mut out);
        out
    }

    #[test]
    fn inputs_are_declared_in_order_and_unique() {
        let tree = chain();
        let mut inputs = Vec::new();
        ForceSpec::joint_force("x", "push").resolve(&tree, &mut inputs).unwrap();
        let wrench_force = ForceSpec::BodyWrench {
            frame: "Hand".into(),
            wrench: wrench(["0", "fy", "0", "0", "0", "tz"]),
        }
        .resolve(&tree, &mut inputs)
        .unwrap();
        assert_eq!(inputs, vec!["push", "fy", "tz"]);
        assert!(matches!(
            wrench_force,
            Force::Wrench {
                axes: WrenchAxes::Body,
                wrench: [_, WrenchComponent::Input(1), _, _, _, WrenchComponent::Input(2)],
                ..
            }
        ));

        let err = ForceSpec::joint_force("a", "push")
            .resolve(&tree, &mut inputs)
            .unwrap_err();
        assert!(matches!(err, MechanismError::DuplicateName { .. }));
        assert_eq!(inputs.len(), 3);
    }

    #[test]
    fn damping_and_joint_force_are_linear() {
        let tree = chain();
        let mut inputs = Vec::new();
        let mut coefficients = BTreeMap::new();
        coefficients.insert("b".to_string(), 0.5);
        let damping = ForceSpec::Damping {
            default: 0.1,
            coefficients,
        }
        .resolve(&tree, &mut inputs)
        .unwrap();
        let joint = ForceSpec::joint_force("a", "torque")
            .resolve(&tree, &mut inputs)
            .unwrap();

        let q = DVector::zeros(3);
        let dq = DVector::from_vec(vec![1.0, 2.0, 4.0]);
        let u = DVector::from_vec(vec![3.0]);
        let state = tree.evaluate(&q, 2).unwrap();
        let mut out = ForcePoint::zeros(3, 1, false);
        damping.accumulate(&tree, &state, &dq, &u, &mut out);
        joint.accumulate(&tree, &state, &dq, &u, &mut out);
        assert!((out.f[0] + 0.1).abs() < 1e-12);
        assert!((out.f[1] - (3.0 - 0.2)).abs() < 1e-12);
        assert!((out.f[2] + 2.0).abs() < 1e-12);
        assert_eq!(out.f_w[(2, 5)], -0.5);
        assert_eq!(out.f_w[(1, 6)], 1.0);
        assert!(out.f_ww.is_none());
    }

    #[test]
    fn body_force_maps_through_jacobian_transpose() {
        let tree = KinematicTree::new(&[tx("x").child(rz("theta").child(
            ty(-1.0).named("Bob").mass(1.0),
        ))])
        .unwrap();
        let mut inputs = Vec::new();
        let force = ForceSpec::BodyWrench {
            frame: "Bob".into(),
            wrench: wrench(["2", "0", "0", "0", "0", "3"]),
        }
        .resolve(&tree, &mut inputs)
        .unwrap();
        let theta = 0.4;
        let q = DVector::from_vec(vec![0.0, theta]);
        let out = evaluate(&force, &tree, &q, &DVector::zeros(2), &DVector::zeros(0));
        // Body x-axis in world: (cos θ, sin θ). Bob velocity per θ̇: (cos θ, sin θ).
        assert!((out.f[0] - 2.0 * theta.cos()).abs() < 1e-12);
        assert!((out.f[1] - (2.0 + 3.0)).abs() < 1e-12);
    }

    /// Checks `F_w` against differences of `F` and `F_ww` against differences of `F_w`
    /// over `w = (q, q̇, u)`.
    fn assert_derivatives_match(
        force: &Force,
        tree: &KinematicTree,
        q: &DVector<f64>,
        dq: &DVector<f64>,
        u: &DVector<f64>,
    ) {
        let n = q.len();
        let base = evaluate(force, tree, q, dq, u);
        let f_ww = base.f_ww.as_ref().unwrap();
        let h = 1e-6;
        let nw = 2 * n + u.len();
        for col in 0..nw {
            let perturb = |sign: f64| {
                let (mut q, mut dq, mut u) = (q.clone(), dq.clone(), u.clone());
                if col < n {
                    q[col] += sign * h;
                } else if col < 2 * n {
                    dq[col - n] += sign * h;
                } else {
                    u[col - 2 * n] += sign * h;
                }
                evaluate(force, tree, &q, &dq, &u)
            };
            let (plus, minus) = (perturb(1.0), perturb(-1.0));
            let df = (&plus.f - &minus.f) / (2.0 * h);
            let dfw = (&plus.f_w - &minus.f_w) / (2.0 * h);
            for i in 0..n {
                assert!(
                    (base.f_w[(i, col)] - df[i]).abs() < 1e-6,
                    "F_w[{i},{col}]: {} vs {}",
                    base.f_w[(i, col)],
                    df[i]
                );
                for k in 0..nw {
                    assert!(
                        (f_ww[i][(k, col)] - dfw[(i, k)]).abs() < 1e-6,
                        "F_ww[{i}][{k},{col}]: {} vs {}",
                        f_ww[i][(k, col)],
                        dfw[(i, k)]
                    );
                }
            }
        }
    }

    fn resolve(spec: ForceSpec, tree: &KinematicTree) -> Force {
        spec.resolve(tree, &mut Vec::new()).unwrap()
    }

    #[test]
    fn body_wrench_derivatives_match_finite_differences() {
        let tree = chain();
        let force = resolve(
            ForceSpec::BodyWrench {
                frame: "Hand".into(),
                wrench: wrench(["0.7", "fy", "-0.3", "tx", "0.2", "1.1"]),
            },
            &tree,
        );
        let q = DVector::from_vec(vec![0.1, 0.6, -0.9]);
        let u = DVector::from_vec(vec![0.8, -1.4]);
        assert_derivatives_match(&force, &tree, &q, &DVector::zeros(3), &u);
    }

    fn cart_bob() -> KinematicTree {
        KinematicTree::new(&[
            tx("x").child(rz("theta").child(ty(-1.0).named("Bob").mass(1.0))),
            tx(2.0).named("Anchor"),
        ])
        .unwrap()
    }

    #[test]
    fn hybrid_wrench_acts_in_world_axes_at_frame_origin() {
        let tree = cart_bob();
        let force = resolve(
            ForceSpec::HybridWrench {
                frame: "Bob".into(),
                wrench: wrench(["2", "0", "0", "0", "0", "3"]),
            },
            &tree,
        );
        let theta = 0.4;
        let q = DVector::from_vec(vec![0.5, theta]);
        let out = evaluate(&force, &tree, &q, &DVector::zeros(2), &DVector::zeros(0));
        // Bob sits at (x + sin θ, −cos θ); its θ-velocity is (cos θ, sin θ).
        assert!((out.f[0] - 2.0).abs() < 1e-12);
        assert!((out.f[1] - (2.0 * theta.cos() + 3.0)).abs() < 1e-12);
    }

    #[test]
    fn spatial_wrench_takes_moments_about_world_origin() {
        let tree = cart_bob();
        let force = resolve(
            ForceSpec::SpatialWrench {
                frame: "Bob".into(),
                wrench: wrench(["2", "0", "0", "0", "0", "3"]),
            },
            &tree,
        );
        let (x, theta) = (0.5, 0.4);
        let q = DVector::from_vec(vec![x, theta]);
        let out = evaluate(&force, &tree, &q, &DVector::zeros(2), &DVector::zeros(0));
        // The force line passes through the world origin, at height 0 like the pivot
        // at (x, 0), so about the pivot only the pure moment remains.
        assert!((out.f[0] - 2.0).abs() < 1e-12);
        assert!((out.f[1] - 3.0).abs() < 1e-12);

        // A vertical force through the world origin has lever arm −x about the pivot.
        let vertical = resolve(
            ForceSpec::SpatialWrench {
                frame: "Bob".into(),
                wrench: wrench(["0", "1.5", "0", "0", "0", "0"]),
            },
            &tree,
        );
        let out = evaluate(&vertical, &tree, &q, &DVector::zeros(2), &DVector::zeros(0));
        assert!(out.f[0].abs() < 1e-12);
        assert!((out.f[1] + 1.5 * x).abs() < 1e-12);
    }

    #[test]
    fn world_axis_wrench_derivatives_match_finite_differences() {
        let tree = chain();
        let q = DVector::from_vec(vec![0.3, -0.5, 0.8]);
        let u = DVector::from_vec(vec![0.6, -0.9]);
        for spec in [
            ForceSpec::HybridWrench {
                frame: "Hand".into(),
                wrench: wrench(["fx", "0.4", "-1.2", "0.3", "tz", "0.9"]),
            },
            ForceSpec::SpatialWrench {
                frame: "Hand".into(),
                wrench: wrench(["fx", "0.4", "-1.2", "0.3", "tz", "0.9"]),
            },
        ] {
            let force = resolve(spec, &tree);
            assert_derivatives_match(&force, &tree, &q, &DVector::zeros(3), &u);
        }
    }

    #[test]
    fn linear_damper_opposes_separation_rate() {
        let tree = KinematicTree::new(&[tx("x").named("Slider").mass(1.0)]).unwrap();
        let force = resolve(
            ForceSpec::LinearDamper {
                frame1: "Slider".into(),
                frame2: "World".into(),
                coefficient: 0.5,
            },
            &tree,
        );
        let q = DVector::from_vec(vec![2.0]);
        let dq = DVector::from_vec(vec![3.0]);
        let out = evaluate(&force, &tree, &q, &dq, &DVector::zeros(0));
        assert!((out.f[0] + 1.5).abs() < 1e-12);
        assert!((out.f_w[(0, 1)] + 0.5).abs() < 1e-12);
        assert!(out.f_w[(0, 0)].abs() < 1e-12);
    }

    #[test]
    fn linear_damper_derivatives_match_finite_differences() {
        let tree = cart_bob();
        let force = resolve(
            ForceSpec::LinearDamper {
                frame1: "Bob".into(),
                frame2: "Anchor".into(),
                coefficient: 0.8,
            },
            &tree,
        );
        let q = DVector::from_vec(vec![0.3, 0.7]);
        let dq = DVector::from_vec(vec![-0.4, 1.1]);
        assert_derivatives_match(&force, &tree, &q, &dq, &DVector::zeros(0));
    }

    #[test]
    fn wrench_specs_deserialize_by_type() {
        let spec: ForceSpec = serde_json::from_str(
            r#"{"type": "SpatialWrench", "frame": "Bob", "wrench": [0.0, "lift", 0.0, 0.0, 0.0, 0.0]}"#,
        )
        .unwrap();
        let mut inputs = Vec::new();
        let force = spec.resolve(&cart_bob(), &mut inputs).unwrap();
        assert_eq!(inputs, vec!["lift"]);
        assert!(matches!(force, Force::Wrench { axes: WrenchAxes::Spatial, .. }));
    }
}
