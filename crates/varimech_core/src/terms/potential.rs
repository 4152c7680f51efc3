use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use super::{compose, distance, ScalarTerm};
use crate::error::{MechanismError, Result};
use crate::tree::{KinematicTree, TreeState};

/// Name-based potential description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PotentialSpec {
    /// Uniform field acting on every massive frame.
    Gravity { gravity: [f64; 3] },
    /// `½ k (q − q0)²` on a single configuration variable.
    ConfigSpring {
        config: String,
        stiffness: f64,
        #[serde(default)]
        neutral: f64,
    },
    /// Spring on one configuration with restoring force `f(s) = Σ_j c_j s^j` of the
    /// stretch `s = scale·q + offset`; the generalized force is `−f(s)`.
    NonlinearConfigSpring {
        config: String,
        coefficients: Vec<f64>,
        #[serde(default = "unit_scale")]
        scale: f64,
        #[serde(default)]
        offset: f64,
    },
    /// `½ k (|p1 − p2| − x0)²` between two frame origins.
    LinearSpring {
        frame1: String,
        frame2: String,
        stiffness: f64,
        #[serde(default)]
        neutral: f64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Potential {
    Gravity {
        gravity: Vector3<f64>,
    },
    ConfigSpring {
        config: usize,
        stiffness: f64,
        neutral: f64,
    },
    NonlinearConfigSpring {
        config: usize,
        coefficients: Vec<f64>,
        scale: f64,
        offset: f64,
    },
    LinearSpring {
        frame1: usize,
        frame2: usize,
        stiffness: f64,
        neutral: f64,
    },
}

fn unit_scale() -> f64 {
    1.0
}

/// `order`-th derivative of `Σ_j c_j s^j`.
fn polynomial(coefficients: &[f64], s: f64, order: usize) -> f64 {
    coefficients
        .iter()
        .enumerate()
        .skip(order)
        .rev()
        .fold(0.0, |acc, (j, c)| {
            let falling: f64 = (j + 1 - order..=j).map(|m| m as f64).product();
            acc * s + c * falling
        })
}

impl PotentialSpec {
    pub fn gravity(x: f64, y: f64, z: f64) -> Self {
        PotentialSpec::Gravity {
            gravity: [x, y, z],
        }
    }

    pub fn resolve(&self, tree: &KinematicTree) -> Result<Potential> {
        Ok(match self {
            PotentialSpec::Gravity { gravity } => Potential::Gravity {
                gravity: Vector3::from(*gravity),
            },
            PotentialSpec::ConfigSpring {
                config,
                stiffness,
                neutral,
            } => Potential::ConfigSpring {
                config: tree.config_index(config)?,
                stiffness: *stiffness,
                neutral: *neutral,
            },
            PotentialSpec::NonlinearConfigSpring {
                config,
                coefficients,
                scale,
                offset,
            } => {
                if *scale == 0.0 || !scale.is_finite() {
                    return Err(MechanismError::InvalidSetting(
                        "nonlinear spring scale must be finite and nonzero".into(),
                    ));
                }
                Potential::NonlinearConfigSpring {
                    config: tree.config_index(config)?,
                    coefficients: coefficients.clone(),
                    scale: *scale,
                    offset: *offset,
                }
            }
            PotentialSpec::LinearSpring {
                frame1,
                frame2,
                stiffness,
                neutral,
            } => Potential::LinearSpring {
                frame1: tree.frame_index(frame1)?,
                frame2: tree.frame_index(frame2)?,
                stiffness: *stiffness,
                neutral: *neutral,
            },
        })
    }
}

impl ScalarTerm for Potential {
    fn partial(&self, tree: &KinematicTree, state: &TreeState, indices: &[usize]) -> f64 {
        match self {
            Potential::Gravity { gravity } => tree
                .mass_frames()
                .map(|(f, props)| -props.mass * gravity.dot(&state.position_partial(f, indices)))
                .sum(),
            Potential::ConfigSpring {
                config,
                stiffness,
                neutral,
            } => {
                if indices.iter().any(|i| i != config) {
                    return 0.0;
                }
                let offset = state.q()[*config] - neutral;
                match indices.len() {
                    0 => 0.5 * stiffness * offset * offset,
                    1 => stiffness * offset,
                    2 => *stiffness,
                    _ => 0.0,
                }
            }
            Potential::NonlinearConfigSpring {
                config,
                coefficients,
                scale,
                offset,
            } => {
                if indices.iter().any(|i| i != config) {
                    return 0.0;
                }
                let s = scale * state.q()[*config] + offset;
                match indices.len() {
                    // V = (1/scale) Σ_j c_j s^{j+1} / (j + 1)
                    0 => {
                        coefficients
                            .iter()
                            .enumerate()
                            .map(|(j, c)| c * s.powi(j as i32 + 1) / (j + 1) as f64)
                            .sum::<f64>()
                            / scale
                    }
                    order => scale.powi(order as i32 - 1) * polynomial(coefficients, s, order - 1),
                }
            }
            Potential::LinearSpring {
                frame1,
                frame2,
                stiffness,
                neutral,
            } => {
                let d = distance(state, *frame1, *frame2, &[]);
                let offset = d - neutral;
                compose(
                    [0.5 * stiffness * offset * offset, stiffness * offset, *stiffness, 0.0],
                    |s| distance(state, *frame1, *frame2, s),
                    indices,
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{rz, tx, ty};
    use nalgebra::DVector;

    fn pendulum() -> KinematicTree {
        KinematicTree::new(&[
            tx("x").named("Cart").mass(10.0).child(
                rz("theta").child(ty(-1.0).named("Bob").mass(1.0)),
            ),
            tx(3.0).named("Anchor"),
        ])
        .unwrap()
    }

    fn finite_difference_check(term: &Potential, tree: &KinematicTree, q: &DVector<f64>) {
        let state = tree.evaluate(q, 3).unwrap();
        let h = 1e-6;
        for base in [vec![], vec![0], vec![1], vec![0, 1], vec![1, 1]] {
            for i in 0..tree.nq() {
                let mut plus = q.clone();
                plus[i] += h;
                let mut minus = q.clone();
                minus[i] -= h;
                let sp = tree.evaluate(&plus, 3).unwrap();
                let sm = tree.evaluate(&minus, 3).unwrap();
                let numeric = (term.partial(tree, &sp, &base) - term.partial(tree, &sm, &base))
                    / (2.0 * h);
                let mut extended = base.clone();
                extended.push(i);
                let analytic = term.partial(tree, &state, &extended);
                assert!(
                    (analytic - numeric).abs() < 1e-6,
                    "{term:?} {extended:?}: {analytic} vs {numeric}"
                );
            }
        }
    }

    #[test]
    fn gravity_energy_of_hanging_pendulum() {
        let tree = pendulum();
        let gravity = PotentialSpec::gravity(0.0, -9.8, 0.0).resolve(&tree).unwrap();
        let state = tree.evaluate(&DVector::from_vec(vec![0.0, 0.0]), 2).unwrap();
        // Bob hangs at y = -1.
        assert!((gravity.value(&tree, &state) - (-9.8)).abs() < 1e-12);
        let hessian = gravity.hessian(&tree, &state);
        // d²V/dθ² = m g l cos θ at the bottom.
        assert!((hessian[(1, 1)] - 9.8).abs() < 1e-12);
        finite_difference_check(&gravity, &tree, &DVector::from_vec(vec![0.4, 0.9]));
    }

    #[test]
    fn config_spring_is_quadratic() {
        let tree = pendulum();
        let spring = PotentialSpec::ConfigSpring {
            config: "theta".into(),
            stiffness: 4.0,
            neutral: 0.5,
        }
        .resolve(&tree)
        .unwrap();
        let state = tree.evaluate(&DVector::from_vec(vec![0.0, 1.5]), 3).unwrap();
        assert!((spring.value(&tree, &state) - 2.0).abs() < 1e-12);
        assert_eq!(spring.partial(&tree, &state, &[1]), 4.0);
        assert_eq!(spring.partial(&tree, &state, &[0, 1]), 0.0);
        assert_eq!(spring.partial(&tree, &state, &[1, 1, 1]), 0.0);
    }

    #[test]
    fn polynomial_derivatives_follow_power_rule() {
        let c = [1.0, -2.0, 0.5, 3.0];
        let s = 0.7;
        assert!((polynomial(&c, s, 0) - (1.0 - 1.4 + 0.5 * 0.49 + 3.0 * 0.343)).abs() < 1e-12);
        assert!((polynomial(&c, s, 1) - (-2.0 + s + 9.0 * s * s)).abs() < 1e-12);
        assert!((polynomial(&c, s, 2) - (1.0 + 18.0 * s)).abs() < 1e-12);
        assert_eq!(polynomial(&c, s, 3), 18.0);
        assert_eq!(polynomial(&c, s, 4), 0.0);
    }

    #[test]
    fn nonlinear_config_spring_force_is_the_polynomial() {
        let tree = pendulum();
        let spring = PotentialSpec::NonlinearConfigSpring {
            config: "theta".into(),
            coefficients: vec![0.0, 2.0, 0.0, 5.0],
            scale: 2.0,
            offset: -0.2,
        }
        .resolve(&tree)
        .unwrap();
        let q = DVector::from_vec(vec![0.3, 0.6]);
        let state = tree.evaluate(&q, 3).unwrap();
        let s: f64 = 2.0 * 0.6 - 0.2;
        // −∂V/∂θ is the generalized force −f(s).
        let force = 2.0 * s + 5.0 * s.powi(3);
        assert!((spring.partial(&tree, &state, &[1]) - force).abs() < 1e-12);
        assert_eq!(spring.partial(&tree, &state, &[0]), 0.0);
        finite_difference_check(&spring, &tree, &q);
    }

    #[test]
    fn nonlinear_config_spring_rejects_zero_scale() {
        let err = PotentialSpec::NonlinearConfigSpring {
            config: "theta".into(),
            coefficients: vec![1.0],
            scale: 0.0,
            offset: 0.0,
        }
        .resolve(&pendulum())
        .unwrap_err();
        assert!(err.to_string().contains("scale"));
    }

    #[test]
    fn linear_spring_derivatives_match_finite_differences() {
        let tree = pendulum();
        let spring = PotentialSpec::LinearSpring {
            frame1: "Bob".into(),
            frame2: "Anchor".into(),
            stiffness: 3.0,
            neutral: 1.5,
        }
        .resolve(&tree)
        .unwrap();
        finite_difference_check(&spring, &tree, &DVector::from_vec(vec![0.2, -0.7]));
    }

    #[test]
    fn unknown_frame_fails_resolution() {
        let tree = pendulum();
        let err = PotentialSpec::LinearSpring {
            frame1: "Bob".into(),
            frame2: "Missing".into(),
            stiffness: 1.0,
            neutral: 0.0,
        }
        .resolve(&tree)
        .unwrap_err();
        assert!(err.to_string().contains("Missing"));
    }

    #[test]
    fn potential_spec_deserializes_from_json() {
        let spec: PotentialSpec =
            serde_json::from_str(r#"{"type": "Gravity", "gravity": [0.0, -9.8, 0.0]}"#).unwrap();
        assert_eq!(spec, PotentialSpec::gravity(0.0, -9.8, 0.0));
    }
}
