use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use super::{distance, leibniz, ScalarTerm};
use crate::error::Result;
use crate::tree::{KinematicTree, TreeState};

/// Name-based holonomic constraint description. Each constraint contributes one scalar
/// residual `h(q) = 0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ConstraintSpec {
    /// Keeps two frame origins a fixed distance apart.
    Distance {
        frame1: String,
        frame2: String,
        distance: f64,
    },
    /// Keeps the world-axis component of `p1 − p2` at zero.
    Point {
        frame1: String,
        frame2: String,
        axis: [f64; 3],
    },
    /// Keeps a frame origin on the plane through `plane`'s origin with normal `normal`
    /// expressed in `plane`'s axes.
    Plane {
        plane: String,
        frame: String,
        normal: [f64; 3],
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    Distance {
        frame1: usize,
        frame2: usize,
        distance: f64,
    },
    Point {
        frame1: usize,
        frame2: usize,
        axis: Vector3<f64>,
    },
    Plane {
        plane: usize,
        frame: usize,
        normal: Vector3<f64>,
    },
}

impl ConstraintSpec {
    pub fn resolve(&self, tree: &KinematicTree) -> Result<Constraint> {
        Ok(match self {
            ConstraintSpec::Distance {
                frame1,
                frame2,
                distance,
            } => Constraint::Distance {
                frame1: tree.frame_index(frame1)?,
                frame2: tree.frame_index(frame2)?,
                distance: *distance,
            },
            ConstraintSpec::Point {
                frame1,
                frame2,
                axis,
            } => Constraint::Point {
                frame1: tree.frame_index(frame1)?,
                frame2: tree.frame_index(frame2)?,
                axis: Vector3::from(*axis),
            },
            ConstraintSpec::Plane {
                plane,
                frame,
                normal,
            } => Constraint::Plane {
                plane: tree.frame_index(plane)?,
                frame: tree.frame_index(frame)?,
                normal: Vector3::from(*normal),
            },
        })
    }
}

impl ScalarTerm for Constraint {
    fn partial(&self, _tree: &KinematicTree, state: &TreeState, indices: &[usize]) -> f64 {
        match self {
            Constraint::Distance {
                frame1,
                frame2,
                distance: target,
            } => {
                let d = distance(state, *frame1, *frame2, indices);
                if indices.is_empty() {
                    d - target
                } else {
                    d
                }
            }
            Constraint::Point {
                frame1,
                frame2,
                axis,
            } => axis.dot(
                &(state.position_partial(*frame1, indices)
                    - state.position_partial(*frame2, indices)),
            ),
            Constraint::Plane {
                plane,
                frame,
                normal,
            } => leibniz(indices, |a, b| {
                let n = state.rotation_partial(*plane, a) * normal;
                let r = state.position_partial(*frame, b) - state.position_partial(*plane, b);
                n.dot(&r)
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{rz, tx, ty};
    use nalgebra::DVector;

    fn two_link() -> KinematicTree {
        KinematicTree::new(&[
            rz("a").named("Link1").child(ty(-1.0).named("Joint").child(
                rz("b").child(ty(-1.0).named("Tip").mass(1.0)),
            )),
            tx(1.0).named("Anchor").child(rz("tilt").named("Surface")),
        ])
        .unwrap()
    }

    fn assert_matches_finite_differences(term: &Constraint, tree: &KinematicTree) {
        let q = DVector::from_vec(vec![0.3, 0.8, -0.2]);
        let state = tree.evaluate(&q, 3).unwrap();
        let h = 1e-6;
        for base in [vec![], vec![0], vec![2], vec![0, 1], vec![1, 2]] {
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
    fn distance_constraint_vanishes_at_target() {
        let tree = two_link();
        let constraint = ConstraintSpec::Distance {
            frame1: "Tip".into(),
            frame2: "Link1".into(),
            distance: 2.0,
        }
        .resolve(&tree)
        .unwrap();
        let state = tree.evaluate(&DVector::from_vec(vec![0.7, 0.0, 0.0]), 1).unwrap();
        assert!(constraint.value(&tree, &state).abs() < 1e-12);
        assert_matches_finite_differences(&constraint, &tree);
    }

    #[test]
    fn point_constraint_projects_on_axis() {
        let tree = two_link();
        let constraint = ConstraintSpec::Point {
            frame1: "Tip".into(),
            frame2: "Anchor".into(),
            axis: [1.0, 0.0, 0.0],
        }
        .resolve(&tree)
        .unwrap();
        let state = tree.evaluate(&DVector::zeros(3), 1).unwrap();
        // Tip hangs at (0, -2); anchor sits at (1, 0).
        assert!((constraint.value(&tree, &state) + 1.0).abs() < 1e-12);
        assert_matches_finite_differences(&constraint, &tree);
    }

    #[test]
    fn plane_constraint_follows_rotating_surface() {
        let tree = two_link();
        let constraint = ConstraintSpec::Plane {
            plane: "Surface".into(),
            frame: "Tip".into(),
            normal: [0.0, 1.0, 0.0],
        }
        .resolve(&tree)
        .unwrap();
        let state = tree.evaluate(&DVector::zeros(3), 1).unwrap();
        assert!((constraint.value(&tree, &state) + 2.0).abs() < 1e-12);
        assert_matches_finite_differences(&constraint, &tree);
    }
}
