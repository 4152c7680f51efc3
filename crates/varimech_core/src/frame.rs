//! Declarative frame descriptions.
//!
//! A mechanism is described as a forest of [`FrameSpec`] values hanging off the world
//! frame. Each frame applies one rigid transformation relative to its parent: a
//! translation along or a rotation about a coordinate axis (driven either by a named
//! configuration variable or by a constant), or a fixed homogeneous transform.
//!
//! ```
//! use varimech_core::frame::{rz, tx, ty};
//!
//! let cart = tx("x").named("Cart").mass(10.0).child(
//!     rz("theta").child(ty(-1.0).named("Pendulum").mass(1.0)),
//! );
//! assert_eq!(cart.children.len(), 1);
//! ```

use nalgebra::{Matrix3, Matrix4};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }

    /// The ordered pair of coordinates spanning the plane of rotation about this axis.
    fn rotation_plane(self) -> (usize, usize) {
        match self {
            Axis::X => (1, 2),
            Axis::Y => (2, 0),
            Axis::Z => (0, 1),
        }
    }
}

/// Value driving a parametrized transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FrameParam {
    Config(String),
    Value(f64),
}

impl From<&str> for FrameParam {
    fn from(name: &str) -> Self {
        FrameParam::Config(name.to_string())
    }
}

impl From<String> for FrameParam {
    fn from(name: String) -> Self {
        FrameParam::Config(name)
    }
}

impl From<f64> for FrameParam {
    fn from(value: f64) -> Self {
        FrameParam::Value(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FrameTransform {
    Translate {
        axis: Axis,
        param: FrameParam,
    },
    Rotate {
        axis: Axis,
        param: FrameParam,
    },
    Fixed {
        translation: [f64; 3],
        /// Row-major rotation block.
        rotation: [[f64; 3]; 3],
    },
}

impl FrameTransform {
    pub fn config_name(&self) -> Option<&str> {
        match self {
            FrameTransform::Translate {
                param: FrameParam::Config(name),
                ..
            }
            | FrameTransform::Rotate {
                param: FrameParam::Config(name),
                ..
            } => Some(name.as_str()),
            _ => None,
        }
    }

    /// `c`-th derivative of the local transform with respect to its parameter `theta`.
    ///
    /// Returns `None` when the derivative vanishes identically.
    pub fn local_derivative(&self, theta: f64, c: usize) -> Option<Matrix4<f64>> {
        match self {
            FrameTransform::Translate { axis, .. } => {
                let mut g = if c == 0 {
                    Matrix4::identity()
                } else {
                    Matrix4::zeros()
                };
                match c {
                    0 => g[(axis.index(), 3)] = theta,
                    1 => g[(axis.index(), 3)] = 1.0,
                    _ => return None,
                }
                Some(g)
            }
            FrameTransform::Rotate { axis, .. } => {
                let shift = theta + c as f64 * std::f64::consts::FRAC_PI_2;
                let (cos, sin) = (shift.cos(), shift.sin());
                let (i, j) = axis.rotation_plane();
                let mut g = Matrix4::zeros();
                if c == 0 {
                    g[(axis.index(), axis.index())] = 1.0;
                    g[(3, 3)] = 1.0;
                }
                g[(i, i)] = cos;
                g[(i, j)] = -sin;
                g[(j, i)] = sin;
                g[(j, j)] = cos;
                Some(g)
            }
            FrameTransform::Fixed {
                translation,
                rotation,
            } => {
                if c > 0 {
                    return None;
                }
                let mut g = Matrix4::identity();
                let r = Matrix3::from_fn(|r, col| rotation[r][col]);
                g.fixed_view_mut::<3, 3>(0, 0).copy_from(&r);
                for (row, value) in translation.iter().enumerate() {
                    g[(row, 3)] = *value;
                }
                Some(g)
            }
        }
    }

    /// Parameter value at the given configuration lookup.
    pub(crate) fn constant_value(&self) -> f64 {
        match self {
            FrameTransform::Translate {
                param: FrameParam::Value(v),
                ..
            }
            | FrameTransform::Rotate {
                param: FrameParam::Value(v),
                ..
            } => *v,
            _ => 0.0,
        }
    }
}

/// Mass and principal moments of inertia about the frame origin, in frame axes.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MassProperties {
    pub mass: f64,
    #[serde(default)]
    pub ixx: f64,
    #[serde(default)]
    pub iyy: f64,
    #[serde(default)]
    pub izz: f64,
}

impl MassProperties {
    pub fn point(mass: f64) -> Self {
        Self {
            mass,
            ..Self::default()
        }
    }

    /// Diagonal of the pseudo-inertia `G` with `½ tr(ġ G ġᵀ)` equal to the kinetic energy.
    pub fn pseudo_inertia(&self) -> [f64; 4] {
        [
            0.5 * (-self.ixx + self.iyy + self.izz),
            0.5 * (self.ixx - self.iyy + self.izz),
            0.5 * (self.ixx + self.iyy - self.izz),
            self.mass,
        ]
    }

    pub fn is_zero(&self) -> bool {
        self.mass == 0.0 && self.ixx == 0.0 && self.iyy == 0.0 && self.izz == 0.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameSpec {
    #[serde(default)]
    pub name: Option<String>,
    pub transform: FrameTransform,
    #[serde(default)]
    pub mass: Option<MassProperties>,
    #[serde(default)]
    pub children: Vec<FrameSpec>,
}

impl FrameSpec {
    pub fn new(transform: FrameTransform) -> Self {
        Self {
            name: None,
            transform,
            mass: None,
            children: Vec::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn mass(mut self, mass: f64) -> Self {
        let props = self.mass.get_or_insert_with(MassProperties::default);
        props.mass = mass;
        self
    }

    pub fn inertia(mut self, ixx: f64, iyy: f64, izz: f64) -> Self {
        let props = self.mass.get_or_insert_with(MassProperties::default);
        props.ixx = ixx;
        props.iyy = iyy;
        props.izz = izz;
        self
    }

    pub fn child(mut self, child: FrameSpec) -> Self {
        self.children.push(child);
        self
    }

    pub fn children(mut self, children: impl IntoIterator<Item = FrameSpec>) -> Self {
        self.children.extend(children);
        self
    }
}

pub fn tx(param: impl Into<FrameParam>) -> FrameSpec {
    FrameSpec::new(FrameTransform::Translate {
        axis: Axis::X,
        param: param.into(),
    })
}

pub fn ty(param: impl Into<FrameParam>) -> FrameSpec {
    FrameSpec::new(FrameTransform::Translate {
        axis: Axis::Y,
        param: param.into(),
    })
}

pub fn tz(param: impl Into<FrameParam>) -> FrameSpec {
    FrameSpec::new(FrameTransform::Translate {
        axis: Axis::Z,
        param: param.into(),
    })
}

pub fn rx(param: impl Into<FrameParam>) -> FrameSpec {
    FrameSpec::new(FrameTransform::Rotate {
        axis: Axis::X,
        param: param.into(),
    })
}

pub fn ry(param: impl Into<FrameParam>) -> FrameSpec {
    FrameSpec::new(FrameTransform::Rotate {
        axis: Axis::Y,
        param: param.into(),
    })
}

pub fn rz(param: impl Into<FrameParam>) -> FrameSpec {
    FrameSpec::new(FrameTransform::Rotate {
        axis: Axis::Z,
        param: param.into(),
    })
}

/// Fixed transform with identity rotation.
pub fn fixed_translation(x: f64, y: f64, z: f64) -> FrameSpec {
    FrameSpec::new(FrameTransform::Fixed {
        translation: [x, y, z],
        rotation: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finite_difference(transform: &FrameTransform, theta: f64, c: usize) -> Matrix4<f64> {
        let h = 1e-6;
        let plus = transform.local_derivative(theta + h, c).unwrap_or_else(Matrix4::zeros);
        let minus = transform.local_derivative(theta - h, c).unwrap_or_else(Matrix4::zeros);
        (plus - minus) / (2.0 * h)
    }

    #[test]
    fn rotation_derivatives_match_finite_differences() {
        for axis in [Axis::X, Axis::Y, Axis::Z] {
            let transform = FrameTransform::Rotate {
                axis,
                param: "q".into(),
            };
            for c in 0..3 {
                let analytic = transform.local_derivative(0.7, c + 1).unwrap();
                let numeric = finite_difference(&transform, 0.7, c);
                assert!(
                    (analytic - numeric).abs().max() < 1e-8,
                    "axis {axis:?} order {}",
                    c + 1
                );
            }
        }
    }

    #[test]
    fn rotation_block_is_orthonormal() {
        let transform = FrameTransform::Rotate {
            axis: Axis::Y,
            param: "q".into(),
        };
        let g = transform.local_derivative(1.3, 0).unwrap();
        let r = g.fixed_view::<3, 3>(0, 0).into_owned();
        assert!((r.transpose() * r - Matrix3::identity()).abs().max() < 1e-12);
        assert!((r.determinant() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn translation_vanishes_beyond_first_derivative() {
        let transform = FrameTransform::Translate {
            axis: Axis::Z,
            param: 2.0.into(),
        };
        let g = transform.local_derivative(2.0, 0).unwrap();
        assert_eq!(g[(2, 3)], 2.0);
        let d1 = transform.local_derivative(2.0, 1).unwrap();
        assert_eq!(d1[(2, 3)], 1.0);
        assert_eq!(d1[(3, 3)], 0.0);
        assert!(transform.local_derivative(2.0, 2).is_none());
    }

    #[test]
    fn pseudo_inertia_reproduces_rotational_energy() {
        let props = MassProperties {
            mass: 2.0,
            ixx: 0.3,
            iyy: 0.5,
            izz: 0.7,
        };
        let [j1, j2, j3, m] = props.pseudo_inertia();
        assert_eq!(m, 2.0);
        // ω about x only: tr(ŵ J ŵᵀ) = (J2 + J3) ωx²
        assert!((j2 + j3 - props.ixx).abs() < 1e-12);
        assert!((j1 + j3 - props.iyy).abs() < 1e-12);
        assert!((j1 + j2 - props.izz).abs() < 1e-12);
    }

    #[test]
    fn builder_accumulates_children_and_mass() {
        let spec = tx("x")
            .named("Cart")
            .mass(10.0)
            .inertia(0.1, 0.2, 0.3)
            .child(rz("theta"));
        assert_eq!(spec.name.as_deref(), Some("Cart"));
        let mass = spec.mass.unwrap();
        assert_eq!(mass.mass, 10.0);
        assert_eq!(mass.izz, 0.3);
        assert_eq!(spec.children[0].transform.config_name(), Some("theta"));
    }

    #[test]
    fn frame_spec_deserializes_from_json() {
        let json = r#"{
            "name": "Cart",
            "transform": {"type": "Translate", "axis": "X", "param": "x"},
            "mass": {"mass": 10.0},
            "children": [
                {"transform": {"type": "Translate", "axis": "Y", "param": -1.0}}
            ]
        }"#;
        let spec: FrameSpec = serde_json::from_str(json).expect("valid frame json");
        assert_eq!(spec.transform.config_name(), Some("x"));
        assert_eq!(spec.children[0].transform.constant_value(), -1.0);
    }
}
