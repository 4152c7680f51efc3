//! Kinematic tree: an arena of frames rooted at the world frame.
//!
//! [`KinematicTree::evaluate`] produces a [`TreeState`] holding, for every frame, the
//! world transform and its partial derivatives with respect to multisets of up to
//! [`MAX_ORDER`] configuration variables. Only variables on a frame's root path can
//! influence it, so derivatives are stored sparsely, keyed by sorted index multisets,
//! and absent keys mean "identically zero".

use std::collections::HashMap;

use nalgebra::{DVector, Matrix3, Matrix4, Vector3};

use crate::error::{ensure_len, MechanismError, Result};
use crate::frame::{FrameSpec, FrameTransform, MassProperties};

/// Highest derivative order of a frame transform the tree can produce.
pub const MAX_ORDER: usize = 4;

pub const WORLD: usize = 0;

#[derive(Debug, Clone)]
pub struct Frame {
    pub name: Option<String>,
    pub transform: FrameTransform,
    pub config: Option<usize>,
    pub mass: Option<MassProperties>,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    /// Configuration indices on the path from the root, sorted.
    pub path: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub name: String,
    pub index: usize,
    pub frame: usize,
}

#[derive(Debug, Clone)]
pub struct KinematicTree {
    frames: Vec<Frame>,
    configs: Vec<Config>,
    names: HashMap<String, usize>,
}

/// Sorted multiset of configuration indices identifying a partial derivative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DerivKey {
    len: u8,
    idx: [usize; MAX_ORDER],
}

impl DerivKey {
    pub const EMPTY: DerivKey = DerivKey {
        len: 0,
        idx: [0; MAX_ORDER],
    };

    /// Builds a key from unsorted indices; `None` if more than `MAX_ORDER` are given.
    pub fn new(indices: &[usize]) -> Option<Self> {
        if indices.len() > MAX_ORDER {
            return None;
        }
        let mut idx = [0usize; MAX_ORDER];
        for (slot, &i) in idx.iter_mut().zip(indices) {
            *slot = i;
        }
        idx[..indices.len()].sort_unstable();
        Some(Self {
            len: indices.len() as u8,
            idx,
        })
    }

    pub fn order(&self) -> usize {
        self.len as usize
    }

    fn with_repeated(&self, var: usize, count: usize) -> Self {
        let mut key = *self;
        for _ in 0..count {
            key.idx[key.len as usize] = var;
            key.len += 1;
        }
        key.idx[..key.len as usize].sort_unstable();
        key
    }
}

#[derive(Debug, Clone)]
pub struct FrameState {
    pub g: Matrix4<f64>,
    partials: HashMap<DerivKey, Matrix4<f64>>,
}

/// Frame transforms and their derivatives at one configuration.
#[derive(Debug, Clone)]
pub struct TreeState {
    q: DVector<f64>,
    order: usize,
    frames: Vec<FrameState>,
}

impl KinematicTree {
    /// Builds the tree from top-level frame descriptions attached to the world frame.
    pub fn new(specs: &[FrameSpec]) -> Result<Self> {
        let mut tree = Self {
            frames: vec![Frame {
                name: Some("World".to_string()),
                transform: FrameTransform::Fixed {
                    translation: [0.0; 3],
                    rotation: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
                },
                config: None,
                mass: None,
                parent: None,
                children: Vec::new(),
                path: Vec::new(),
            }],
            configs: Vec::new(),
            names: HashMap::from([("World".to_string(), WORLD)]),
        };
        for spec in specs {
            tree.insert(WORLD, spec)?;
        }
        Ok(tree)
    }

    fn insert(&mut self, parent: usize, spec: &FrameSpec) -> Result<()> {
        let index = self.frames.len();
        let mut path = self.frames[parent].path.clone();

        let config = match spec.transform.config_name() {
            Some(name) => {
                if self.configs.iter().any(|c| c.name == name) {
                    return Err(MechanismError::DuplicateName {
                        kind: "configuration",
                        name: name.to_string(),
                    });
                }
                let config_index = self.configs.len();
                self.configs.push(Config {
                    name: name.to_string(),
                    index: config_index,
                    frame: index,
                });
                path.push(config_index);
                Some(config_index)
            }
            None => None,
        };

        let name = spec
            .name
            .clone()
            .or_else(|| spec.transform.config_name().map(str::to_string));
        if let Some(name) = &name {
            if self.names.insert(name.clone(), index).is_some() {
                return Err(MechanismError::DuplicateName {
                    kind: "frame",
                    name: name.clone(),
                });
            }
        }

        self.frames.push(Frame {
            name,
            transform: spec.transform.clone(),
            config,
            mass: spec.mass.filter(|m| !m.is_zero()),
            parent: Some(parent),
            children: Vec::new(),
            path,
        });
        self.frames[parent].children.push(index);

        for child in &spec.children {
            self.insert(index, child)?;
        }
        Ok(())
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn configs(&self) -> &[Config] {
        &self.configs
    }

    pub fn nq(&self) -> usize {
        self.configs.len()
    }

    pub fn frame(&self, index: usize) -> Result<&Frame> {
        self.frames.get(index).ok_or(MechanismError::InvalidIndex {
            kind: "frame",
            index,
            len: self.frames.len(),
        })
    }

    pub fn frame_index(&self, name: &str) -> Result<usize> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| MechanismError::unknown("frame", name))
    }

    pub fn config_index(&self, name: &str) -> Result<usize> {
        self.configs
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| MechanismError::unknown("configuration", name))
    }

    /// Frames carrying mass, in arena order.
    pub fn mass_frames(&self) -> impl Iterator<Item = (usize, &MassProperties)> {
        self.frames
            .iter()
            .enumerate()
            .filter_map(|(i, f)| f.mass.as_ref().map(|m| (i, m)))
    }

    /// Evaluates transforms and derivatives up to `order` (at most [`MAX_ORDER`]).
    pub fn evaluate(&self, q: &DVector<f64>, order: usize) -> Result<TreeState> {
        ensure_len("configuration vector", self.nq(), q.len())?;
        if order > MAX_ORDER {
            return Err(MechanismError::InvalidSetting(format!(
                "derivative order {order} exceeds {MAX_ORDER}"
            )));
        }

        let mut states: Vec<FrameState> = Vec::with_capacity(self.frames.len());
        states.push(FrameState {
            g: Matrix4::identity(),
            partials: HashMap::new(),
        });

        for frame in self.frames.iter().skip(1) {
            let parent = &states[frame.parent.unwrap_or(WORLD)];
            let theta = match frame.config {
                Some(c) => q[c],
                None => frame.transform.constant_value(),
            };
            let max_local = if frame.config.is_some() { order } else { 0 };
            let local: Vec<Option<Matrix4<f64>>> = (0..=max_local)
                .map(|c| frame.transform.local_derivative(theta, c))
                .collect();
            let local_g = local[0].unwrap_or_else(Matrix4::identity);

            let g = parent.g * local_g;
            let mut partials = HashMap::new();
            let parent_entries = std::iter::once((DerivKey::EMPTY, &parent.g))
                .chain(parent.partials.iter().map(|(k, m)| (*k, m)));
            for (key, parent_partial) in parent_entries {
                for (c, local_c) in local.iter().enumerate() {
                    if key.order() + c > order || (key.order() == 0 && c == 0) {
                        continue;
                    }
                    let Some(local_c) = local_c else { continue };
                    let own = frame.config.unwrap_or(0);
                    partials.insert(key.with_repeated(own, c), parent_partial * local_c);
                }
            }
            states.push(FrameState { g, partials });
        }

        Ok(TreeState {
            q: q.clone(),
            order,
            frames: states,
        })
    }
}

impl TreeState {
    pub fn q(&self) -> &DVector<f64> {
        &self.q
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn transform(&self, frame: usize) -> &Matrix4<f64> {
        &self.frames[frame].g
    }

    /// Partial derivative of the world transform of `frame` w.r.t. the listed configuration
    /// indices (order irrelevant). An empty list yields the transform itself; `None`
    /// means the derivative is identically zero.
    pub fn partial(&self, frame: usize, indices: &[usize]) -> Option<&Matrix4<f64>> {
        let state = &self.frames[frame];
        if indices.is_empty() {
            return Some(&state.g);
        }
        debug_assert!(
            indices.len() <= self.order,
            "requested derivative order exceeds evaluated order"
        );
        state.partials.get(&DerivKey::new(indices)?)
    }

    /// Number of stored nonzero derivative entries for a frame.
    pub fn partial_count(&self, frame: usize) -> usize {
        self.frames[frame].partials.len()
    }

    pub fn position(&self, frame: usize) -> Vector3<f64> {
        self.frames[frame].g.fixed_view::<3, 1>(0, 3).into_owned()
    }

    /// Derivative of the frame origin; zero when the transform derivative vanishes.
    pub fn position_partial(&self, frame: usize, indices: &[usize]) -> Vector3<f64> {
        self.partial(frame, indices)
            .map(|g| g.fixed_view::<3, 1>(0, 3).into_owned())
            .unwrap_or_else(Vector3::zeros)
    }

    pub fn rotation_partial(&self, frame: usize, indices: &[usize]) -> Matrix3<f64> {
        self.partial(frame, indices)
            .map(|g| g.fixed_view::<3, 3>(0, 0).into_owned())
            .unwrap_or_else(Matrix3::zeros)
    }
}
