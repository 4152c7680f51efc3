//! Mechanical system: kinematic tree plus registered terms.
//!
//! A [`System`] is immutable once built and carries no working point; every query takes
//! `(q, q̇, u)` explicitly so integrators and discrete systems can share one instance
//! through an `Arc`.

use nalgebra::{DMatrix, DVector, Matrix4, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::{ensure_len, MechanismError, Result};
use crate::frame::FrameSpec;
use crate::lagrangian::{self, add_symmetric};
use crate::terms::{
    Constraint, ConstraintSpec, Force, ForcePoint, ForceSpec, Potential, PotentialSpec,
    ScalarTerm,
};
use crate::tree::{KinematicTree, TreeState};

/// Complete serializable description of a mechanism.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MechanismDescription {
    pub frames: Vec<FrameSpec>,
    #[serde(default)]
    pub potentials: Vec<PotentialSpec>,
    #[serde(default)]
    pub forces: Vec<ForceSpec>,
    #[serde(default)]
    pub constraints: Vec<ConstraintSpec>,
}

/// Derivative depth requested from [`System::evaluate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvalLevel {
    /// `L`, `L_y`, `L_yy`, `F`, `F_w`: enough for a Newton step and first sensitivities.
    Jacobian,
    /// Additionally `L_yyy` and `F_ww`.
    Hessian,
}

impl EvalLevel {
    fn lagrangian_order(self) -> usize {
        match self {
            EvalLevel::Jacobian => 2,
            EvalLevel::Hessian => 3,
        }
    }
}

/// Lagrangian `L(q, q̇) = T − V` and generalized forces at one working point.
#[derive(Debug, Clone)]
pub struct DynamicsPoint {
    pub lagrangian: f64,
    /// Gradient over `y = (q, q̇)`.
    pub l_y: DVector<f64>,
    pub l_yy: DMatrix<f64>,
    /// Third derivative indexed `[a][(b, c)]`, present at [`EvalLevel::Hessian`].
    pub l_yyy: Option<Vec<DMatrix<f64>>>,
    pub mass_matrix: DMatrix<f64>,
    pub force: ForcePoint,
}

/// Constraint residuals `h(q)` and derivatives up to the requested order.
#[derive(Debug, Clone)]
pub struct ConstraintPoint {
    pub h: DVector<f64>,
    /// `nc × n`, empty below order 1.
    pub dh: DMatrix<f64>,
    /// One `n × n` Hessian per constraint, empty below order 2.
    pub d2h: Vec<DMatrix<f64>>,
    /// One third-derivative tensor per constraint, empty below order 3.
    pub d3h: Vec<Vec<DMatrix<f64>>>,
}

#[derive(Debug, Clone)]
pub struct System {
    tree: KinematicTree,
    potentials: Vec<Potential>,
    forces: Vec<Force>,
    constraints: Vec<Constraint>,
    inputs: Vec<String>,
}

impl System {
    pub fn new(frames: &[FrameSpec]) -> Result<Self> {
        Ok(Self {
            tree: KinematicTree::new(frames)?,
            potentials: Vec::new(),
            forces: Vec::new(),
            constraints: Vec::new(),
            inputs: Vec::new(),
        })
    }

    pub fn from_description(description: &MechanismDescription) -> Result<Self> {
        let mut system = Self::new(&description.frames)?;
        for potential in &description.potentials {
            system.add_potential(potential)?;
        }
        for force in &description.forces {
            system.add_force(force)?;
        }
        for constraint in &description.constraints {
            system.add_constraint(constraint)?;
        }
        Ok(system)
    }

    pub fn add_potential(&mut self, spec: &PotentialSpec) -> Result<&mut Self> {
        self.potentials.push(spec.resolve(&self.tree)?);
        Ok(self)
    }

    pub fn add_force(&mut self, spec: &ForceSpec) -> Result<&mut Self> {
        let force = spec.resolve(&self.tree, &mut self.inputs)?;
        self.forces.push(force);
        Ok(self)
    }

    pub fn add_constraint(&mut self, spec: &ConstraintSpec) -> Result<&mut Self> {
        self.constraints.push(spec.resolve(&self.tree)?);
        Ok(self)
    }

    pub fn tree(&self) -> &KinematicTree {
        &self.tree
    }

    pub fn potentials(&self) -> &[Potential] {
        &self.potentials
    }

    pub fn forces(&self) -> &[Force] {
        &self.forces
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    pub fn nq(&self) -> usize {
        self.tree.nq()
    }

    pub fn nu(&self) -> usize {
        self.inputs.len()
    }

    pub fn nc(&self) -> usize {
        self.constraints.len()
    }

    pub fn config_names(&self) -> Vec<String> {
        self.tree.configs().iter().map(|c| c.name.clone()).collect()
    }

    pub fn input_names(&self) -> &[String] {
        &self.inputs
    }

    /// Names of all named frames except the world frame, in arena order.
    pub fn frame_names(&self) -> Vec<String> {
        self.tree
            .frames()
            .iter()
            .skip(1)
            .filter_map(|f| f.name.clone())
            .collect()
    }

    pub fn config_index(&self, name: &str) -> Result<usize> {
        self.tree.config_index(name)
    }

    pub fn input_index(&self, name: &str) -> Result<usize> {
        self.inputs
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| MechanismError::unknown("input", name))
    }

    pub fn frame_position(&self, q: &DVector<f64>, name: &str) -> Result<Vector3<f64>> {
        let frame = self.tree.frame_index(name)?;
        Ok(self.tree.evaluate(q, 0)?.position(frame))
    }

    /// Homogeneous world transform of a named frame.
    pub fn frame_transform(&self, q: &DVector<f64>, name: &str) -> Result<Matrix4<f64>> {
        let frame = self.tree.frame_index(name)?;
        Ok(*self.tree.evaluate(q, 0)?.transform(frame))
    }

    /// World positions of every named frame (see [`System::frame_names`]).
    pub fn frame_positions(&self, q: &DVector<f64>) -> Result<Vec<(String, Vector3<f64>)>> {
        let state = self.tree.evaluate(q, 0)?;
        Ok(self
            .tree
            .frames()
            .iter()
            .enumerate()
            .skip(1)
            .filter_map(|(i, f)| f.name.clone().map(|name| (name, state.position(i))))
            .collect())
    }

    fn check_point(&self, q: &DVector<f64>, dq: &DVector<f64>, u: &DVector<f64>) -> Result<()> {
        ensure_len("configuration vector", self.nq(), q.len())?;
        ensure_len("velocity vector", self.nq(), dq.len())?;
        ensure_len("input vector", self.nu(), u.len())
    }

    /// Lagrangian, forces and their derivatives at `(q, q̇, u)`.
    pub fn evaluate(
        &self,
        q: &DVector<f64>,
        dq: &DVector<f64>,
        u: &DVector<f64>,
        level: EvalLevel,
    ) -> Result<DynamicsPoint> {
        self.check_point(q, dq, u)?;
        let order = level.lagrangian_order();
        let state = self.tree.evaluate(q, order + 1)?;
        let kinetic = lagrangian::kinetic(&self.tree, &state, dq, order);

        let n = self.nq();
        let mut point = DynamicsPoint {
            lagrangian: kinetic.energy,
            l_y: kinetic.t_y,
            l_yy: kinetic.t_yy,
            l_yyy: kinetic.t_yyy,
            mass_matrix: kinetic.mass_matrix,
            force: ForcePoint::zeros(n, self.nu(), level == EvalLevel::Hessian),
        };

        for potential in &self.potentials {
            point.lagrangian -= potential.value(&self.tree, &state);
            for k in 0..n {
                point.l_y[k] -= potential.partial(&self.tree, &state, &[k]);
                for l in k..n {
                    let v = potential.partial(&self.tree, &state, &[k, l]);
                    point.l_yy[(k, l)] -= v;
                    if k != l {
                        point.l_yy[(l, k)] -= v;
                    }
                }
            }
            if let Some(l_yyy) = point.l_yyy.as_mut() {
                for k in 0..n {
                    for l in k..n {
                        for m in l..n {
                            let v = potential.partial(&self.tree, &state, &[k, l, m]);
                            if v != 0.0 {
                                add_symmetric(l_yyy, (k, l, m), -v);
                            }
                        }
                    }
                }
            }
        }

        for force in &self.forces {
            force.accumulate(&self.tree, &state, dq, u, &mut point.force);
        }
        Ok(point)
    }

    /// Constraint residuals and derivatives up to `order` (0..=3).
    pub fn evaluate_constraints(&self, q: &DVector<f64>, order: usize) -> Result<ConstraintPoint> {
        if order > 3 {
            return Err(MechanismError::InvalidSetting(format!(
                "constraint derivative order {order} exceeds 3"
            )));
        }
        let state = self.tree.evaluate(q, order)?;
        Ok(self.constraints_at(&state, order))
    }

    fn constraints_at(&self, state: &TreeState, order: usize) -> ConstraintPoint {
        let n = self.nq();
        let nc = self.nc();
        let tree = &self.tree;
        ConstraintPoint {
            h: DVector::from_iterator(nc, self.constraints.iter().map(|c| c.value(tree, state))),
            dh: if order >= 1 {
                let mut dh = DMatrix::zeros(nc, n);
                for (row, c) in self.constraints.iter().enumerate() {
                    dh.set_row(row, &c.gradient(tree, state).transpose());
                }
                dh
            } else {
                DMatrix::zeros(0, 0)
            },
            d2h: if order >= 2 {
                self.constraints.iter().map(|c| c.hessian(tree, state)).collect()
            } else {
                Vec::new()
            },
            d3h: if order >= 3 {
                self.constraints.iter().map(|c| c.third(tree, state)).collect()
            } else {
                Vec::new()
            },
        }
    }

    pub fn mass_matrix(&self, q: &DVector<f64>) -> Result<DMatrix<f64>> {
        let state = self.tree.evaluate(q, 1)?;
        Ok(lagrangian::mass_matrix(&self.tree, &state))
    }

    pub fn kinetic_energy(&self, q: &DVector<f64>, dq: &DVector<f64>) -> Result<f64> {
        ensure_len("velocity vector", self.nq(), dq.len())?;
        let m = self.mass_matrix(q)?;
        Ok(0.5 * dq.dot(&(m * dq)))
    }

    pub fn potential_energy(&self, q: &DVector<f64>) -> Result<f64> {
        let state = self.tree.evaluate(q, 0)?;
        Ok(self
            .potentials
            .iter()
            .map(|p| p.value(&self.tree, &state))
            .sum())
    }

    pub fn total_energy(&self, q: &DVector<f64>, dq: &DVector<f64>) -> Result<f64> {
        Ok(self.kinetic_energy(q, dq)? + self.potential_energy(q)?)
    }

    /// Conjugate momentum `p = M(q) q̇`.
    pub fn momentum(&self, q: &DVector<f64>, dq: &DVector<f64>) -> Result<DVector<f64>> {
        ensure_len("velocity vector", self.nq(), dq.len())?;
        Ok(self.mass_matrix(q)? * dq)
    }

    /// Inverts the Legendre transform: `q̇ = M(q)⁻¹ p`.
    pub fn velocity_from_momentum(
        &self,
        q: &DVector<f64>,
        p: &DVector<f64>,
    ) -> Result<DVector<f64>> {
        ensure_len("momentum vector", self.nq(), p.len())?;
        let m = self.mass_matrix(q)?;
        let cholesky = m.cholesky().ok_or(MechanismError::Singular {
            context: "mass matrix",
        })?;
        Ok(cholesky.solve(p))
    }

    /// Continuous accelerations from the constrained Euler–Lagrange equations
    /// `M q̈ + (∂_q L_q̇) q̇ − L_q = F − Dhᵀ λ`, `Dh q̈ + q̇ᵀ ∇²h q̇ = 0`.
    pub fn accelerations(
        &self,
        q: &DVector<f64>,
        dq: &DVector<f64>,
        u: &DVector<f64>,
    ) -> Result<DVector<f64>> {
        let n = self.nq();
        let nc = self.nc();
        let point = self.evaluate(q, dq, u, EvalLevel::Jacobian)?;
        let constraints = self.evaluate_constraints(q, 2)?;

        let mut lhs = DMatrix::zeros(n + nc, n + nc);
        lhs.view_mut((0, 0), (n, n)).copy_from(&point.mass_matrix);
        let mut rhs = DVector::zeros(n + nc);
        let coupling = point.l_yy.view((n, 0), (n, n));
        let rhs_q = point.l_y.rows(0, n) + &point.force.f - coupling * dq;
        rhs.rows_mut(0, n).copy_from(&rhs_q);
        for c in 0..nc {
            let row = constraints.dh.row(c);
            lhs.view_mut((0, n + c), (n, 1)).copy_from(&row.transpose());
            lhs.view_mut((n + c, 0), (1, n)).copy_from(&row);
            rhs[n + c] = -dq.dot(&(&constraints.d2h[c] * dq));
        }
        let solution = lhs.lu().solve(&rhs).ok_or(MechanismError::Singular {
            context: "continuous dynamics",
        })?;
        Ok(solution.rows(0, n).into_owned())
    }
}
