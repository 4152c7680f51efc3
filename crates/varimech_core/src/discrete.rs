//! Discrete system: the midpoint integrator viewed as a map `x_{k+1} = f(x_k, u_k, k)`
//! with state `x = (q, p)` on a fixed time grid.

use std::sync::Arc;

use nalgebra::{DMatrix, DVector};

use crate::error::{ensure_len, MechanismError, Result};
use crate::mvi::{FirstOrder, MidpointVi, SecondOrder};
use crate::system::System;
use crate::traits::DiscreteDynamics;
use crate::trajectory::Trajectory;

pub struct DSystem {
    mvi: MidpointVi,
    time: Vec<f64>,
    k: usize,
    first: Option<FirstOrder>,
    second: Option<SecondOrder>,
}

impl DSystem {
    pub fn new(mvi: MidpointVi, time: Vec<f64>) -> Result<Self> {
        if time.len() < 2 {
            return Err(MechanismError::InvalidSetting(
                "time grid needs at least two samples".into(),
            ));
        }
        if time.windows(2).any(|w| !(w[1] > w[0])) {
            return Err(MechanismError::InvalidSetting(
                "time grid must be strictly increasing".into(),
            ));
        }
        Ok(Self {
            mvi,
            time,
            k: 0,
            first: None,
            second: None,
        })
    }

    pub fn system(&self) -> &Arc<System> {
        self.mvi.system()
    }

    pub fn mvi(&self) -> &MidpointVi {
        &self.mvi
    }

    pub fn nq(&self) -> usize {
        self.system().nq()
    }

    /// Index of the step most recently taken (from `t_k` to `t_{k+1}`).
    pub fn k(&self) -> usize {
        self.k
    }

    /// Stacks `q` and `p`; missing parts are zero.
    pub fn build_state(
        &self,
        q: Option<&DVector<f64>>,
        p: Option<&DVector<f64>>,
    ) -> Result<DVector<f64>> {
        let n = self.nq();
        let mut x = DVector::zeros(2 * n);
        if let Some(q) = q {
            ensure_len("configuration vector", n, q.len())?;
            x.rows_mut(0, n).copy_from(q);
        }
        if let Some(p) = p {
            ensure_len("momentum vector", n, p.len())?;
            x.rows_mut(n, n).copy_from(p);
        }
        Ok(x)
    }

    pub fn split_state(&self, x: &DVector<f64>) -> Result<(DVector<f64>, DVector<f64>)> {
        let n = self.nq();
        ensure_len("state vector", 2 * n, x.len())?;
        Ok((x.rows(0, n).into_owned(), x.rows(n, n).into_owned()))
    }

    /// Stacks per-sample configurations and momenta into states; absent sequences are
    /// zero. Inputs default to zero for every step.
    pub fn build_trajectory(
        &self,
        q: Option<&[DVector<f64>]>,
        p: Option<&[DVector<f64>]>,
        u: Option<&[DVector<f64>]>,
    ) -> Result<(Vec<DVector<f64>>, Vec<DVector<f64>>)> {
        let samples = self.time.len();
        if let Some(q) = q {
            ensure_len("configuration trajectory", samples, q.len())?;
        }
        if let Some(p) = p {
            ensure_len("momentum trajectory", samples, p.len())?;
        }
        let x = (0..samples)
            .map(|k| self.build_state(q.map(|q| &q[k]), p.map(|p| &p[k])))
            .collect::<Result<Vec<_>>>()?;
        let nu = self.nu();
        let u = match u {
            Some(u) => {
                ensure_len("input trajectory", self.kf(), u.len())?;
                for uk in u {
                    ensure_len("input vector", nu, uk.len())?;
                }
                u.to_vec()
            }
            None => vec![DVector::zeros(nu); self.kf()],
        };
        Ok((x, u))
    }

    pub fn split_trajectory(&self, x: &[DVector<f64>], u: &[DVector<f64>]) -> Result<Trajectory> {
        let system = self.system();
        let mut trajectory = Trajectory::from_states(
            &self.time,
            system.config_names(),
            system.input_names().to_vec(),
            x,
            u,
        )?;
        trajectory.lambda = vec![vec![0.0; system.nc()]; self.kf()];
        Ok(trajectory)
    }

    /// Open-loop simulation from `x0`, recording multipliers.
    pub fn simulate(&mut self, x0: &DVector<f64>, u: &[DVector<f64>]) -> Result<Trajectory> {
        ensure_len("input trajectory", self.kf(), u.len())?;
        let mut x = Vec::with_capacity(self.time.len());
        let mut lambda = Vec::with_capacity(self.kf());
        x.push(x0.clone());
        for (k, uk) in u.iter().enumerate() {
            if k == 0 {
                self.set(x0, uk, 0)?;
            } else {
                self.step(uk)?;
            }
            x.push(self.f());
            lambda.push(self.mvi.lambda().iter().copied().collect());
        }
        let mut trajectory = self.split_trajectory(&x, u)?;
        trajectory.lambda = lambda;
        Ok(trajectory)
    }

    /// Maps a trajectory of `source` onto this system's variables by name.
    pub fn import_trajectory(
        &self,
        source: &System,
        x: &[DVector<f64>],
        u: &[DVector<f64>],
    ) -> Result<(Vec<DVector<f64>>, Vec<DVector<f64>>)> {
        let trajectory = Trajectory::from_states(
            &self.time,
            source.config_names(),
            source.input_names().to_vec(),
            x,
            u,
        )?;
        let imported = trajectory.import_into(self.system())?;
        Ok((imported.states()?, imported.inputs()?))
    }

    fn first_order(&mut self) -> Result<&FirstOrder> {
        let first = match self.first.take() {
            Some(first) => first,
            None => self.mvi.first_order()?,
        };
        Ok(self.first.insert(first))
    }

    fn second_order(&mut self) -> Result<&SecondOrder> {
        let second = match self.second.take() {
            Some(second) => second,
            None => self.mvi.second_order()?,
        };
        Ok(self.second.insert(second))
    }

    /// `Σ_i z_i ∂²f_i/∂ξ²` over `ξ = (x, u)`.
    fn contracted_hessian(&mut self, z: &DVector<f64>) -> Result<DMatrix<f64>> {
        let n = self.nq();
        ensure_len("costate vector", 2 * n, z.len())?;
        let second = self.second_order()?;
        let dim = second.q2.first().map_or(0, |m| m.nrows());
        let mut out = DMatrix::zeros(dim, dim);
        for i in 0..n {
            out += &second.q2[i] * z[i];
            out += &second.p2[i] * z[n + i];
        }
        Ok(out)
    }

    fn invalidate(&mut self) {
        self.first = None;
        self.second = None;
    }
}

impl DiscreteDynamics for DSystem {
    fn nx(&self) -> usize {
        2 * self.nq()
    }

    fn nu(&self) -> usize {
        self.system().nu()
    }

    fn time(&self) -> &[f64] {
        &self.time
    }

    fn set(&mut self, x: &DVector<f64>, u: &DVector<f64>, k: usize) -> Result<()> {
        if k >= self.kf() {
            return Err(MechanismError::InvalidIndex {
                kind: "time step",
                index: k,
                len: self.kf(),
            });
        }
        let (q, p) = self.split_state(x)?;
        self.invalidate();
        self.mvi.initialize_from_state(self.time[k], &q, &p)?;
        self.mvi.step(self.time[k + 1], u)?;
        self.k = k;
        Ok(())
    }

    fn step(&mut self, u: &DVector<f64>) -> Result<()> {
        let next = self.k + 1;
        if next >= self.kf() {
            return Err(MechanismError::InvalidIndex {
                kind: "time step",
                index: next,
                len: self.kf(),
            });
        }
        self.invalidate();
        self.mvi.step(self.time[next + 1], u)?;
        self.k = next;
        Ok(())
    }

    fn f(&self) -> DVector<f64> {
        let n = self.nq();
        let mut x = DVector::zeros(2 * n);
        x.rows_mut(0, n).copy_from(self.mvi.q());
        x.rows_mut(n, n).copy_from(self.mvi.p());
        x
    }

    fn fdx(&mut self) -> Result<DMatrix<f64>> {
        let n = self.nq();
        let first = self.first_order()?;
        let mut a = DMatrix::zeros(2 * n, 2 * n);
        a.rows_mut(0, n).copy_from(&first.q2.columns(0, 2 * n));
        a.rows_mut(n, n).copy_from(&first.p2.columns(0, 2 * n));
        Ok(a)
    }

    fn fdu(&mut self) -> Result<DMatrix<f64>> {
        let n = self.nq();
        let nu = self.nu();
        let first = self.first_order()?;
        let mut b = DMatrix::zeros(2 * n, nu);
        b.rows_mut(0, n).copy_from(&first.q2.columns(2 * n, nu));
        b.rows_mut(n, n).copy_from(&first.p2.columns(2 * n, nu));
        Ok(b)
    }

    fn fdxdx(&mut self, z: &DVector<f64>) -> Result<DMatrix<f64>> {
        let nx = self.nx();
        Ok(self.contracted_hessian(z)?.view((0, 0), (nx, nx)).into_owned())
    }

    fn fdxdu(&mut self, z: &DVector<f64>) -> Result<DMatrix<f64>> {
        let (nx, nu) = (self.nx(), self.nu());
        Ok(self.contracted_hessian(z)?.view((0, nx), (nx, nu)).into_owned())
    }

    fn fdudu(&mut self, z: &DVector<f64>) -> Result<DMatrix<f64>> {
        let (nx, nu) = (self.nx(), self.nu());
        Ok(self.contracted_hessian(z)?.view((nx, nx), (nu, nu)).into_owned())
    }
}
