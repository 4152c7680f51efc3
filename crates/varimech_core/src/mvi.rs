//! Midpoint variational integrator.
//!
//! Each step solves the forced, constrained discrete Euler–Lagrange equations
//!
//! ```text
//! p1 + ½Δt L_q(q̄, v) − L_q̇(q̄, v) + Δt F(q̄, v, u1) − Dh(q1)ᵀ λ = 0
//! h(q2) = 0
//! ```
//!
//! for `(q2, λ)` with `q̄ = (q1 + q2)/2` and `v = (q2 − q1)/Δt`, then sets
//! `p2 = ½Δt L_q + L_q̇`. The Newton Jacobian at the converged iterate is factored once
//! and reused for the first- and second-order sensitivities of `(q2, p2, λ)` with respect
//! to `ξ = (q1, p1, u1)`.

use std::sync::Arc;

use nalgebra::{DMatrix, DVector, Dyn, LU};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ensure_len, MechanismError, Result};
use crate::system::{DynamicsPoint, EvalLevel, System};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MidpointSettings {
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for MidpointSettings {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            tolerance: 1e-10,
        }
    }
}

impl MidpointSettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(MechanismError::InvalidSetting(
                "max_iterations must be greater than zero".into(),
            ));
        }
        if !(self.tolerance > 0.0) {
            return Err(MechanismError::InvalidSetting(
                "tolerance must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntegratorStatus {
    Uninitialized,
    Initialized,
    Stepped,
    /// A step failed; the integrator must be re-initialized.
    Failed,
}

/// Jacobians of the step outputs with respect to `ξ = (q1, p1, u1)`.
#[derive(Debug, Clone)]
pub struct FirstOrder {
    pub q2: DMatrix<f64>,
    pub p2: DMatrix<f64>,
    pub lambda: DMatrix<f64>,
}

/// Hessians of each step output component with respect to `ξ`, indexed `[i][(a, b)]`.
#[derive(Debug, Clone)]
pub struct SecondOrder {
    pub q2: Vec<DMatrix<f64>>,
    pub p2: Vec<DMatrix<f64>>,
    pub lambda: Vec<DMatrix<f64>>,
}

struct StepCache {
    dt: f64,
    lu: LU<f64, Dyn, Dyn>,
    phi_w: DMatrix<f64>,
    psi_y: DMatrix<f64>,
    d2h1: Vec<DMatrix<f64>>,
}

pub struct MidpointVi {
    system: Arc<System>,
    settings: MidpointSettings,
    status: IntegratorStatus,
    t1: f64,
    q1: DVector<f64>,
    p1: DVector<f64>,
    u1: DVector<f64>,
    t2: f64,
    q2: DVector<f64>,
    p2: DVector<f64>,
    lambda: DVector<f64>,
    velocity: DVector<f64>,
    cache: Option<StepCache>,
}

/// `∂w/∂q1`, `∂w/∂q2`, `∂w/∂u` for `w = (q̄, v, u)`.
fn tangent_maps(n: usize, nu: usize, dt: f64) -> (DMatrix<f64>, DMatrix<f64>, DMatrix<f64>) {
    let nw = 2 * n + nu;
    let mut dq1 = DMatrix::zeros(nw, n);
    let mut dq2 = DMatrix::zeros(nw, n);
    let mut du = DMatrix::zeros(nw, nu);
    for i in 0..n {
        dq1[(i, i)] = 0.5;
        dq1[(n + i, i)] = -1.0 / dt;
        dq2[(i, i)] = 0.5;
        dq2[(n + i, i)] = 1.0 / dt;
    }
    for a in 0..nu {
        du[(2 * n + a, a)] = 1.0;
    }
    (dq1, dq2, du)
}

/// Discrete Legendre transforms `(Φ, Ψ)` = (`D1Ld + Δt F`, `D2Ld`) at a midpoint.
fn legendre(point: &DynamicsPoint, n: usize, dt: f64) -> (DVector<f64>, DVector<f64>) {
    let l_q = point.l_y.rows(0, n);
    let l_dq = point.l_y.rows(n, n);
    let phi = l_q * (0.5 * dt) - l_dq + &point.force.f * dt;
    let psi = l_q * (0.5 * dt) + l_dq;
    (phi, psi)
}

fn legendre_jacobians(point: &DynamicsPoint, n: usize, dt: f64) -> (DMatrix<f64>, DMatrix<f64>) {
    let l_qy = point.l_yy.rows(0, n);
    let l_dqy = point.l_yy.rows(n, n);
    let mut phi_w = &point.force.f_w * dt;
    let kinetic = l_qy * (0.5 * dt) - l_dqy;
    let mut block = phi_w.columns_mut(0, 2 * n);
    block += kinetic;
    let psi_y = l_qy * (0.5 * dt) + l_dqy;
    (phi_w, psi_y)
}

impl MidpointVi {
    /// Integrator with `MidpointSettings::default()`, which always passes `validate`.
    pub fn new(system: Arc<System>) -> Self {
        let n = system.nq();
        let nu = system.nu();
        let nc = system.nc();
        Self {
            system,
            settings: MidpointSettings::default(),
            status: IntegratorStatus::Uninitialized,
            t1: 0.0,
            q1: DVector::zeros(n),
            p1: DVector::zeros(n),
            u1: DVector::zeros(nu),
            t2: 0.0,
            q2: DVector::zeros(n),
            p2: DVector::zeros(n),
            lambda: DVector::zeros(nc),
            velocity: DVector::zeros(n),
            cache: None,
        }
    }

    pub fn with_settings(system: Arc<System>, settings: MidpointSettings) -> Result<Self> {
        settings.validate()?;
        let mut mvi = Self::new(system);
        mvi.settings = settings;
        Ok(mvi)
    }

    pub fn system(&self) -> &Arc<System> {
        &self.system
    }

    pub fn settings(&self) -> &MidpointSettings {
        &self.settings
    }

    pub fn status(&self) -> IntegratorStatus {
        self.status
    }

    pub fn t(&self) -> f64 {
        self.t2
    }

    pub fn q(&self) -> &DVector<f64> {
        &self.q2
    }

    pub fn p(&self) -> &DVector<f64> {
        &self.p2
    }

    /// Multipliers of the most recent step.
    pub fn lambda(&self) -> &DVector<f64> {
        &self.lambda
    }

    pub fn t_prev(&self) -> f64 {
        self.t1
    }

    pub fn q_prev(&self) -> &DVector<f64> {
        &self.q1
    }

    pub fn p_prev(&self) -> &DVector<f64> {
        &self.p1
    }

    /// Input applied over the most recent step.
    pub fn u(&self) -> &DVector<f64> {
        &self.u1
    }

    /// Sets the current state directly; multipliers reset to zero.
    pub fn initialize_from_state(
        &mut self,
        t: f64,
        q: &DVector<f64>,
        p: &DVector<f64>,
    ) -> Result<()> {
        ensure_len("configuration vector", self.system.nq(), q.len())?;
        ensure_len("momentum vector", self.system.nq(), p.len())?;
        let velocity = self.system.velocity_from_momentum(q, p)?;
        self.reset(t, q.clone(), p.clone(), velocity);
        Ok(())
    }

    /// Sets the current state at `(t1, q1)` with the momentum implied by the discrete
    /// motion from `(t0, q0)`.
    pub fn initialize_from_configs(
        &mut self,
        t0: f64,
        q0: &DVector<f64>,
        t1: f64,
        q1: &DVector<f64>,
    ) -> Result<()> {
        let n = self.system.nq();
        ensure_len("configuration vector", n, q0.len())?;
        ensure_len("configuration vector", n, q1.len())?;
        let dt = t1 - t0;
        if !(dt > 0.0) {
            return Err(MechanismError::InvalidSetting(format!(
                "time step must be positive (got {dt})"
            )));
        }
        let qbar = (q0 + q1) * 0.5;
        let velocity = (q1 - q0) / dt;
        let point = self.system.evaluate(
            &qbar,
            &velocity,
            &DVector::zeros(self.system.nu()),
            EvalLevel::Jacobian,
        )?;
        let (_, p1) = legendre(&point, n, dt);
        self.reset(t1, q1.clone(), p1, velocity);
        Ok(())
    }

    fn reset(&mut self, t: f64, q: DVector<f64>, p: DVector<f64>, velocity: DVector<f64>) {
        self.t1 = t;
        self.q1 = q.clone();
        self.p1 = p.clone();
        self.u1 = DVector::zeros(self.system.nu());
        self.t2 = t;
        self.q2 = q;
        self.p2 = p;
        self.lambda = DVector::zeros(self.system.nc());
        self.velocity = velocity;
        self.cache = None;
        self.status = IntegratorStatus::Initialized;
    }

    /// Advances from the current state to time `t2` holding input `u` over the step.
    pub fn step(&mut self, t2: f64, u: &DVector<f64>) -> Result<()> {
        match self.status {
            IntegratorStatus::Initialized | IntegratorStatus::Stepped => {}
            status => {
                return Err(MechanismError::InvalidSetting(format!(
                    "cannot step an integrator in state {status:?}"
                )))
            }
        }
        ensure_len("input vector", self.system.nu(), u.len())?;
        let dt = t2 - self.t2;
        if !(dt > 0.0) {
            return Err(MechanismError::InvalidSetting(format!(
                "time step must be positive (got {dt})"
            )));
        }

        self.t1 = self.t2;
        self.q1 = self.q2.clone();
        self.p1 = self.p2.clone();
        self.u1 = u.clone();
        self.cache = None;

        match self.solve(dt) {
            Ok(()) => {
                self.t2 = t2;
                self.status = IntegratorStatus::Stepped;
                Ok(())
            }
            Err(reason) => {
                debug!(time = self.t1, %reason, "midpoint step failed");
                self.status = IntegratorStatus::Failed;
                Err(MechanismError::IntegrationFailure {
                    time: self.t1,
                    reason,
                })
            }
        }
    }

    fn solve(&mut self, dt: f64) -> std::result::Result<(), String> {
        let system = Arc::clone(&self.system);
        let n = system.nq();
        let nc = system.nc();
        let nu = system.nu();
        let constraints1 = system
            .evaluate_constraints(&self.q1, 2)
            .map_err(|e| e.to_string())?;
        let (_, dw_dq2, _) = tangent_maps(n, nu, dt);

        let mut q2 = &self.q1 + &self.velocity * dt;
        let mut lambda = self.lambda.clone();

        for iteration in 0..=self.settings.max_iterations {
            let qbar = (&self.q1 + &q2) * 0.5;
            let velocity = (&q2 - &self.q1) / dt;
            let point = system
                .evaluate(&qbar, &velocity, &self.u1, EvalLevel::Jacobian)
                .map_err(|e| e.to_string())?;
            let constraints2 = system
                .evaluate_constraints(&q2, 1)
                .map_err(|e| e.to_string())?;

            let (phi, psi) = legendre(&point, n, dt);
            let mut residual = DVector::zeros(n + nc);
            residual
                .rows_mut(0, n)
                .copy_from(&(&self.p1 + phi - constraints1.dh.transpose() * &lambda));
            residual.rows_mut(n, nc).copy_from(&constraints2.h);
            let norm = residual.norm();
            if !norm.is_finite() {
                return Err(format!("non-finite residual at iteration {iteration}"));
            }

            let (phi_w, psi_y) = legendre_jacobians(&point, n, dt);
            let mut jacobian = DMatrix::zeros(n + nc, n + nc);
            jacobian
                .view_mut((0, 0), (n, n))
                .copy_from(&(&phi_w * &dw_dq2));
            jacobian
                .view_mut((0, n), (n, nc))
                .copy_from(&(-constraints1.dh.transpose()));
            jacobian
                .view_mut((n, 0), (nc, n))
                .copy_from(&constraints2.dh);
            let lu = jacobian.lu();

            if norm < self.settings.tolerance {
                self.q2 = q2;
                self.p2 = psi;
                self.lambda = lambda;
                self.velocity = velocity;
                self.cache = Some(StepCache {
                    dt,
                    lu,
                    phi_w,
                    psi_y,
                    d2h1: constraints1.d2h,
                });
                return Ok(());
            }
            if iteration == self.settings.max_iterations {
                return Err(format!(
                    "Newton iteration did not converge in {} steps (|r| = {norm:e})",
                    self.settings.max_iterations
                ));
            }

            let delta = lu
                .solve(&(-residual))
                .ok_or_else(|| format!("singular Newton Jacobian at iteration {iteration}"))?;
            q2 += delta.rows(0, n);
            lambda += delta.rows(n, nc);
        }
        Err("Newton iteration did not run".into())
    }

    fn cache(&self) -> Result<&StepCache> {
        match (&self.status, &self.cache) {
            (IntegratorStatus::Stepped, Some(cache)) => Ok(cache),
            _ => Err(MechanismError::InvalidSetting(
                "sensitivities require a completed step".into(),
            )),
        }
    }

    /// Dimension of `ξ = (q1, p1, u1)`.
    pub fn input_dimension(&self) -> usize {
        2 * self.system.nq() + self.system.nu()
    }

    /// Exact Jacobians of `(q2, p2, λ)` with respect to `(q1, p1, u1)`.
    pub fn first_order(&self) -> Result<FirstOrder> {
        self.first_order_with_tangent().map(|(first, _)| first)
    }

    /// First-order sensitivities plus `W = dw/dξ`, the tangent of the midpoint argument.
    fn first_order_with_tangent(&self) -> Result<(FirstOrder, DMatrix<f64>)> {
        let cache = self.cache()?;
        let n = self.system.nq();
        let nu = self.system.nu();
        let nc = self.system.nc();
        let nxi = self.input_dimension();
        let (dw_dq1, dw_dq2, dw_du) = tangent_maps(n, nu, cache.dt);

        let mut r_xi = DMatrix::zeros(n + nc, nxi);
        let mut r_q1 = &cache.phi_w * &dw_dq1;
        for (c, hessian) in cache.d2h1.iter().enumerate() {
            r_q1 -= hessian * self.lambda[c];
        }
        r_xi.view_mut((0, 0), (n, n)).copy_from(&r_q1);
        r_xi.view_mut((0, n), (n, n)).fill_with_identity();
        r_xi
            .view_mut((0, 2 * n), (n, nu))
            .copy_from(&(&cache.phi_w * &dw_du));

        let dz = -cache.lu.solve(&r_xi).ok_or(MechanismError::Singular {
            context: "sensitivity solve",
        })?;
        let dq2 = dz.rows(0, n).into_owned();
        let dlambda = dz.rows(n, nc).into_owned();

        let mut tangent = &dw_dq2 * &dq2;
        let mut q1_part = tangent.columns_mut(0, n);
        q1_part += &dw_dq1;
        let mut u_part = tangent.columns_mut(2 * n, nu);
        u_part += &dw_du;
        let dp2 = &cache.psi_y * tangent.rows(0, 2 * n);

        Ok((
            FirstOrder {
                q2: dq2,
                p2: dp2,
                lambda: dlambda,
            },
            tangent,
        ))
    }

    /// Exact Hessians of `(q2, p2, λ)` with respect to `(q1, p1, u1)`.
    pub fn second_order(&self) -> Result<SecondOrder> {
        let (first, tangent) = self.first_order_with_tangent()?;
        let cache = self.cache()?;
        let system = &self.system;
        let n = system.nq();
        let nc = system.nc();
        let nw = 2 * n + system.nu();
        let nxi = self.input_dimension();
        let dt = cache.dt;

        let qbar = (&self.q1 + &self.q2) * 0.5;
        let velocity = (&self.q2 - &self.q1) / dt;
        let point = system.evaluate(&qbar, &velocity, &self.u1, EvalLevel::Hessian)?;
        let constraints1 = system.evaluate_constraints(&self.q1, 3)?;
        let constraints2 = system.evaluate_constraints(&self.q2, 2)?;
        let (Some(l_yyy), Some(f_ww)) = (point.l_yyy.as_ref(), point.force.f_ww.as_ref()) else {
            return Err(MechanismError::Singular {
                context: "missing third derivatives",
            });
        };

        let y_tangent = tangent.rows(0, 2 * n).into_owned();
        let mut rhs = DMatrix::zeros(n + nc, nxi * nxi);
        let mut p2_known = Vec::with_capacity(n);
        for i in 0..n {
            let mut phi_ww = &f_ww[i] * dt;
            let kinetic = &l_yyy[i] * (0.5 * dt) - &l_yyy[n + i];
            let mut block = phi_ww.view_mut((0, 0), (2 * n, 2 * n));
            block += kinetic;
            debug_assert_eq!(phi_ww.nrows(), nw);
            let mut second = tangent.transpose() * phi_ww * &tangent;

            for c in 0..nc {
                let third = &constraints1.d3h[c][i];
                let lambda = self.lambda[c];
                for k in 0..n {
                    for l in 0..n {
                        second[(k, l)] -= lambda * third[(k, l)];
                    }
                }
                let row = constraints1.d2h[c].row(i);
                for a in 0..nxi {
                    for b in 0..n {
                        let coupling = first.lambda[(c, a)] * row[b];
                        second[(a, b)] -= coupling;
                        second[(b, a)] -= coupling;
                    }
                }
            }
            for a in 0..nxi {
                for b in 0..nxi {
                    rhs[(i, a * nxi + b)] = second[(a, b)];
                }
            }

            let psi_yy = &l_yyy[i] * (0.5 * dt) + &l_yyy[n + i];
            p2_known.push(y_tangent.transpose() * psi_yy * &y_tangent);
        }
        for c in 0..nc {
            let second = first.q2.transpose() * &constraints2.d2h[c] * &first.q2;
            for a in 0..nxi {
                for b in 0..nxi {
                    rhs[(n + c, a * nxi + b)] = second[(a, b)];
                }
            }
        }

        let solution = -cache.lu.solve(&rhs).ok_or(MechanismError::Singular {
            context: "second-order sensitivity solve",
        })?;
        let unpack = |row: usize| DMatrix::from_fn(nxi, nxi, |a, b| solution[(row, a * nxi + b)]);
        let q2: Vec<DMatrix<f64>> = (0..n).map(&unpack).collect();
        let lambda: Vec<DMatrix<f64>> = (0..nc).map(|c| unpack(n + c)).collect();

        // p2 = Ψ(y) with y linear in (q1, q2): only q2's curvature adds to Yᵀ Ψ_yy Y.
        let p2 = p2_known
            .into_iter()
            .enumerate()
            .map(|(i, mut hessian)| {
                for j in 0..n {
                    let weight = 0.5 * cache.psi_y[(i, j)] + cache.psi_y[(i, n + j)] / dt;
                    if weight != 0.0 {
                        hessian += &q2[j] * weight;
                    }
                }
                hessian
            })
            .collect();

        Ok(SecondOrder { q2, p2, lambda })
    }
}
