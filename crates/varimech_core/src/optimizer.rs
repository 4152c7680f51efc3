//! Projection-operator trajectory optimization over discrete dynamics.
//!
//! Every iterate is a feasible trajectory. An iteration linearizes the dynamics along it,
//! computes an LQR projection gain, solves a time-varying LQ problem for the descent
//! direction `ζ = (dX, dU)` and searches along `γ ↦ project(X + γ dX, U + γ dU)`.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::cost::DCost;
use crate::discrete::DSystem;
use crate::error::{ensure_len, MechanismError, Result};
use crate::lqr::{solve_tv_lq, solve_tv_lqr, LqProblem};
use crate::traits::{check_trajectory, DiscreteDynamics};

/// Quadratic model used for the descent direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DescentMethod {
    /// Identity weights.
    Steepest,
    /// Cost Hessians only.
    Quasi,
    /// Cost Hessians plus the costate-weighted curvature of the dynamics.
    Newton,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerSettings {
    /// Iterations that use `first_method` before switching to `second_method`.
    pub first_order_iterations: usize,
    pub first_method: DescentMethod,
    pub second_method: DescentMethod,
    pub armijo_alpha: f64,
    pub armijo_beta: f64,
    pub armijo_max_iterations: usize,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            first_order_iterations: 10,
            first_method: DescentMethod::Quasi,
            second_method: DescentMethod::Newton,
            armijo_alpha: 1e-5,
            armijo_beta: 0.7,
            armijo_max_iterations: 30,
        }
    }
}

impl OptimizerSettings {
    fn validate(&self) -> Result<()> {
        if !(self.armijo_alpha > 0.0 && self.armijo_alpha < 1.0) {
            return Err(MechanismError::InvalidSetting(
                "armijo_alpha must lie in (0, 1)".into(),
            ));
        }
        if !(self.armijo_beta > 0.0 && self.armijo_beta < 1.0) {
            return Err(MechanismError::InvalidSetting(
                "armijo_beta must lie in (0, 1)".into(),
            ));
        }
        if self.armijo_max_iterations == 0 {
            return Err(MechanismError::InvalidSetting(
                "armijo_max_iterations must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationOutcome {
    pub converged: bool,
    pub x: Vec<DVector<f64>>,
    pub u: Vec<DVector<f64>>,
    pub cost: f64,
    /// Descent iterations attempted, including the one that detected convergence.
    pub iterations: usize,
}

impl OptimizationOutcome {
    pub fn require_converged(self) -> Result<Self> {
        if self.converged {
            Ok(self)
        } else {
            Err(MechanismError::OptimizationNotConverged {
                iterations: self.iterations,
                cost: self.cost,
            })
        }
    }
}

/// Result of one call to [`DOptimizer::step`].
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Converged {
        dcost: f64,
    },
    Accepted {
        x: Vec<DVector<f64>>,
        u: Vec<DVector<f64>>,
        cost: f64,
        dcost: f64,
        gamma: f64,
    },
    LineSearchFailed {
        dcost: f64,
    },
}

/// Observer for optimizer progress. All hooks default to no-ops.
pub trait OptimizerMonitor {
    fn optimize_begin(&mut self, _cost: f64) {}

    fn optimize_end(&mut self, _converged: bool, _cost: f64, _iterations: usize) {}

    fn iteration(&mut self, _iteration: usize, _method: DescentMethod, _cost: f64, _dcost: f64) {}

    /// The Newton model was rejected and the iteration continues with `Quasi`.
    fn method_fallback(&mut self, _iteration: usize, _reason: &str) {}

    /// One Armijo candidate; `cost` is `None` when its simulation failed.
    fn armijo_evaluation(&mut self, _iteration: usize, _gamma: f64, _cost: Option<f64>) {}

    fn line_search_failed(&mut self, _iteration: usize, _cost: f64) {}
}

/// Reports progress as `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMonitor;

impl OptimizerMonitor for TracingMonitor {
    fn optimize_begin(&mut self, cost: f64) {
        info!(cost, "optimization started");
    }

    fn optimize_end(&mut self, converged: bool, cost: f64, iterations: usize) {
        info!(converged, cost, iterations, "optimization finished");
    }

    fn iteration(&mut self, iteration: usize, method: DescentMethod, cost: f64, dcost: f64) {
        debug!(iteration, ?method, cost, dcost, "descent direction");
    }

    fn method_fallback(&mut self, iteration: usize, reason: &str) {
        warn!(iteration, reason, "newton model rejected, using quasi-newton direction");
    }

    fn armijo_evaluation(&mut self, iteration: usize, gamma: f64, cost: Option<f64>) {
        trace!(iteration, gamma, ?cost, "armijo candidate");
    }

    fn line_search_failed(&mut self, iteration: usize, cost: f64) {
        warn!(iteration, cost, "armijo line search exhausted");
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SilentMonitor;

impl OptimizerMonitor for SilentMonitor {}

struct Direction {
    method: DescentMethod,
    dx: Vec<DVector<f64>>,
    du: Vec<DVector<f64>>,
    dcost: f64,
}

/// Trajectory optimizer for a quadratic tracking cost.
///
/// `cost` and the projection weights may be changed between runs.
pub struct DOptimizer<D = DSystem> {
    pub dsys: D,
    pub cost: DCost,
    pub q_proj: DMatrix<f64>,
    pub r_proj: DMatrix<f64>,
    settings: OptimizerSettings,
    monitor: Box<dyn OptimizerMonitor>,
}

impl<D: DiscreteDynamics> DOptimizer<D> {
    pub fn new(dsys: D, cost: DCost) -> Result<Self> {
        ensure_len("cost state dimension", dsys.nx(), cost.nx())?;
        ensure_len("cost input dimension", dsys.nu(), cost.nu())?;
        ensure_len("cost horizon", dsys.kf(), cost.kf())?;
        let (nx, nu) = (dsys.nx(), dsys.nu());
        Ok(Self {
            dsys,
            cost,
            q_proj: DMatrix::identity(nx, nx),
            r_proj: DMatrix::identity(nu, nu),
            settings: OptimizerSettings::default(),
            monitor: Box::new(TracingMonitor),
        })
    }

    pub fn with_settings(mut self, settings: OptimizerSettings) -> Result<Self> {
        settings.validate()?;
        self.settings = settings;
        Ok(self)
    }

    pub fn with_monitor(mut self, monitor: impl OptimizerMonitor + 'static) -> Self {
        self.monitor = Box::new(monitor);
        self
    }

    pub fn settings(&self) -> &OptimizerSettings {
        &self.settings
    }

    pub fn calc_cost(&self, x: &[DVector<f64>], u: &[DVector<f64>]) -> Result<f64> {
        self.cost.total(x, u)
    }

    /// Directional derivative of the cost along `(dx, du)`.
    pub fn calc_dcost(
        &self,
        x: &[DVector<f64>],
        u: &[DVector<f64>],
        dx: &[DVector<f64>],
        du: &[DVector<f64>],
    ) -> Result<f64> {
        check_trajectory(self.cost.kf(), x, u)?;
        check_trajectory(self.cost.kf(), dx, du)?;
        let kf = u.len();
        let mut dcost = self.cost.m_dx(&x[kf])?.dot(&dx[kf]);
        for k in 0..kf {
            dcost += self.cost.l_dx(&x[k], k)?.dot(&dx[k]) + self.cost.l_du(&u[k], k)?.dot(&du[k]);
        }
        Ok(dcost)
    }

    /// Re-simulates `(x, u)` open loop from `x[0]` and returns it with its cost.
    pub fn start(
        &mut self,
        x: &[DVector<f64>],
        u: &[DVector<f64>],
    ) -> Result<(Vec<DVector<f64>>, Vec<DVector<f64>>, f64)> {
        check_trajectory(self.dsys.kf(), x, u)?;
        let open_loop = vec![DMatrix::zeros(self.dsys.nu(), self.dsys.nx()); self.dsys.kf()];
        let (x, u) = self.dsys.project(x, u, &open_loop)?;
        let cost = self.calc_cost(&x, &u)?;
        Ok((x, u, cost))
    }

    /// One descent iteration from the feasible trajectory `(x, u)` with cost `cost`.
    pub fn step(
        &mut self,
        iteration: usize,
        x: &[DVector<f64>],
        u: &[DVector<f64>],
        cost: f64,
        tolerance: f64,
    ) -> Result<StepOutcome> {
        let method = if iteration < self.settings.first_order_iterations {
            self.settings.first_method
        } else {
            self.settings.second_method
        };

        let (a, b) = self.dsys.linearize_trajectory(x, u)?;
        let gains = solve_tv_lqr(&a, &b, &self.q_proj, &self.r_proj, &self.q_proj)?;
        let direction = self.descent_direction(iteration, method, x, u, &a, &b, &gains)?;
        let dcost = direction.dcost;
        self.monitor.iteration(iteration, direction.method, cost, dcost);

        if dcost.abs() < tolerance {
            return Ok(StepOutcome::Converged { dcost });
        }

        let mut gamma = 1.0;
        for _ in 0..self.settings.armijo_max_iterations {
            let x_bar: Vec<_> = x.iter().zip(&direction.dx).map(|(xk, d)| xk + d * gamma).collect();
            let u_bar: Vec<_> = u.iter().zip(&direction.du).map(|(uk, d)| uk + d * gamma).collect();
            match self.dsys.project(&x_bar, &u_bar, &gains) {
                Ok((xc, uc)) => {
                    let candidate = self.calc_cost(&xc, &uc)?;
                    self.monitor
                        .armijo_evaluation(iteration, gamma, Some(candidate));
                    if candidate < cost + self.settings.armijo_alpha * gamma * dcost {
                        return Ok(StepOutcome::Accepted {
                            x: xc,
                            u: uc,
                            cost: candidate,
                            dcost,
                            gamma,
                        });
                    }
                }
                Err(MechanismError::IntegrationFailure { .. }) => {
                    self.monitor.armijo_evaluation(iteration, gamma, None);
                }
                Err(err) => return Err(err),
            }
            gamma *= self.settings.armijo_beta;
        }

        self.monitor.line_search_failed(iteration, cost);
        Ok(StepOutcome::LineSearchFailed { dcost })
    }

    /// Optimizes from `(x, u)`, which is first re-simulated to make it feasible.
    ///
    /// Stops when `|Dcost·ζ| < tolerance`, after `max_steps` iterations, or when the
    /// line search fails; the last accepted trajectory is returned in every case.
    pub fn optimize(
        &mut self,
        x: &[DVector<f64>],
        u: &[DVector<f64>],
        max_steps: usize,
        tolerance: f64,
    ) -> Result<OptimizationOutcome> {
        if max_steps == 0 {
            return Err(MechanismError::InvalidSetting(
                "max_steps must be greater than zero".into(),
            ));
        }
        if !(tolerance > 0.0) {
            return Err(MechanismError::InvalidSetting(
                "tolerance must be positive".into(),
            ));
        }

        let (mut x, mut u, mut cost) = self.start(x, u)?;
        self.monitor.optimize_begin(cost);
        let mut converged = false;
        let mut iterations = 0;
        for iteration in 0..max_steps {
            iterations = iteration + 1;
            match self.step(iteration, &x, &u, cost, tolerance)? {
                StepOutcome::Converged { .. } => {
                    converged = true;
                    break;
                }
                StepOutcome::Accepted {
                    x: next_x,
                    u: next_u,
                    cost: next_cost,
                    ..
                } => {
                    x = next_x;
                    u = next_u;
                    cost = next_cost;
                }
                StepOutcome::LineSearchFailed { .. } => break,
            }
        }
        self.monitor.optimize_end(converged, cost, iterations);
        Ok(OptimizationOutcome {
            converged,
            x,
            u,
            cost,
            iterations,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn descent_direction(
        &mut self,
        iteration: usize,
        method: DescentMethod,
        x: &[DVector<f64>],
        u: &[DVector<f64>],
        a: &[DMatrix<f64>],
        b: &[DMatrix<f64>],
        gains: &[DMatrix<f64>],
    ) -> Result<Direction> {
        if method != DescentMethod::Newton {
            return self.model_direction(method, x, u, a, b, gains);
        }
        match self.model_direction(method, x, u, a, b, gains) {
            Ok(direction) if direction.dcost <= 0.0 => return Ok(direction),
            Ok(_) => self
                .monitor
                .method_fallback(iteration, "not a descent direction"),
            Err(MechanismError::Singular { .. }) => self
                .monitor
                .method_fallback(iteration, "model is not positive definite"),
            Err(err) => return Err(err),
        }
        self.model_direction(DescentMethod::Quasi, x, u, a, b, gains)
    }

    fn model_direction(
        &mut self,
        method: DescentMethod,
        x: &[DVector<f64>],
        u: &[DVector<f64>],
        a: &[DMatrix<f64>],
        b: &[DMatrix<f64>],
        gains: &[DMatrix<f64>],
    ) -> Result<Direction> {
        let kf = a.len();
        let (nx, nu) = (self.dsys.nx(), self.dsys.nu());
        let mut problem = LqProblem::quadratic(
            a,
            b,
            self.cost.l_dxdx(),
            self.cost.l_dudu(),
            self.cost.m_dxdx(),
        );
        for k in 0..kf {
            problem.q_linear[k] = self.cost.l_dx(&x[k], k)?;
            problem.r_linear[k] = self.cost.l_du(&u[k], k)?;
        }
        problem.q_terminal_linear = self.cost.m_dx(&x[kf])?;

        match method {
            DescentMethod::Steepest => {
                problem.q = vec![DMatrix::identity(nx, nx); kf];
                problem.r = vec![DMatrix::identity(nu, nu); kf];
                problem.q_terminal = DMatrix::identity(nx, nx);
            }
            DescentMethod::Quasi => {}
            DescentMethod::Newton => {
                let mut mu = problem.q_terminal_linear.clone();
                for k in (0..kf).rev() {
                    self.dsys.set(&x[k], &u[k], k)?;
                    problem.q[k] += self.dsys.fdxdx(&mu)?;
                    problem.s[k] = self.cost.l_dxdu() + self.dsys.fdxdu(&mu)?;
                    problem.r[k] += self.dsys.fdudu(&mu)?;
                    let closed_loop = &a[k] - &b[k] * &gains[k];
                    mu = &problem.q_linear[k] - gains[k].transpose() * &problem.r_linear[k]
                        + closed_loop.transpose() * &mu;
                }
            }
        }

        let solution = solve_tv_lq(&problem)?;
        let (dx, du) = solution.rollout(a, b, DVector::zeros(nx));
        let dcost = self.calc_dcost(x, u, &dx, &du)?;
        Ok(Direction {
            method,
            dx,
            du,
            dcost,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;

    use super::*;
    use crate::frame::{rz, tx, ty};
    use crate::mvi::MidpointVi;
    use crate::system::System;
    use crate::terms::{ForceSpec, PotentialSpec};
    use crate::traits::testing::LinearDynamics;

    fn vector(values: &[f64]) -> DVector<f64> {
        DVector::from_column_slice(values)
    }

    /// Scalar dynamics `x_{k+1} = x_k + u_k + κu_k²`.
    struct Curved {
        kappa: f64,
        time: Vec<f64>,
        x: f64,
        u: f64,
    }

    impl DiscreteDynamics for Curved {
        fn nx(&self) -> usize {
            1
        }

        fn nu(&self) -> usize {
            1
        }

        fn time(&self) -> &[f64] {
            &self.time
        }

        fn set(&mut self, x: &DVector<f64>, u: &DVector<f64>, _k: usize) -> Result<()> {
            self.x = x[0];
            self.step(u)
        }

        fn step(&mut self, u: &DVector<f64>) -> Result<()> {
            self.u = u[0];
            self.x += self.u + self.kappa * self.u * self.u;
            Ok(())
        }

        fn f(&self) -> DVector<f64> {
            vector(&[self.x])
        }

        fn fdx(&mut self) -> Result<DMatrix<f64>> {
            Ok(DMatrix::identity(1, 1))
        }

        fn fdu(&mut self) -> Result<DMatrix<f64>> {
            Ok(DMatrix::from_element(1, 1, 1.0 + 2.0 * self.kappa * self.u))
        }

        fn fdxdx(&mut self, _z: &DVector<f64>) -> Result<DMatrix<f64>> {
            Ok(DMatrix::zeros(1, 1))
        }

        fn fdxdu(&mut self, _z: &DVector<f64>) -> Result<DMatrix<f64>> {
            Ok(DMatrix::zeros(1, 1))
        }

        fn fdudu(&mut self, z: &DVector<f64>) -> Result<DMatrix<f64>> {
            Ok(DMatrix::from_element(1, 1, 2.0 * self.kappa * z[0]))
        }
    }

    #[derive(Clone, Default)]
    struct Recorder(Rc<RefCell<Vec<String>>>);

    impl OptimizerMonitor for Recorder {
        fn method_fallback(&mut self, iteration: usize, reason: &str) {
            self.0.borrow_mut().push(format!("{iteration}: {reason}"));
        }
    }

    fn linear_cost(steps: usize) -> DCost {
        DCost::new(
            vec![vector(&[1.0, 0.0]); steps + 1],
            vec![vector(&[0.0]); steps],
            DMatrix::identity(2, 2),
            DMatrix::identity(1, 1) * 0.1,
        )
        .unwrap()
    }

    #[test]
    fn settings_are_validated() {
        let steps = 3;
        let optimizer = DOptimizer::new(LinearDynamics::double_integrator(steps), linear_cost(steps))
            .unwrap();
        let err = optimizer
            .with_settings(OptimizerSettings {
                armijo_beta: 1.0,
                ..Default::default()
            })
            .err()
            .unwrap();
        assert_eq!(
            err,
            MechanismError::InvalidSetting("armijo_beta must lie in (0, 1)".into())
        );
    }

    #[test]
    fn cost_dimensions_must_match_dynamics() {
        let err = DOptimizer::new(LinearDynamics::double_integrator(4), linear_cost(3))
            .err()
            .unwrap();
        assert!(err.to_string().contains("cost horizon"));
    }

    #[test]
    fn linear_problem_converges_after_one_step() {
        let steps = 10;
        let mut optimizer =
            DOptimizer::new(LinearDynamics::double_integrator(steps), linear_cost(steps))
                .unwrap()
                .with_monitor(SilentMonitor);
        let x = vec![DVector::zeros(2); steps + 1];
        let u = vec![DVector::zeros(1); steps];
        let initial = optimizer.calc_cost(&x, &u).unwrap();
        let outcome = optimizer.optimize(&x, &u, 10, 1e-8).unwrap();
        assert!(outcome.converged);
        assert!(outcome.iterations <= 3);
        assert!(outcome.cost < initial);

        let again = optimizer
            .optimize(&outcome.x, &outcome.u, 5, 1e-8)
            .unwrap()
            .require_converged()
            .unwrap();
        assert_eq!(again.iterations, 1);
        assert!((again.cost - outcome.cost).abs() < 1e-12);
    }

    #[test]
    fn line_search_failure_returns_last_trajectory() {
        let steps = 4;
        let mut optimizer =
            DOptimizer::new(LinearDynamics::double_integrator(steps), linear_cost(steps))
                .unwrap()
                .with_settings(OptimizerSettings {
                    first_method: DescentMethod::Steepest,
                    armijo_alpha: 0.999,
                    armijo_max_iterations: 1,
                    ..Default::default()
                })
                .unwrap()
                .with_monitor(SilentMonitor);
        let x = vec![DVector::zeros(2); steps + 1];
        let u = vec![DVector::zeros(1); steps];
        let outcome = optimizer.optimize(&x, &u, 5, 1e-10).unwrap();
        assert!(!outcome.converged);
        assert_eq!(outcome.u, u);
        let err = outcome.require_converged().unwrap_err();
        assert!(matches!(
            err,
            MechanismError::OptimizationNotConverged { iterations: 1, .. }
        ));
    }

    #[test]
    fn indefinite_newton_model_falls_back() {
        let steps = 5;
        let dynamics = Curved {
            kappa: -1.0,
            time: (0..=steps).map(|k| k as f64).collect(),
            x: 0.0,
            u: 0.0,
        };
        let cost = DCost::new(
            vec![vector(&[0.0]); steps + 1],
            vec![vector(&[0.0]); steps],
            DMatrix::identity(1, 1),
            DMatrix::identity(1, 1) * 0.01,
        )
        .unwrap();
        let recorder = Recorder::default();
        let mut optimizer = DOptimizer::new(dynamics, cost)
            .unwrap()
            .with_settings(OptimizerSettings {
                first_order_iterations: 0,
                ..Default::default()
            })
            .unwrap()
            .with_monitor(recorder.clone());
        let x = vec![vector(&[5.0]); steps + 1];
        let u = vec![vector(&[0.0]); steps];
        let outcome = optimizer.optimize(&x, &u, 3, 1e-10).unwrap();

        let events = recorder.0.borrow();
        assert!(events
            .first()
            .is_some_and(|e| e.starts_with("0: ")), "{events:?}");
        assert!(outcome.cost < optimizer.calc_cost(&x, &u).unwrap());
    }

    fn cart_pendulum_with(torque: bool) -> Arc<System> {
        let mut system = System::new(&[tx("x").named("Cart").mass(10.0).child(
            rz("theta").child(ty(-1.0).named("Pendulum").mass(1.0)),
        )])
        .unwrap();
        system
            .add_potential(&PotentialSpec::gravity(0.0, -9.8, 0.0))
            .unwrap()
            .add_force(&ForceSpec::joint_force("x", "x-force"))
            .unwrap();
        if torque {
            system
                .add_force(&ForceSpec::joint_force("theta", "theta-force"))
                .unwrap();
        }
        Arc::new(system)
    }

    fn cart_pendulum() -> Arc<System> {
        cart_pendulum_with(true)
    }

    fn dsystem_for(system: Arc<System>, steps: usize, dt: f64) -> DSystem {
        DSystem::new(
            MidpointVi::new(system),
            (0..=steps).map(|k| k as f64 * dt).collect(),
        )
        .unwrap()
    }

    fn dsystem(steps: usize, dt: f64) -> DSystem {
        dsystem_for(cart_pendulum(), steps, dt)
    }

    #[test]
    fn simulated_trajectory_is_already_optimal() {
        let steps = 20;
        let mut dsys = dsystem(steps, 0.05);
        let x0 = vector(&[0.0, 0.3, 0.0, 0.0]);
        let u: Vec<_> = (0..steps).map(|k| vector(&[(k as f64 * 0.3).sin(), 0.1])).collect();
        let reference = dsys.simulate(&x0, &u).unwrap();
        let cost = DCost::new(
            reference.states().unwrap(),
            u.clone(),
            DMatrix::identity(4, 4),
            DMatrix::identity(2, 2),
        )
        .unwrap();
        let mut optimizer = DOptimizer::new(dsys, cost)
            .unwrap()
            .with_monitor(SilentMonitor);
        let outcome = optimizer.optimize(&reference.states().unwrap(), &u, 5, 1e-10).unwrap();
        assert!(outcome.converged);
        assert!(outcome.iterations <= 1);
        assert_eq!(outcome.cost, 0.0);
        assert_eq!(outcome.u, u);
    }

    #[test]
    fn raising_pendulum_torque_weight_hands_the_swing_to_the_cart() {
        let (steps, dt) = (40, 0.05);
        let amplitude = 0.3;
        let horizon = steps as f64 * dt;
        let theta_d: Vec<f64> = (0..=steps)
            .map(|k| {
                let phase = 2.0 * std::f64::consts::PI * k as f64 * dt / horizon;
                0.5 * amplitude * (1.0 - phase.cos())
            })
            .collect();
        let max_theta_error = |x: &[DVector<f64>]| {
            x.iter()
                .zip(&theta_d)
                .map(|(xk, td)| (xk[1] - td).abs())
                .fold(0.0, f64::max)
        };

        let full = cart_pendulum();
        let dsys = dsystem_for(Arc::clone(&full), steps, dt);
        let qd: Vec<_> = theta_d.iter().map(|&td| vector(&[0.0, td])).collect();
        let (xd, ud) = dsys.build_trajectory(Some(qd.as_slice()), None, None).unwrap();
        let q = DMatrix::from_diagonal(&vector(&[1e-3, 100.0, 1e-3, 1e-3]));
        let r = |torque: f64| DMatrix::from_diagonal(&vector(&[1e-4, torque]));
        let cost = DCost::new(xd.clone(), ud.clone(), q.clone(), r(1e-2)).unwrap();
        let mut optimizer = DOptimizer::new(dsys, cost)
            .unwrap()
            .with_monitor(SilentMonitor);

        let torque_norm = |u: &[DVector<f64>]| u.iter().map(|uk| uk[1] * uk[1]).sum::<f64>().sqrt();
        let mut outcome = optimizer
            .optimize(&vec![DVector::zeros(4); steps + 1], &ud, 30, 1e-6)
            .unwrap();
        let mut norms = vec![torque_norm(&outcome.u)];
        for weight in [1.0, 1e2, 1e4] {
            optimizer.cost.r = r(weight);
            outcome = optimizer.optimize(&outcome.x, &outcome.u, 30, 1e-6).unwrap();
            norms.push(torque_norm(&outcome.u));
        }
        for pair in norms.windows(2) {
            assert!(pair[1] <= pair[0], "torque grew along the weight ladder: {norms:?}");
        }
        assert!(norms[3] < 1e-2 * norms[0], "{norms:?}");

        let reduced = cart_pendulum_with(false);
        let mut dsys = dsystem_for(Arc::clone(&reduced), steps, dt);
        let (x, u) = dsys.import_trajectory(&full, &outcome.x, &outcome.u).unwrap();
        assert_eq!(u[0].len(), 1);
        let seeded = dsys.simulate(&x[0], &u).unwrap().states().unwrap();
        let cost = DCost::new(xd, vec![DVector::zeros(1); steps], q, DMatrix::identity(1, 1) * 1e-4)
            .unwrap();
        let mut optimizer = DOptimizer::new(dsys, cost)
            .unwrap()
            .with_monitor(SilentMonitor);
        let result = optimizer.optimize(&seeded, &u, 40, 1e-6).unwrap();
        assert!(result.converged, "reduced optimization stopped after {}", result.iterations);
        let error = max_theta_error(&result.x);
        assert!(error < 0.25 * amplitude, "θ tracking error {error}");
    }
}
