//! Time-varying linear-quadratic solvers.
//!
//! Both solvers run the same backward Riccati sweep over the value function
//! `V_k(z) = ½zᵀP_k z + b_kᵀz`, starting from the terminal weights. Each stage
//! factors `Γ_k = R_k + B_kᵀP_{k+1}B_k` with Cholesky, so an indefinite stage model is
//! reported as `Singular` rather than producing a meaningless policy.

use nalgebra::{DMatrix, DVector};

use crate::error::{ensure_len, MechanismError, Result};

/// `min Σ_k [½zᵀQ_k z + zᵀS_k v + ½vᵀR_k v + q_kᵀz + r_kᵀv] + ½z_NᵀQ_N z_N + q_Nᵀz_N`
/// subject to `z_{k+1} = A_k z_k + B_k v_k`.
#[derive(Debug, Clone)]
pub struct LqProblem<'a> {
    pub a: &'a [DMatrix<f64>],
    pub b: &'a [DMatrix<f64>],
    pub q: Vec<DMatrix<f64>>,
    pub s: Vec<DMatrix<f64>>,
    pub r: Vec<DMatrix<f64>>,
    pub q_terminal: DMatrix<f64>,
    pub q_linear: Vec<DVector<f64>>,
    pub r_linear: Vec<DVector<f64>>,
    pub q_terminal_linear: DVector<f64>,
}

impl<'a> LqProblem<'a> {
    /// Pure quadratic problem with constant weights and no cross terms.
    pub fn quadratic(
        a: &'a [DMatrix<f64>],
        b: &'a [DMatrix<f64>],
        q: &DMatrix<f64>,
        r: &DMatrix<f64>,
        q_terminal: &DMatrix<f64>,
    ) -> Self {
        let kf = a.len();
        let nx = q.nrows();
        let nu = r.nrows();
        Self {
            a,
            b,
            q: vec![q.clone(); kf],
            s: vec![DMatrix::zeros(nx, nu); kf],
            r: vec![r.clone(); kf],
            q_terminal: q_terminal.clone(),
            q_linear: vec![DVector::zeros(nx); kf],
            r_linear: vec![DVector::zeros(nu); kf],
            q_terminal_linear: DVector::zeros(nx),
        }
    }

    pub fn kf(&self) -> usize {
        self.a.len()
    }

    fn validate(&self) -> Result<()> {
        let kf = self.kf();
        ensure_len("input Jacobian sequence", kf, self.b.len())?;
        ensure_len("state weight sequence", kf, self.q.len())?;
        ensure_len("cross weight sequence", kf, self.s.len())?;
        ensure_len("input weight sequence", kf, self.r.len())?;
        ensure_len("linear state term sequence", kf, self.q_linear.len())?;
        ensure_len("linear input term sequence", kf, self.r_linear.len())?;
        let nx = self.q_terminal.nrows();
        ensure_len("terminal state weight", nx, self.q_terminal.ncols())?;
        ensure_len("terminal linear term", nx, self.q_terminal_linear.len())?;
        for k in 0..kf {
            ensure_len("state Jacobian", nx, self.a[k].nrows())?;
            ensure_len("state Jacobian", nx, self.a[k].ncols())?;
            ensure_len("input Jacobian", nx, self.b[k].nrows())?;
            let nu = self.b[k].ncols();
            ensure_len("state weight", nx, self.q[k].nrows())?;
            ensure_len("state weight", nx, self.q[k].ncols())?;
            ensure_len("input weight", nu, self.r[k].nrows())?;
            ensure_len("input weight", nu, self.r[k].ncols())?;
            ensure_len("cross weight", nx, self.s[k].nrows())?;
            ensure_len("cross weight", nu, self.s[k].ncols())?;
            ensure_len("linear state term", nx, self.q_linear[k].len())?;
            ensure_len("linear input term", nu, self.r_linear[k].len())?;
        }
        Ok(())
    }
}

/// Affine policy `v_k = −K_k z_k − C_k`.
#[derive(Debug, Clone, PartialEq)]
pub struct LqSolution {
    pub gains: Vec<DMatrix<f64>>,
    pub feedforward: Vec<DVector<f64>>,
}

impl LqSolution {
    /// Applies the policy from `z0`, returning states `z_0..z_N` and inputs `v_0..v_{N-1}`.
    pub fn rollout(
        &self,
        a: &[DMatrix<f64>],
        b: &[DMatrix<f64>],
        z0: DVector<f64>,
    ) -> (Vec<DVector<f64>>, Vec<DVector<f64>>) {
        let kf = self.gains.len();
        let mut z = Vec::with_capacity(kf + 1);
        let mut v = Vec::with_capacity(kf);
        z.push(z0);
        for k in 0..kf {
            let vk = -(&self.gains[k] * &z[k]) - &self.feedforward[k];
            let next = &a[k] * &z[k] + &b[k] * &vk;
            z.push(next);
            v.push(vk);
        }
        (z, v)
    }
}

/// Backward Riccati sweep for the affine LQ problem.
pub fn solve_tv_lq(problem: &LqProblem<'_>) -> Result<LqSolution> {
    problem.validate()?;
    let kf = problem.kf();
    let mut p = problem.q_terminal.clone();
    let mut bias = problem.q_terminal_linear.clone();
    let mut gains = vec![DMatrix::zeros(0, 0); kf];
    let mut feedforward = vec![DVector::zeros(0); kf];

    for k in (0..kf).rev() {
        let a = &problem.a[k];
        let b = &problem.b[k];
        let bt_p = b.transpose() * &p;
        let gamma = &problem.r[k] + &bt_p * b;
        let chol = gamma.clone().cholesky().ok_or(MechanismError::Singular {
            context: "Riccati stage input weight",
        })?;

        let coupling = &bt_p * a + problem.s[k].transpose();
        let excess = b.transpose() * &bias + &problem.r_linear[k];
        let gain = chol.solve(&coupling);
        let ff = chol.solve(&excess);

        let next_p = &problem.q[k] + a.transpose() * &p * a - gain.transpose() * &gamma * &gain;
        p = (&next_p + next_p.transpose()) * 0.5;
        bias = &problem.q_linear[k] + a.transpose() * &bias - gain.transpose() * &excess;

        gains[k] = gain;
        feedforward[k] = ff;
    }

    Ok(LqSolution { gains, feedforward })
}

/// Feedback gains of the time-varying LQR with constant weights.
pub fn solve_tv_lqr(
    a: &[DMatrix<f64>],
    b: &[DMatrix<f64>],
    q: &DMatrix<f64>,
    r: &DMatrix<f64>,
    q_terminal: &DMatrix<f64>,
) -> Result<Vec<DMatrix<f64>>> {
    let problem = LqProblem::quadratic(a, b, q, r, q_terminal);
    Ok(solve_tv_lq(&problem)?.gains)
}
