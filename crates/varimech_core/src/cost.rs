//! Quadratic tracking cost for discrete trajectories.

use nalgebra::{DMatrix, DVector};

use crate::error::{ensure_len, MechanismError, Result};

/// `Σ_k ½(x_k − xd_k)ᵀQ(x_k − xd_k) + ½(u_k − ud_k)ᵀR(u_k − ud_k)` plus the terminal
/// term `½(x_N − xd_N)ᵀQf(x_N − xd_N)`, where `Qf` defaults to `Q`.
///
/// The weights are public so callers can re-weight between optimizer passes.
#[derive(Debug, Clone, PartialEq)]
pub struct DCost {
    pub xd: Vec<DVector<f64>>,
    pub ud: Vec<DVector<f64>>,
    pub q: DMatrix<f64>,
    pub r: DMatrix<f64>,
    pub qf: Option<DMatrix<f64>>,
}

impl DCost {
    pub fn new(
        xd: Vec<DVector<f64>>,
        ud: Vec<DVector<f64>>,
        q: DMatrix<f64>,
        r: DMatrix<f64>,
    ) -> Result<Self> {
        if xd.is_empty() {
            return Err(MechanismError::InvalidSetting(
                "desired trajectory is empty".into(),
            ));
        }
        ensure_len("desired input trajectory", xd.len() - 1, ud.len())?;
        let nx = xd[0].len();
        ensure_len("state weight", nx, q.nrows())?;
        ensure_len("state weight", nx, q.ncols())?;
        for x in &xd {
            ensure_len("desired state", nx, x.len())?;
        }
        let nu = r.nrows();
        ensure_len("input weight", nu, r.ncols())?;
        for u in &ud {
            ensure_len("desired input", nu, u.len())?;
        }
        Ok(Self {
            xd,
            ud,
            q,
            r,
            qf: None,
        })
    }

    pub fn with_terminal(mut self, qf: DMatrix<f64>) -> Result<Self> {
        ensure_len("terminal weight", self.nx(), qf.nrows())?;
        ensure_len("terminal weight", self.nx(), qf.ncols())?;
        self.qf = Some(qf);
        Ok(self)
    }

    pub fn nx(&self) -> usize {
        self.q.nrows()
    }

    pub fn nu(&self) -> usize {
        self.r.nrows()
    }

    pub fn kf(&self) -> usize {
        self.ud.len()
    }

    pub fn terminal_weight(&self) -> &DMatrix<f64> {
        self.qf.as_ref().unwrap_or(&self.q)
    }

    pub fn l(&self, x: &DVector<f64>, u: &DVector<f64>, k: usize) -> Result<f64> {
        let dx = self.state_error(x, k)?;
        let du = self.input_error(u, k)?;
        Ok(0.5 * dx.dot(&(&self.q * &dx)) + 0.5 * du.dot(&(&self.r * &du)))
    }

    pub fn l_dx(&self, x: &DVector<f64>, k: usize) -> Result<DVector<f64>> {
        Ok(&self.q * self.state_error(x, k)?)
    }

    pub fn l_du(&self, u: &DVector<f64>, k: usize) -> Result<DVector<f64>> {
        Ok(&self.r * self.input_error(u, k)?)
    }

    pub fn l_dxdx(&self) -> &DMatrix<f64> {
        &self.q
    }

    pub fn l_dudu(&self) -> &DMatrix<f64> {
        &self.r
    }

    pub fn l_dxdu(&self) -> DMatrix<f64> {
        DMatrix::zeros(self.nx(), self.nu())
    }

    pub fn m(&self, x: &DVector<f64>) -> Result<f64> {
        let dx = self.terminal_error(x)?;
        Ok(0.5 * dx.dot(&(self.terminal_weight() * &dx)))
    }

    pub fn m_dx(&self, x: &DVector<f64>) -> Result<DVector<f64>> {
        Ok(self.terminal_weight() * self.terminal_error(x)?)
    }

    pub fn m_dxdx(&self) -> &DMatrix<f64> {
        self.terminal_weight()
    }

    /// Total cost of a trajectory with `x.len() == u.len() + 1 == kf + 1`.
    pub fn total(&self, x: &[DVector<f64>], u: &[DVector<f64>]) -> Result<f64> {
        ensure_len("input trajectory", self.kf(), u.len())?;
        ensure_len("state trajectory", self.kf() + 1, x.len())?;
        let mut total = self.m(&x[self.kf()])?;
        for (k, (xk, uk)) in x.iter().zip(u).enumerate() {
            total += self.l(xk, uk, k)?;
        }
        Ok(total)
    }

    fn step_index(&self, k: usize) -> Result<()> {
        if k >= self.kf() {
            return Err(MechanismError::InvalidIndex {
                kind: "time step",
                index: k,
                len: self.kf(),
            });
        }
        Ok(())
    }

    fn state_error(&self, x: &DVector<f64>, k: usize) -> Result<DVector<f64>> {
        self.step_index(k)?;
        weighted_error(x, &self.xd[k], &self.q, "state vector", "state weight")
    }

    fn input_error(&self, u: &DVector<f64>, k: usize) -> Result<DVector<f64>> {
        self.step_index(k)?;
        weighted_error(u, &self.ud[k], &self.r, "input vector", "input weight")
    }

    fn terminal_error(&self, x: &DVector<f64>) -> Result<DVector<f64>> {
        let xd = self.xd.get(self.kf()).ok_or(MechanismError::InvalidIndex {
            kind: "time step",
            index: self.kf(),
            len: self.xd.len(),
        })?;
        weighted_error(x, xd, self.terminal_weight(), "state vector", "terminal weight")
    }
}

fn weighted_error(
    value: &DVector<f64>,
    desired: &DVector<f64>,
    weight: &DMatrix<f64>,
    what: &'static str,
    weight_name: &'static str,
) -> Result<DVector<f64>> {
    ensure_len(what, desired.len(), value.len())?;
    ensure_len(weight_name, value.len(), weight.nrows())?;
    ensure_len(weight_name, value.len(), weight.ncols())?;
    Ok(value - desired)
}
