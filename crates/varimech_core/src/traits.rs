use nalgebra::{DMatrix, DVector};

use crate::error::{ensure_len, Result};

/// Discrete-time controlled dynamics `x_{k+1} = f(x_k, u_k, k)` over a fixed time grid,
/// with exact first and second derivatives.
///
/// Implementors keep a working point: `set` seeds `x_k` and takes one step with `u_k`,
/// `step` continues from the last result, and the derivative accessors describe the most
/// recent step.
pub trait DiscreteDynamics {
    /// State dimension.
    fn nx(&self) -> usize;

    /// Input dimension.
    fn nu(&self) -> usize;

    /// Time grid; the horizon is `time().len() - 1` steps.
    fn time(&self) -> &[f64];

    fn kf(&self) -> usize {
        self.time().len().saturating_sub(1)
    }

    /// Seeds state `x` at `t_k` and steps with `u` to `t_{k+1}`.
    fn set(&mut self, x: &DVector<f64>, u: &DVector<f64>, k: usize) -> Result<()>;

    /// Advances one more step with `u`.
    fn step(&mut self, u: &DVector<f64>) -> Result<()>;

    /// State at the end of the most recent step.
    fn f(&self) -> DVector<f64>;

    fn fdx(&mut self) -> Result<DMatrix<f64>>;

    fn fdu(&mut self) -> Result<DMatrix<f64>>;

    /// `Σ_i z_i ∂²f_i/∂x²`.
    fn fdxdx(&mut self, z: &DVector<f64>) -> Result<DMatrix<f64>>;

    /// `Σ_i z_i ∂²f_i/∂x∂u`.
    fn fdxdu(&mut self, z: &DVector<f64>) -> Result<DMatrix<f64>>;

    /// `Σ_i z_i ∂²f_i/∂u²`.
    fn fdudu(&mut self, z: &DVector<f64>) -> Result<DMatrix<f64>>;

    /// Jacobians `(A_k, B_k)` of every step along a trajectory.
    fn linearize_trajectory(
        &mut self,
        x: &[DVector<f64>],
        u: &[DVector<f64>],
    ) -> Result<(Vec<DMatrix<f64>>, Vec<DMatrix<f64>>)> {
        check_trajectory(self.kf(), x, u)?;
        let mut a = Vec::with_capacity(self.kf());
        let mut b = Vec::with_capacity(self.kf());
        for k in 0..self.kf() {
            self.set(&x[k], &u[k], k)?;
            a.push(self.fdx()?);
            b.push(self.fdu()?);
        }
        Ok((a, b))
    }

    /// Simulates the feedback law `u_k = ū_k − K_k (x_k − x̄_k)` from `x̄_0`, returning a
    /// feasible trajectory near `(x̄, ū)`.
    fn project(
        &mut self,
        x_bar: &[DVector<f64>],
        u_bar: &[DVector<f64>],
        gains: &[DMatrix<f64>],
    ) -> Result<(Vec<DVector<f64>>, Vec<DVector<f64>>)> {
        let kf = self.kf();
        check_trajectory(kf, x_bar, u_bar)?;
        ensure_len("feedback gain sequence", kf, gains.len())?;
        let mut x = Vec::with_capacity(kf + 1);
        let mut u = Vec::with_capacity(kf);
        x.push(x_bar[0].clone());
        for k in 0..kf {
            let uk = &u_bar[k] - &gains[k] * (&x[k] - &x_bar[k]);
            if k == 0 {
                self.set(&x[k], &uk, k)?;
            } else {
                self.step(&uk)?;
            }
            x.push(self.f());
            u.push(uk);
        }
        Ok((x, u))
    }
}

pub(crate) fn check_trajectory(kf: usize, x: &[DVector<f64>], u: &[DVector<f64>]) -> Result<()> {
    ensure_len("state trajectory", kf + 1, x.len())?;
    ensure_len("input trajectory", kf, u.len())
}
