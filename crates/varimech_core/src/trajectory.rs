//! Serializable discrete trajectories.

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::error::{ensure_len, MechanismError, Result};
use crate::system::System;

/// A discrete trajectory together with the names needed to interpret its vectors.
///
/// `q`, `p` have one entry per time sample; `v`, `u` and `lambda` have one entry per
/// step (`time.len() - 1`). `v_k = (q_{k+1} − q_k)/(t_{k+1} − t_k)` is the midpoint
/// velocity of step `k`. Multipliers are zero unless the trajectory was produced by a
/// simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub time: Vec<f64>,
    pub config_names: Vec<String>,
    pub input_names: Vec<String>,
    pub q: Vec<Vec<f64>>,
    pub p: Vec<Vec<f64>>,
    #[serde(default)]
    pub v: Vec<Vec<f64>>,
    pub u: Vec<Vec<f64>>,
    #[serde(default)]
    pub lambda: Vec<Vec<f64>>,
}

impl Trajectory {
    /// Builds a trajectory from stacked states `x = (q, p)` and inputs.
    pub fn from_states(
        time: &[f64],
        config_names: Vec<String>,
        input_names: Vec<String>,
        x: &[DVector<f64>],
        u: &[DVector<f64>],
    ) -> Result<Self> {
        let n = config_names.len();
        ensure_len("state trajectory", time.len(), x.len())?;
        ensure_len("input trajectory", time.len().saturating_sub(1), u.len())?;
        for xk in x {
            ensure_len("state vector", 2 * n, xk.len())?;
        }
        for uk in u {
            ensure_len("input vector", input_names.len(), uk.len())?;
        }
        let v = x
            .windows(2)
            .zip(time.windows(2))
            .map(|(x, t)| {
                let dt = t[1] - t[0];
                (0..n).map(|i| (x[1][i] - x[0][i]) / dt).collect()
            })
            .collect();
        Ok(Self {
            time: time.to_vec(),
            q: x.iter().map(|xk| xk.rows(0, n).iter().copied().collect()).collect(),
            p: x.iter().map(|xk| xk.rows(n, n).iter().copied().collect()).collect(),
            v,
            u: u.iter().map(|uk| uk.iter().copied().collect()).collect(),
            lambda: Vec::new(),
            config_names,
            input_names,
        })
    }

    /// Number of steps.
    pub fn kf(&self) -> usize {
        self.time.len().saturating_sub(1)
    }

    /// Checks every sequence length against `time` and every row against the names.
    /// `v` and `lambda` may be empty; non-empty multiplier rows must share one length.
    pub fn validate(&self) -> Result<()> {
        let samples = self.time.len();
        let (n, nu, kf) = (self.config_names.len(), self.input_names.len(), self.kf());
        ensure_len("configuration trajectory", samples, self.q.len())?;
        ensure_len("momentum trajectory", samples, self.p.len())?;
        ensure_len("input trajectory", kf, self.u.len())?;
        for (q, p) in self.q.iter().zip(&self.p) {
            ensure_len("configuration vector", n, q.len())?;
            ensure_len("momentum vector", n, p.len())?;
        }
        for u in &self.u {
            ensure_len("input vector", nu, u.len())?;
        }
        if !self.v.is_empty() {
            ensure_len("velocity trajectory", kf, self.v.len())?;
            for v in &self.v {
                ensure_len("velocity vector", n, v.len())?;
            }
        }
        if let Some(first) = self.lambda.first() {
            ensure_len("multiplier trajectory", kf, self.lambda.len())?;
            for lambda in &self.lambda {
                ensure_len("multiplier vector", first.len(), lambda.len())?;
            }
        }
        Ok(())
    }

    /// Stacked states `x_k = (q_k, p_k)`.
    pub fn states(&self) -> Result<Vec<DVector<f64>>> {
        self.validate()?;
        Ok(self
            .q
            .iter()
            .zip(&self.p)
            .map(|(q, p)| DVector::from_iterator(q.len() + p.len(), q.iter().chain(p).copied()))
            .collect())
    }

    pub fn inputs(&self) -> Result<Vec<DVector<f64>>> {
        self.validate()?;
        Ok(self.u.iter().map(|u| DVector::from_column_slice(u)).collect())
    }

    /// Time series of one configuration variable.
    pub fn config(&self, name: &str) -> Result<Vec<f64>> {
        self.validate()?;
        let index = position(&self.config_names, name, "configuration")?;
        Ok(self.q.iter().map(|q| q[index]).collect())
    }

    /// Time series of one input channel.
    pub fn input(&self, name: &str) -> Result<Vec<f64>> {
        self.validate()?;
        let index = position(&self.input_names, name, "input")?;
        Ok(self.u.iter().map(|u| u[index]).collect())
    }

    /// Re-expresses the trajectory in `target`'s variables, matching by name.
    ///
    /// Every configuration of `target` must exist here; `q`, `p` and `v` are copied
    /// exactly. Inputs missing here are zero and inputs `target` lacks are dropped.
    /// Multipliers are reset to zero for `target`'s constraints.
    pub fn import_into(&self, target: &System) -> Result<Trajectory> {
        self.validate()?;
        let config_map = target
            .config_names()
            .iter()
            .map(|name| position(&self.config_names, name, "configuration"))
            .collect::<Result<Vec<_>>>()?;
        let input_map: Vec<Option<usize>> = target
            .input_names()
            .iter()
            .map(|name| self.input_names.iter().position(|n| n == name))
            .collect();

        let pick =
            |values: &Vec<f64>| -> Vec<f64> { config_map.iter().map(|&i| values[i]).collect() };
        Ok(Trajectory {
            time: self.time.clone(),
            config_names: target.config_names(),
            input_names: target.input_names().to_vec(),
            q: self.q.iter().map(pick).collect(),
            p: self.p.iter().map(pick).collect(),
            v: self.v.iter().map(pick).collect(),
            u: self
                .u
                .iter()
                .map(|u| input_map.iter().map(|i| i.map_or(0.0, |i| u[i])).collect())
                .collect(),
            lambda: vec![vec![0.0; target.nc()]; self.kf()],
        })
    }
}

fn position(names: &[String], name: &str, kind: &'static str) -> Result<usize> {
    names
        .iter()
        .position(|n| n == name)
        .ok_or_else(|| MechanismError::unknown(kind, name))
}
