//! Stepped trajectory-optimization runner.

use std::sync::Arc;

use nalgebra::{DMatrix, DVector};
use serde::Serialize;
use serde_wasm_bindgen::to_value;
use varimech_core::optimizer::StepOutcome;
use varimech_core::{
    DCost, DOptimizer, DSystem, DiscreteDynamics, MidpointVi, System, Trajectory,
};
use wasm_bindgen::prelude::*;

use crate::mechanism::{build_mechanism, unflatten};

/// Progress payload for the stepped optimizer.
#[derive(Debug, Serialize)]
struct OptimizerProgress {
    done: bool,
    converged: bool,
    iterations: usize,
    max_steps: usize,
    cost: f64,
    dcost: Option<f64>,
}

struct OptimizerRunState {
    optimizer: DOptimizer,
    x: Vec<DVector<f64>>,
    u: Vec<DVector<f64>>,
    cost: f64,
    dcost: Option<f64>,
    iterations: usize,
    max_steps: usize,
    tolerance: f64,
    converged: bool,
    done: bool,
}

impl OptimizerRunState {
    fn progress(&self) -> OptimizerProgress {
        OptimizerProgress {
            done: self.done,
            converged: self.converged,
            iterations: self.iterations,
            max_steps: self.max_steps,
            cost: self.cost,
            dcost: self.dcost,
        }
    }
}

#[wasm_bindgen]
pub struct WasmOptimizerRunner {
    state: Option<OptimizerRunState>,
}

#[allow(clippy::too_many_arguments)]
fn start_optimizer_run(
    system: Arc<System>,
    time: Vec<f64>,
    desired_q: &[f64],
    state_weights: &[f64],
    input_weights: &[f64],
    max_steps: usize,
    tolerance: f64,
) -> anyhow::Result<OptimizerRunState> {
    if max_steps == 0 {
        anyhow::bail!("max_steps must be greater than zero");
    }
    if !(tolerance > 0.0) {
        anyhow::bail!("tolerance must be positive");
    }
    let nq = system.nq();
    let nu = system.nu();
    let samples = time.len();
    let dsys = DSystem::new(MidpointVi::new(system), time)?;
    let kf = dsys.kf();

    let qd = unflatten(desired_q, samples, nq)?;
    let (xd, ud) = dsys.build_trajectory(Some(qd.as_slice()), None, None)?;
    let q = diagonal(state_weights, 2 * nq, "state")?;
    let r = diagonal(input_weights, nu, "input")?;
    let cost = DCost::new(xd.clone(), ud, q, r)?;

    let mut optimizer = DOptimizer::new(dsys, cost)?;
    let (x, u, cost) = optimizer.start(&xd, &vec![DVector::zeros(nu); kf])?;
    Ok(OptimizerRunState {
        optimizer,
        x,
        u,
        cost,
        dcost: None,
        iterations: 0,
        max_steps,
        tolerance,
        converged: false,
        done: false,
    })
}

fn diagonal(weights: &[f64], dim: usize, what: &str) -> anyhow::Result<DMatrix<f64>> {
    if weights.len() != dim {
        anyhow::bail!("expected {} {} weights, got {}", dim, what, weights.len());
    }
    Ok(DMatrix::from_diagonal(&DVector::from_column_slice(weights)))
}

fn advance_optimizer_run(
    state: &mut OptimizerRunState,
    batch_size: usize,
) -> anyhow::Result<OptimizerProgress> {
    for _ in 0..batch_size {
        if state.done {
            break;
        }
        let outcome = state.optimizer.step(
            state.iterations,
            &state.x,
            &state.u,
            state.cost,
            state.tolerance,
        )?;
        state.iterations += 1;
        match outcome {
            StepOutcome::Converged { dcost } => {
                state.dcost = Some(dcost);
                state.converged = true;
                state.done = true;
            }
            StepOutcome::Accepted { x, u, cost, dcost, .. } => {
                state.x = x;
                state.u = u;
                state.cost = cost;
                state.dcost = Some(dcost);
            }
            StepOutcome::LineSearchFailed { dcost } => {
                state.dcost = Some(dcost);
                state.done = true;
            }
        }
        if state.iterations >= state.max_steps {
            state.done = true;
        }
    }
    Ok(state.progress())
}

fn current_trajectory(state: &OptimizerRunState) -> anyhow::Result<Trajectory> {
    Ok(state.optimizer.dsys.split_trajectory(&state.x, &state.u)?)
}

#[wasm_bindgen]
impl WasmOptimizerRunner {
    /// `desired_q` is row-major with one row of configurations per time sample;
    /// `state_weights` and `input_weights` are the diagonals of `Q` and `R`.
    #[wasm_bindgen(constructor)]
    pub fn new(
        description: JsValue,
        time: Vec<f64>,
        desired_q: Vec<f64>,
        state_weights: Vec<f64>,
        input_weights: Vec<f64>,
        max_steps: u32,
        tolerance: f64,
    ) -> Result<WasmOptimizerRunner, JsValue> {
        console_error_panic_hook::set_once();

        let system = build_mechanism(description)?;
        let state = start_optimizer_run(
            system,
            time,
            &desired_q,
            &state_weights,
            &input_weights,
            max_steps as usize,
            tolerance,
        )
        .map_err(|e| JsValue::from_str(&format!("Optimizer setup failed: {}", e)))?;
        Ok(WasmOptimizerRunner { state: Some(state) })
    }

    pub fn is_done(&self) -> bool {
        self.state.as_ref().map_or(true, |state| state.done)
    }

    pub fn run_steps(&mut self, batch_size: u32) -> Result<JsValue, JsValue> {
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| JsValue::from_str("Runner not initialized"))?;
        let progress = advance_optimizer_run(state, batch_size as usize)
            .map_err(|e| JsValue::from_str(&format!("Optimizer step failed: {}", e)))?;
        to_value(&progress).map_err(|e| JsValue::from_str(&format!("Serialization error: {}", e)))
    }

    pub fn get_progress(&self) -> Result<JsValue, JsValue> {
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| JsValue::from_str("Runner not initialized"))?;
        to_value(&state.progress())
            .map_err(|e| JsValue::from_str(&format!("Serialization error: {}", e)))
    }

    /// Current best trajectory; available at any point of the run.
    pub fn result(&self) -> Result<JsValue, JsValue> {
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| JsValue::from_str("Runner not initialized"))?;
        let trajectory = current_trajectory(state)
            .map_err(|e| JsValue::from_str(&format!("Trajectory export failed: {}", e)))?;
        to_value(&trajectory).map_err(|e| JsValue::from_str(&format!("Serialization error: {}", e)))
    }
}
