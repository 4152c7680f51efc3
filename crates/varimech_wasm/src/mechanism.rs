//! Mechanism wrapper: names, frame positions and open-loop simulation.

use std::sync::Arc;

use js_sys::Float64Array;
use nalgebra::DVector;
use serde_wasm_bindgen::{from_value, to_value};
use varimech_core::{
    DSystem, DiscreteDynamics, MechanismDescription, MidpointVi, System, Trajectory,
};
use wasm_bindgen::prelude::*;

#[wasm_bindgen]
pub struct WasmMechanism {
    pub(crate) system: Arc<System>,
}

pub(crate) fn build_mechanism(description: JsValue) -> Result<Arc<System>, JsValue> {
    let description: MechanismDescription = from_value(description)
        .map_err(|e| JsValue::from_str(&format!("Invalid mechanism description: {}", e)))?;
    System::from_description(&description)
        .map(Arc::new)
        .map_err(|e| JsValue::from_str(&format!("Mechanism construction failed: {}", e)))
}

#[wasm_bindgen]
impl WasmMechanism {
    #[wasm_bindgen(constructor)]
    pub fn new(description: JsValue) -> Result<WasmMechanism, JsValue> {
        console_error_panic_hook::set_once();
        Ok(WasmMechanism {
            system: build_mechanism(description)?,
        })
    }

    pub fn config_names(&self) -> Vec<String> {
        self.system.config_names()
    }

    pub fn input_names(&self) -> Vec<String> {
        self.system.input_names().to_vec()
    }

    pub fn frame_names(&self) -> Vec<String> {
        self.system.frame_names()
    }

    /// World positions of every frame as `[x0, y0, z0, x1, ...]`, in `frame_names` order.
    pub fn frame_positions(&self, q: Vec<f64>) -> Result<Float64Array, JsValue> {
        let positions = flatten_frame_positions(&self.system, &q)
            .map_err(|e| JsValue::from_str(&format!("Frame evaluation failed: {}", e)))?;
        Ok(Float64Array::from(positions.as_slice()))
    }

    /// Simulates from `(q0, p0)` with row-major inputs (`time.len() - 1` rows of `nu`
    /// values).
    pub fn simulate(
        &self,
        time: Vec<f64>,
        q0: Vec<f64>,
        p0: Vec<f64>,
        inputs: Vec<f64>,
    ) -> Result<JsValue, JsValue> {
        let trajectory = simulate_trajectory(&self.system, time, &q0, &p0, &inputs)
            .map_err(|e| JsValue::from_str(&format!("Simulation failed: {}", e)))?;
        to_value(&trajectory).map_err(|e| JsValue::from_str(&format!("Serialization error: {}", e)))
    }
}

pub(crate) fn flatten_frame_positions(system: &System, q: &[f64]) -> anyhow::Result<Vec<f64>> {
    let q = DVector::from_column_slice(q);
    Ok(system
        .frame_positions(&q)?
        .into_iter()
        .flat_map(|(_, p)| [p.x, p.y, p.z])
        .collect())
}

/// Splits a row-major buffer into `rows` vectors of length `width`.
pub(crate) fn unflatten(values: &[f64], rows: usize, width: usize) -> anyhow::Result<Vec<DVector<f64>>> {
    if values.len() != rows * width {
        anyhow::bail!(
            "expected {} values ({} rows of {}), got {}",
            rows * width,
            rows,
            width,
            values.len()
        );
    }
    if width == 0 {
        return Ok(vec![DVector::zeros(0); rows]);
    }
    Ok(values
        .chunks(width)
        .map(DVector::from_column_slice)
        .collect())
}

pub(crate) fn simulate_trajectory(
    system: &Arc<System>,
    time: Vec<f64>,
    q0: &[f64],
    p0: &[f64],
    inputs: &[f64],
) -> anyhow::Result<Trajectory> {
    let mut dsys = DSystem::new(MidpointVi::new(Arc::clone(system)), time)?;
    let u = unflatten(inputs, dsys.kf(), system.nu())?;
    let x0 = dsys.build_state(
        Some(&DVector::from_column_slice(q0)),
        Some(&DVector::from_column_slice(p0)),
    )?;
    Ok(dsys.simulate(&x0, &u)?)
}
