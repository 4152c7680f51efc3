//! Swing a pendulum on a cart through a desired arc.
//!
//! The problem is first solved with an auxiliary torque on the pendulum joint. That
//! torque is made progressively expensive until it is negligible, and the result seeds
//! the optimization of the real system, which only has the cart force.
//!
//! Run with `RUST_LOG=info cargo run --release --example cart_pendulum > trajectory.json`.

use std::f64::consts::PI;
use std::sync::Arc;

use anyhow::Result;
use nalgebra::{DMatrix, DVector};
use varimech_core::frame::{rz, tx, ty};
use varimech_core::terms::{ForceSpec, PotentialSpec};
use varimech_core::{
    DCost, DOptimizer, DSystem, DiscreteDynamics, MidpointVi, OptimizerSettings, System,
};

const MAX_STEPS: usize = 40;
const TOLERANCE: f64 = 1e-6;

fn main() -> Result<()> {
    init_tracing();

    let time: Vec<f64> = (0..1000).map(|k| k as f64 * 0.01).collect();
    let settings = OptimizerSettings {
        first_order_iterations: 4,
        ..Default::default()
    };

    let system_a = build_system(true)?;
    let mut dsys_a = DSystem::new(MidpointVi::new(Arc::clone(&system_a)), time.clone())?;
    let (x, u) = dsys_a.build_trajectory(None, None, None)?;
    let initial = dsys_a.simulate(&x[0], &u)?;

    let xd = desired_states(&dsys_a, &time)?;
    let cost = DCost::new(
        xd,
        vec![DVector::zeros(dsys_a.nu()); dsys_a.kf()],
        state_weight(&system_a, 0.01, 0.01, 100.0)?,
        input_weight(&system_a, 0.01, 0.01, Some(0.01))?,
    )?;
    let mut optimizer = DOptimizer::new(dsys_a, cost)?.with_settings(settings)?;

    let mut outcome = optimizer.optimize(&initial.states()?, &u, MAX_STEPS, TOLERANCE)?;
    for torque_weight in [100.0, 1e6] {
        optimizer.cost.r = input_weight(&system_a, 0.01, 0.01, Some(torque_weight))?;
        outcome = optimizer.optimize(&outcome.x, &outcome.u, MAX_STEPS, TOLERANCE)?;
    }

    let system_b = build_system(false)?;
    let mut dsys_b = DSystem::new(MidpointVi::new(Arc::clone(&system_b)), time.clone())?;
    let (x, u) = dsys_b.import_trajectory(&system_a, &outcome.x, &outcome.u)?;
    let seeded = dsys_b.simulate(&x[0], &u)?;

    let cost = DCost::new(
        desired_states(&dsys_b, &time)?,
        vec![DVector::zeros(dsys_b.nu()); dsys_b.kf()],
        state_weight(&system_b, 0.01, 0.01, 100.0)?,
        input_weight(&system_b, 0.01, 0.01, None)?,
    )?;
    let mut optimizer = DOptimizer::new(dsys_b, cost)?.with_settings(settings)?;
    let outcome = optimizer.optimize(&seeded.states()?, &u, MAX_STEPS, TOLERANCE)?;

    let trajectory = optimizer.dsys.split_trajectory(&outcome.x, &outcome.u)?;
    println!("{}", serde_json::to_string_pretty(&trajectory)?);
    Ok(())
}

fn init_tracing() {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("tracing subscriber already set");
    }
}

fn build_system(torque_input: bool) -> Result<Arc<System>> {
    let mut system = System::new(&[tx("x").named("Cart").mass(10.0).child(
        rz("theta").child(ty(-1.0).named("Pendulum").mass(1.0)),
    )])?;
    system
        .add_potential(&PotentialSpec::gravity(0.0, -9.8, 0.0))?
        .add_force(&ForceSpec::damping(0.01))?
        .add_force(&ForceSpec::joint_force("x", "x-force"))?;
    if torque_input {
        system.add_force(&ForceSpec::joint_force("theta", "theta-force"))?;
    }
    Ok(Arc::new(system))
}

/// Rest, a 130° raised-cosine swing of the pendulum between 3 s and 7 s, then rest.
fn desired_states(dsys: &DSystem, time: &[f64]) -> Result<Vec<DVector<f64>>> {
    let amplitude = 130.0 * PI / 180.0;
    let theta = dsys.system().config_index("theta")?;
    let q: Vec<DVector<f64>> = time
        .iter()
        .map(|&t| {
            let mut q = DVector::zeros(dsys.nq());
            if (3.0..=7.0).contains(&t) {
                q[theta] = (1.0 - (PI / 2.0 * (t - 3.0)).cos()) * amplitude / 2.0;
            }
            q
        })
        .collect();
    let (x, _) = dsys.build_trajectory(Some(q.as_slice()), None, None)?;
    Ok(x)
}

fn state_weight(system: &System, base: f64, x: f64, theta: f64) -> Result<DMatrix<f64>> {
    let mut weight = DVector::from_element(2 * system.nq(), base);
    weight[system.config_index("x")?] = x;
    weight[system.config_index("theta")?] = theta;
    Ok(DMatrix::from_diagonal(&weight))
}

fn input_weight(system: &System, base: f64, x: f64, theta: Option<f64>) -> Result<DMatrix<f64>> {
    let mut weight = DVector::from_element(system.nu(), base);
    weight[system.input_index("x-force")?] = x;
    if let Some(theta) = theta {
        weight[system.input_index("theta-force")?] = theta;
    }
    Ok(DMatrix::from_diagonal(&weight))
}
