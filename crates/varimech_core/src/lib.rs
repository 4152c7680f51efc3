//! Variational multibody dynamics with exact sensitivities and discrete trajectory
//! optimization.
//!
//! Key components:
//! - **Kinematic tree** (`frame`, `tree`): nested rigid transforms driven by configuration
//!   variables, differentiated to fourth order.
//! - **Terms** (`terms`): potentials, generalized forces and holonomic constraints.
//! - **System** (`system`): the assembled mechanism and its Lagrangian quantities.
//! - **Integrator** (`mvi`): midpoint variational integrator with first- and
//!   second-order step sensitivities.
//! - **Discrete layer** (`traits`, `discrete`, `trajectory`): the integrator as a map
//!   `x_{k+1} = f(x_k, u_k, k)` over a time grid.
//! - **Optimizer** (`cost`, `lqr`, `optimizer`): quadratic tracking cost, time-varying
//!   LQ solvers and projection-operator descent with Armijo line search.

pub mod cost;
pub mod discrete;
pub mod error;
pub mod frame;
mod lagrangian;
pub mod lqr;
pub mod mvi;
pub mod optimizer;
pub mod system;
pub mod terms;
pub mod traits;
pub mod trajectory;
pub mod tree;

pub use cost::DCost;
pub use discrete::DSystem;
pub use error::{MechanismError, Result};
pub use frame::FrameSpec;
pub use mvi::{MidpointSettings, MidpointVi};
pub use optimizer::{
    DOptimizer, DescentMethod, OptimizationOutcome, OptimizerMonitor, OptimizerSettings,
    SilentMonitor, TracingMonitor,
};
pub use system::{MechanismDescription, System};
pub use traits::DiscreteDynamics;
pub use trajectory::Trajectory;
