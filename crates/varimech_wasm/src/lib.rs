//! WASM bridge for the varimech core library: mechanism queries, simulation and a
//! stepped trajectory optimizer for browser front ends.

mod mechanism;
mod optimizer;

pub use mechanism::WasmMechanism;
pub use optimizer::WasmOptimizerRunner;
