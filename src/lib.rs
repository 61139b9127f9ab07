//! Step/reset control-loop environment around FMU-style building energy
//! simulations.
//!
//! - [`config`]: option resolution and validation
//! - [`engine`]: the engine adapter and the engine boundary traits
//! - [`pipeline`]: optional transformation stages around each step
//! - [`env`]: the episode controller ([`FmiEnv`])
//! - [`recorder`]: per-step records and the episode archive

pub mod config;
pub mod engine;
pub mod env;
pub mod error;
pub mod pipeline;
pub mod recorder;
#[cfg(feature = "sim")]
pub mod simulation;
pub mod spaces;
pub mod telemetry;

pub use config::{EnvConfig, EnvParameter};
pub use engine::{FmuLoader, FmuModel};
pub use env::{FmiEnv, Info, StepOutcome};
pub use error::{EnvError, EnvResult};
