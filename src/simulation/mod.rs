//! # Simulated Engine
//!
//! A single-zone building model exposed through the engine interface, for
//! development and tests without a real co-simulation engine.
//!
//! ```rust
//! use fmi_env::config::EnvParameter;
//! use fmi_env::env::FmiEnv;
//! use fmi_env::simulation::SimulatedLoader;
//!
//! let config = EnvParameter::default()
//!     .with_fmu("simulated://office")
//!     .with_horizon(0.0, 6.0 * 3600.0, 3600.0)
//!     .with_actions(["heating_power_w"])
//!     .with_observations(["T_in", "T_out"])
//!     .resolve()
//!     .unwrap();
//!
//! let mut env = FmiEnv::new(config, SimulatedLoader::default()).unwrap();
//! let (state, _info) = env.reset().unwrap();
//! assert_eq!(state.len(), 2);
//! let outcome = env.step(&[2000.0]).unwrap();
//! assert!(!outcome.done);
//! ```

pub mod building;

pub use building::{BuildingConfig, SimulatedBuilding, SimulatedLoader};
