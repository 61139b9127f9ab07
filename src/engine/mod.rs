//! # Engine Adapter
//!
//! Single point of contact with the opaque co-simulation engine.
//!
//! The engine is reached through two traits: an [`FmuLoader`] that turns an
//! engine reference into a live [`FmuModel`] handle, and the handle itself.
//! All engine calls are synchronous and fallible. The [`EngineAdapter`] owns
//! at most one handle and keeps the engine clock.

use anyhow::Result;
use indexmap::IndexMap;
use itertools::Itertools;
use tracing::{debug, info, warn};

use crate::config::{DriftPolicy, EnvConfig, FmuKind};
use crate::error::{EnvError, EnvResult};
use crate::recorder::{records_to_json, Record};

/// Relative tolerance when comparing the engine clock to the requested time
const DRIFT_EPSILON: f64 = 1e-9;

/// Live engine instance
#[cfg_attr(test, mockall::automock)]
pub trait FmuModel: Send {
    fn set(&mut self, names: &[String], values: &[f64]) -> Result<()>;
    fn get(&mut self, names: &[String]) -> Result<Vec<f64>>;
    fn setup_experiment(
        &mut self,
        start_time: f64,
        stop_time: f64,
        stop_time_defined: bool,
        tolerance: f64,
    ) -> Result<()>;
    fn initialize(&mut self) -> Result<()>;
    fn do_step(&mut self, current_time: f64, step_size: f64) -> Result<()>;
    /// The engine's own clock
    fn time(&self) -> f64;
    fn terminate(&mut self) -> Result<()>;
}

/// Creates engine instances from a reference (usually a file path)
pub trait FmuLoader: Send {
    fn load(&self, reference: &str, log_level: u8, kind: FmuKind) -> Result<Box<dyn FmuModel>>;
}

/// Loader for environments that never touch an engine
#[derive(Debug, Clone, Copy, Default)]
pub struct NullLoader;

impl FmuLoader for NullLoader {
    fn load(&self, reference: &str, _log_level: u8, _kind: FmuKind) -> Result<Box<dyn FmuModel>> {
        anyhow::bail!("no engine loader available for {reference}")
    }
}

/// Engine lifecycle as seen by the episode controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum EngineLifecycle {
    Unloaded,
    Loaded,
}

pub struct EngineAdapter {
    loader: Box<dyn FmuLoader>,
    model: Option<Box<dyn FmuModel>>,
    engine_time: f64,
}

impl EngineAdapter {
    pub fn new(loader: Box<dyn FmuLoader>) -> Self {
        Self {
            loader,
            model: None,
            engine_time: 0.0,
        }
    }

    pub fn lifecycle(&self) -> EngineLifecycle {
        if self.model.is_some() {
            EngineLifecycle::Loaded
        } else {
            EngineLifecycle::Unloaded
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    pub fn engine_time(&self) -> f64 {
        self.engine_time
    }

    /// Reposition the clock, e.g. to the start of a new episode window
    pub fn set_engine_time(&mut self, time: f64) {
        self.engine_time = time;
    }

    /// Advance the clock without an engine
    pub fn advance_clock(&mut self, step_size: f64) {
        self.engine_time += step_size;
    }

    /// Load, parameterize and initialize the engine
    pub fn configure(&mut self, config: &EnvConfig) -> EnvResult<()> {
        if self.model.is_some() {
            return Err(EnvError::EngineLoad("engine is already loaded".to_string()));
        }
        let reference = config
            .fmu_path
            .as_deref()
            .ok_or_else(|| EnvError::EngineLoad("no engine reference configured".to_string()))?;

        let load_error = |stage: &str, error: anyhow::Error| {
            EnvError::EngineLoad(format!("{stage} failed for {reference}: {error:#}"))
        };

        let mut model = self
            .loader
            .load(reference, config.fmu_loglevel, config.fmu_kind)
            .map_err(|e| load_error("load", e))?;

        let mut parameters = config.fmu_param.clone();
        parameters.extend(config.inputs.iter().map(|(name, value)| (name.clone(), *value)));
        if !parameters.is_empty() {
            let (names, values): (Vec<String>, Vec<f64>) = parameters.into_iter().unzip();
            model
                .set(&names, &values)
                .map_err(|e| load_error("parameterization", e))?;
        }

        model
            .setup_experiment(
                config.fmu_start_time,
                config.fmu_final_time,
                false,
                config.fmu_tolerance,
            )
            .map_err(|e| load_error("experiment setup", e))?;
        model.initialize().map_err(|e| load_error("initialization", e))?;

        info!(
            reference,
            kind = %config.fmu_kind,
            start_time = config.fmu_start_time,
            final_time = config.fmu_final_time,
            "engine configured"
        );
        self.model = Some(model);
        Ok(())
    }

    /// Push inputs, optionally advance the engine, and read its outputs
    ///
    /// Returns the engine-sourced observations, hidden observations and
    /// reward sources, in that order. `last_state` is attached to the error
    /// if the step fails.
    pub fn evaluate(
        &mut self,
        record: &Record,
        advance: bool,
        config: &EnvConfig,
        last_state: &[f64],
    ) -> EnvResult<IndexMap<String, f64>> {
        let model = self.model.as_mut().ok_or(EnvError::EngineNotLoaded)?;

        if advance {
            let failure = |source| evaluation_error(record.time, record, last_state, source);

            let (names, values): (Vec<String>, Vec<f64>) =
                engine_inputs(record, config).into_iter().unzip();
            if !names.is_empty() {
                model.set(&names, &values).map_err(failure)?;
            }

            let step_size = record.time - self.engine_time;
            if let Err(error) = model.do_step(self.engine_time, step_size) {
                warn!(
                    time = self.engine_time,
                    step_size,
                    error = %error,
                    "engine step failed; raise fmu_loglevel for engine diagnostics"
                );
                return Err(failure(error));
            }

            let reported = model.time();
            self.engine_time = resync_clock(record.time, reported, config.drift_policy);
        }

        let names: Vec<String> = config
            .fmu_observation_names
            .iter()
            .chain(&config.hidden_observation_names)
            .chain(&config.reward_names)
            .cloned()
            .collect();
        if names.is_empty() {
            return Ok(IndexMap::new());
        }

        let time = self.engine_time;
        let values = model
            .get(&names)
            .map_err(|source| evaluation_error(time, record, last_state, source))?;
        if values.len() != names.len() {
            let source = anyhow::anyhow!(
                "engine returned {} values for {} requested names",
                values.len(),
                names.len()
            );
            return Err(evaluation_error(time, record, last_state, source));
        }

        Ok(names.into_iter().zip_eq(values).collect())
    }

    /// Release the engine; teardown errors are logged, never returned
    pub fn terminate(&mut self) {
        if let Some(mut model) = self.model.take() {
            match model.terminate() {
                Ok(()) => debug!(time = self.engine_time, "engine terminated"),
                Err(error) => warn!(error = %error, "engine teardown failed"),
            }
        }
    }
}

impl Drop for EngineAdapter {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn evaluation_error(
    time: f64,
    record: &Record,
    last_state: &[f64],
    source: anyhow::Error,
) -> EnvError {
    EnvError::EngineEvaluation {
        time,
        inputs: records_to_json(std::slice::from_ref(record)).to_string(),
        state: last_state.to_vec(),
        source,
    }
}

/// Columns pushed into the engine: renamed via `inputs_map`, without the
/// time column and hidden inputs
fn engine_inputs(record: &Record, config: &EnvConfig) -> Vec<(String, f64)> {
    record
        .columns
        .iter()
        .map(|(column, value)| {
            let name = config
                .inputs_map
                .iter()
                .find(|(_, mapped)| mapped.as_str() == column.as_str())
                .map(|(engine_name, _)| engine_name.clone())
                .unwrap_or_else(|| column.clone());
            (name, *value)
        })
        .filter(|(name, _)| !config.hidden_input_names.contains(name))
        .collect()
}

fn resync_clock(requested: f64, reported: f64, policy: DriftPolicy) -> f64 {
    let drifted = (reported - requested).abs() > DRIFT_EPSILON * requested.abs().max(1.0);
    match policy {
        DriftPolicy::Allow => reported,
        DriftPolicy::Warn => {
            if drifted {
                warn!(requested, reported, "engine clock differs from requested time");
            }
            reported
        }
        DriftPolicy::Clamp => {
            if drifted {
                debug!(requested, reported, "clamping engine clock to requested time");
            }
            requested
        }
    }
}
