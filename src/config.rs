//! # Configuration Resolver
//!
//! Layers user options over built-in defaults and validates the result.
//!
//! Options can come from three places, merged in this order:
//! 1. [`EnvParameter::default()`]
//! 2. a TOML file (`[env]` table, see [`AppConfig::load`])
//! 3. `FMI_ENV__`-prefixed environment variables
//!
//! Programmatic callers can also layer any serializable partial mapping with
//! [`EnvParameter::from_overrides`]. Resolution produces an [`EnvConfig`],
//! which carries the derived `fmu_observation_names`.

use chrono::{NaiveDate, NaiveDateTime};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use validator::Validate;

use crate::error::{EnvError, EnvResult};
use crate::pipeline::StageFactories;

/// Floating point precision of observation vectors
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Precision {
    #[default]
    Float32,
    Float64,
}

impl Precision {
    /// Round a value to this precision, keeping it as `f64`
    pub fn cast(self, value: f64) -> f64 {
        match self {
            Precision::Float32 => value as f32 as f64,
            Precision::Float64 => value,
        }
    }
}

/// FMU flavour requested from the loader
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FmuKind {
    /// Co-simulation
    #[default]
    Cs,
    /// Model exchange
    Me,
    Auto,
}

/// What to do when the engine reports a time different from the one requested
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DriftPolicy {
    /// Adopt the engine's clock silently
    Allow,
    /// Adopt the engine's clock and log a warning
    #[default]
    Warn,
    /// Keep the requested time as the environment clock
    Clamp,
}

/// Lower or upper bound of a space: one value for all names, or one per name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Bounds {
    Scalar(f64),
    PerName(Vec<f64>),
}

impl Bounds {
    /// Expand to one bound per name
    pub fn expand(&self, len: usize) -> Vec<f64> {
        match self {
            Bounds::Scalar(value) => vec![*value; len],
            Bounds::PerName(values) => values.clone(),
        }
    }

    fn check_len(&self, field: &str, names: &str, len: usize) -> EnvResult<()> {
        match self {
            Bounds::PerName(values) if values.len() != len => Err(EnvError::Configuration(format!(
                "{field} has {} entries but {names} has {len}",
                values.len()
            ))),
            _ => Ok(()),
        }
    }
}

/// Unresolved environment options
///
/// Every field has a default, so a partial mapping is enough to describe an
/// environment. Stage factories are not serializable and are attached with
/// [`EnvParameter::with_stages`].
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct EnvParameter {
    pub seed: Option<u64>,
    pub precision: Precision,

    pub action_names: Vec<String>,
    pub action_min: Bounds,
    pub action_max: Bounds,
    pub observation_names: Vec<String>,
    pub observation_min: Bounds,
    pub observation_max: Bounds,

    /// Engine reference; `None` runs without an engine
    pub fmu_path: Option<String>,
    pub fmu_kind: FmuKind,
    #[validate(range(max = 7))]
    pub fmu_loglevel: u8,
    #[validate(range(min = 0.0))]
    pub fmu_tolerance: f64,
    /// Seconds per control step
    pub fmu_step_size: f64,
    pub fmu_start_time: f64,
    pub fmu_final_time: f64,
    /// Time at which warm-up ends and actions start to count
    pub fmu_warmup_time: Option<f64>,
    pub fmu_episode_duration: Option<f64>,

    /// Static engine parameters applied on configure
    pub fmu_param: IndexMap<String, f64>,
    /// Externally supplied engine inputs applied on configure
    pub inputs: IndexMap<String, f64>,
    /// Engine variable name -> record column name
    pub inputs_map: IndexMap<String, String>,
    pub hidden_input_names: Vec<String>,
    pub hidden_observation_names: Vec<String>,
    pub reward_names: Vec<String>,
    /// Observations that do not come from the engine, with their current value
    pub external_observations: IndexMap<String, f64>,

    pub store_data: bool,
    pub store_all_data: bool,
    pub store_warmup: bool,
    pub ignore_reset: bool,
    pub init_fmu: bool,
    pub reset_on_init: bool,
    pub drift_policy: DriftPolicy,

    #[serde(skip)]
    pub stages: StageFactories,
}

impl Default for EnvParameter {
    fn default() -> Self {
        Self {
            seed: None,
            precision: Precision::Float32,
            action_names: Vec::new(),
            action_min: Bounds::Scalar(f64::NEG_INFINITY),
            action_max: Bounds::Scalar(f64::INFINITY),
            observation_names: Vec::new(),
            observation_min: Bounds::Scalar(f64::NEG_INFINITY),
            observation_max: Bounds::Scalar(f64::INFINITY),
            fmu_path: None,
            fmu_kind: FmuKind::Cs,
            fmu_loglevel: 4,
            fmu_tolerance: 1e-6,
            fmu_step_size: 60.0,
            fmu_start_time: 0.0,
            fmu_final_time: 24.0 * 60.0 * 60.0,
            fmu_warmup_time: None,
            fmu_episode_duration: None,
            fmu_param: IndexMap::new(),
            inputs: IndexMap::new(),
            inputs_map: IndexMap::new(),
            hidden_input_names: Vec::new(),
            hidden_observation_names: Vec::new(),
            reward_names: Vec::new(),
            external_observations: IndexMap::new(),
            store_data: true,
            store_all_data: false,
            store_warmup: false,
            ignore_reset: false,
            init_fmu: true,
            reset_on_init: false,
            drift_policy: DriftPolicy::Warn,
            stages: StageFactories::default(),
        }
    }
}

impl EnvParameter {
    /// Layer a partial option mapping over the defaults
    ///
    /// `overrides` may be any serializable value with a subset of the option
    /// keys, e.g. a `serde_json::json!` object.
    pub fn from_overrides<T: Serialize>(overrides: &T) -> EnvResult<Self> {
        let parameter = Figment::from(Serialized::defaults(EnvParameter::default()))
            .merge(Serialized::defaults(overrides))
            .extract()?;
        Ok(parameter)
    }

    /// Validate and derive the engine-sourced observation names
    pub fn resolve(self) -> EnvResult<EnvConfig> {
        EnvConfig::from_parameter(self)
    }

    /// Set the engine reference
    pub fn with_fmu(mut self, path: impl Into<String>) -> Self {
        self.fmu_path = Some(path.into());
        self
    }

    /// Set the simulated horizon and step size, in seconds
    pub fn with_horizon(mut self, start_time: f64, final_time: f64, step_size: f64) -> Self {
        self.fmu_start_time = start_time;
        self.fmu_final_time = final_time;
        self.fmu_step_size = step_size;
        self
    }

    /// Set the warm-up end time and whether warm-up rows are kept
    pub fn with_warmup(mut self, warmup_time: f64, store_warmup: bool) -> Self {
        self.fmu_warmup_time = Some(warmup_time);
        self.store_warmup = store_warmup;
        self
    }

    pub fn with_actions<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.action_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_observations<S: Into<String>>(
        mut self,
        names: impl IntoIterator<Item = S>,
    ) -> Self {
        self.observation_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_reward_names<S: Into<String>>(
        mut self,
        names: impl IntoIterator<Item = S>,
    ) -> Self {
        self.reward_names = names.into_iter().map(Into::into).collect();
        self
    }

    /// Register an observation that is supplied outside the engine
    pub fn with_external_observation(mut self, name: impl Into<String>, value: f64) -> Self {
        self.external_observations.insert(name.into(), value);
        self
    }

    pub fn with_stages(mut self, stages: StageFactories) -> Self {
        self.stages = stages;
        self
    }

    /// Keep the engine loaded across resets and only advance the episode window
    pub fn with_ignore_reset(mut self, ignore_reset: bool) -> Self {
        self.ignore_reset = ignore_reset;
        self
    }

    pub fn with_archive(mut self, store_all_data: bool) -> Self {
        self.store_all_data = store_all_data;
        self
    }
}

/// Resolved, validated environment configuration
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub parameter: EnvParameter,
    /// `observation_names` minus the externally supplied ones, in order
    pub fmu_observation_names: Vec<String>,
}

impl Deref for EnvConfig {
    type Target = EnvParameter;

    fn deref(&self) -> &Self::Target {
        &self.parameter
    }
}

impl EnvConfig {
    /// Validate a parameter set and derive the engine-sourced names
    pub fn from_parameter(parameter: EnvParameter) -> EnvResult<Self> {
        parameter.validate()?;

        if !(parameter.fmu_step_size.is_finite() && parameter.fmu_step_size > 0.0) {
            return Err(EnvError::Configuration(format!(
                "fmu_step_size must be positive, got {}",
                parameter.fmu_step_size
            )));
        }
        if parameter.fmu_final_time < parameter.fmu_start_time {
            return Err(EnvError::Configuration(format!(
                "fmu_final_time ({}) is before fmu_start_time ({})",
                parameter.fmu_final_time, parameter.fmu_start_time
            )));
        }
        if let Some(duration) = parameter.fmu_episode_duration {
            if duration <= 0.0 {
                return Err(EnvError::Configuration(format!(
                    "fmu_episode_duration must be positive, got {duration}"
                )));
            }
        }

        let n_actions = parameter.action_names.len();
        let n_observations = parameter.observation_names.len();
        parameter.action_min.check_len("action_min", "action_names", n_actions)?;
        parameter.action_max.check_len("action_max", "action_names", n_actions)?;
        parameter
            .observation_min
            .check_len("observation_min", "observation_names", n_observations)?;
        parameter
            .observation_max
            .check_len("observation_max", "observation_names", n_observations)?;

        let mut seen = HashSet::new();
        for name in &parameter.observation_names {
            if !seen.insert(name.as_str()) {
                return Err(EnvError::Configuration(format!(
                    "duplicate observation name: {name}"
                )));
            }
        }
        if let Some(name) = parameter
            .external_observations
            .keys()
            .find(|name| !seen.contains(name.as_str()))
        {
            return Err(EnvError::Configuration(format!(
                "external observation {name} is not listed in observation_names"
            )));
        }

        let fmu_observation_names = parameter
            .observation_names
            .iter()
            .filter(|name| !parameter.external_observations.contains_key(*name))
            .cloned()
            .collect();

        Ok(Self {
            parameter,
            fmu_observation_names,
        })
    }

    /// Whether an engine reference is configured
    pub fn use_fmu(&self) -> bool {
        self.parameter.fmu_path.is_some()
    }

    /// Warm-up end if set, start time otherwise
    pub fn action_start_time(&self) -> f64 {
        self.parameter
            .fmu_warmup_time
            .unwrap_or(self.parameter.fmu_start_time)
    }

    /// Explicit episode duration, or the span from action start to final time
    pub fn episode_duration(&self) -> f64 {
        self.parameter
            .fmu_episode_duration
            .unwrap_or(self.parameter.fmu_final_time - self.action_start_time())
    }
}

/// Options for the bundled episode runner binary
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Wall-clock date corresponding to simulation time zero
    pub start_date: NaiveDateTime,
    pub output: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            start_date: NaiveDate::from_ymd_opt(1994, 1, 1)
                .and_then(|date| date.and_hms_opt(0, 0, 0))
                .unwrap_or_default(),
            output: PathBuf::from("simulation_results.json"),
        }
    }
}

/// Top-level file configuration: `[env]` and `[runner]` tables
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub env: EnvParameter,
    pub runner: RunnerConfig,
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> EnvResult<Self> {
        let figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("FMI_ENV__").split("__"));
        Ok(figment.extract()?)
    }
}
