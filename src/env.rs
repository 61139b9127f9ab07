//! # Episode Controller
//!
//! The step/reset state machine around an engine adapter, a stage pipeline
//! and a data recorder.
//!
//! Two lifecycles are composed here:
//! - the engine lifecycle ([`EngineLifecycle`]): unloaded or loaded, owned by
//!   the [`EngineAdapter`];
//! - the episode lifecycle ([`EpisodePhase`]): what the controller is doing
//!   with the current episode window.
//!
//! A reset either reinitializes the engine ([`ResetMode::Physical`]) or keeps
//! it and slides the episode window forward by one episode duration
//! ([`ResetMode::Continue`], selected by `ignore_reset` once an engine is
//! loaded). Both paths then seed the episode in the same way.

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use crate::config::EnvConfig;
use crate::engine::{EngineAdapter, EngineLifecycle, FmuLoader, NullLoader};
use crate::error::{EnvError, EnvResult};
use crate::pipeline::Pipeline;
use crate::recorder::{records_to_json, Dataset, Record, REWARD_COLUMN};
use crate::spaces::BoxSpace;

/// Reward used when neither reward sources nor a `reward` column exist
pub const DEFAULT_REWARD: f64 = -1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum EpisodePhase {
    /// Constructed or closed, no episode started
    Uninitialized,
    /// Episode window set up, initial observation pending
    Loaded,
    WarmingUp,
    Running,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ResetMode {
    /// Terminate the engine and start from scratch
    Physical,
    /// Keep the loaded engine and advance the episode window
    Continue,
}

/// Metadata returned with every reset and step
#[derive(Debug, Clone, Serialize)]
pub struct Info {
    pub episode_id: Uuid,
    /// Split-table JSON: the whole dataset on reset, the new row on step
    pub data: Value,
}

#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub observation: Vec<f64>,
    pub reward: f64,
    pub done: bool,
    pub info: Info,
}

#[derive(Debug, Clone, Copy)]
struct EpisodeClock {
    action_start_time: f64,
    episode_duration: f64,
}

impl EpisodeClock {
    fn end_time(&self) -> f64 {
        self.action_start_time + self.episode_duration
    }

    fn is_done(&self, engine_time: f64) -> bool {
        engine_time >= self.end_time()
    }
}

/// Control-loop environment around one simulation engine
pub struct FmiEnv {
    config: EnvConfig,
    engine: EngineAdapter,
    pipeline: Pipeline,
    dataset: Dataset,
    clock: EpisodeClock,
    phase: EpisodePhase,
    action_space: BoxSpace,
    observation_space: BoxSpace,
    state: Vec<f64>,
    init: bool,
    episode_id: Uuid,
}

impl FmiEnv {
    /// Build the environment; resets immediately when `reset_on_init` is set
    pub fn new(config: EnvConfig, loader: impl FmuLoader + 'static) -> EnvResult<Self> {
        let pipeline = Pipeline::build(&config)?;

        let n_actions = config.action_names.len();
        let n_observations = config.observation_names.len();
        let (action_space, observation_space) = spaces(&config);
        let clock = EpisodeClock {
            action_start_time: config.action_start_time(),
            episode_duration: config.episode_duration(),
        };

        let mut engine = EngineAdapter::new(Box::new(loader));
        engine.set_engine_time(config.fmu_start_time);

        info!(
            engine = config.fmu_path.as_deref().unwrap_or("none"),
            actions = n_actions,
            observations = n_observations,
            step_size = config.fmu_step_size,
            episode_duration = clock.episode_duration,
            "environment created"
        );

        let mut env = Self {
            config,
            engine,
            pipeline,
            dataset: Dataset::new(),
            clock,
            phase: EpisodePhase::Uninitialized,
            action_space,
            observation_space,
            state: vec![f64::NAN; n_observations],
            init: true,
            episode_id: Uuid::nil(),
        };

        if env.config.reset_on_init {
            env.reset()?;
        }
        Ok(env)
    }

    /// Environment whose observations come only from stages and external signals
    pub fn without_engine(config: EnvConfig) -> EnvResult<Self> {
        Self::new(config, NullLoader)
    }

    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    pub fn phase(&self) -> EpisodePhase {
        self.phase
    }

    pub fn engine_lifecycle(&self) -> EngineLifecycle {
        self.engine.lifecycle()
    }

    pub fn engine_time(&self) -> f64 {
        self.engine.engine_time()
    }

    pub fn action_start_time(&self) -> f64 {
        self.clock.action_start_time
    }

    pub fn episode_duration(&self) -> f64 {
        self.clock.episode_duration
    }

    /// Current `(fmu_start_time, fmu_final_time)`
    pub fn episode_window(&self) -> (f64, f64) {
        (self.config.fmu_start_time, self.config.fmu_final_time)
    }

    pub fn episode_id(&self) -> Uuid {
        self.episode_id
    }

    pub fn state(&self) -> &[f64] {
        &self.state
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn action_space(&self) -> &BoxSpace {
        &self.action_space
    }

    pub fn observation_space(&self) -> &BoxSpace {
        &self.observation_space
    }

    /// Update an externally supplied observation
    pub fn set_external_observation(&mut self, name: &str, value: f64) -> EnvResult<()> {
        match self.config.parameter.external_observations.get_mut(name) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(EnvError::Configuration(format!(
                "{name} is not an external observation"
            ))),
        }
    }

    /// Start a new episode and return its initial observation
    pub fn reset(&mut self) -> EnvResult<(Vec<f64>, Info)> {
        let mode = if self.config.ignore_reset && self.engine.is_loaded() {
            ResetMode::Continue
        } else {
            ResetMode::Physical
        };
        self.episode_id = Uuid::new_v4();

        let span = info_span!("reset", episode_id = %self.episode_id, mode = %mode);
        let _guard = span.enter();

        match mode {
            ResetMode::Continue => self.advance_episode_window(),
            ResetMode::Physical => self.engine.terminate(),
        }
        self.begin_episode()
    }

    /// Advance one control step with `action`, ordered as `action_names`
    pub fn step(&mut self, action: &[f64]) -> EnvResult<StepOutcome> {
        if action.len() != self.action_space.dim() {
            return Err(EnvError::InvalidAction {
                expected: self.action_space.dim(),
                actual: action.len(),
            });
        }

        let outcome = self.evaluate_step(action, true)?;
        if outcome.done {
            self.phase = EpisodePhase::Terminated;
            info!(
                episode_id = %self.episode_id,
                time = self.engine.engine_time(),
                rows = self.dataset.len(),
                "episode complete"
            );
        } else {
            self.phase = EpisodePhase::Running;
        }
        Ok(outcome)
    }

    /// Rendering is not supported
    pub fn render(&self) -> bool {
        false
    }

    /// Release the engine; the environment can be reset again afterwards
    pub fn close(&mut self) {
        self.engine.terminate();
        self.phase = EpisodePhase::Uninitialized;
    }

    fn advance_episode_window(&mut self) {
        let duration = self.clock.episode_duration;
        let parameter = &mut self.config.parameter;
        parameter.fmu_start_time += duration;
        parameter.fmu_final_time += duration;
        if parameter.fmu_warmup_time.take().is_some() {
            warn!("disabling fmu_warmup_time while ignore_reset keeps the engine loaded");
        }
        info!(
            start_time = parameter.fmu_start_time,
            final_time = parameter.fmu_final_time,
            "continuing loaded engine into next episode window"
        );
    }

    fn begin_episode(&mut self) -> EnvResult<(Vec<f64>, Info)> {
        self.init = true;
        let (record, config) = self
            .pipeline
            .reset(Record::new(0.0), self.config.clone(), self.init)?;
        self.config = EnvConfig::from_parameter(config.parameter)?;
        (self.action_space, self.observation_space) = spaces(&self.config);
        self.dataset.restart(record);

        let start_time = self.config.fmu_start_time;
        self.engine.set_engine_time(start_time);
        self.clock.action_start_time = self.config.action_start_time();

        if !self.engine.is_loaded() && self.config.init_fmu && self.config.use_fmu() {
            self.engine.configure(&self.config)?;
        }
        if let Some(record) = self.dataset.last_mut() {
            record.time = start_time;
        }
        self.phase = EpisodePhase::Loaded;

        let neutral = vec![0.0; self.action_space.dim()];
        self.evaluate_step(&neutral, false)?;

        if self.config.fmu_warmup_time.is_some() {
            self.phase = EpisodePhase::WarmingUp;
            while self.engine.engine_time() < self.clock.action_start_time {
                let before = self.engine.engine_time();
                self.evaluate_step(&neutral, true)?;
                if self.engine.engine_time() <= before {
                    return Err(EnvError::EngineEvaluation {
                        time: before,
                        inputs: self
                            .dataset
                            .last()
                            .map(|record| records_to_json(std::slice::from_ref(record)).to_string())
                            .unwrap_or_default(),
                        state: self.state.clone(),
                        source: anyhow::anyhow!("engine clock did not advance during warm-up"),
                    });
                }
            }
            if !self.config.store_warmup {
                self.dataset.truncate_to_last();
            }
            debug!(
                action_start_time = self.clock.action_start_time,
                rows = self.dataset.len(),
                "warm-up complete"
            );
        }

        self.phase = EpisodePhase::Running;
        debug!(
            start_time,
            action_start_time = self.clock.action_start_time,
            end_time = self.clock.end_time(),
            "episode started"
        );
        Ok((self.state.clone(), self.info(self.dataset.to_json())))
    }

    /// One pass through the pipeline. With `advance == false` the engine is
    /// only queried and the last recorded row is rewritten in place.
    fn evaluate_step(&mut self, action: &[f64], advance: bool) -> EnvResult<StepOutcome> {
        let mut record = if advance {
            Record::new(self.engine.engine_time() + self.config.fmu_step_size)
        } else {
            self.dataset
                .last()
                .cloned()
                .unwrap_or_else(|| Record::new(self.engine.engine_time()))
        };
        for (name, value) in self.config.action_names.iter().zip(action) {
            record.set(name.clone(), *value);
        }

        let mut record = self.pipeline.pre_step(record, self.init)?;

        if self.config.use_fmu() {
            let outputs = self
                .engine
                .evaluate(&record, advance, &self.config, &self.state)?;
            record.extend(outputs);
        } else if advance {
            self.engine.advance_clock(self.config.fmu_step_size);
        }

        let mut record = self.pipeline.post_step(record, self.init)?;
        let reward = self.assign_reward(&mut record)?;
        let observation = self.observe(&record)?;
        self.state = self.pipeline.state(observation, self.init)?;

        let done = self.clock.is_done(self.engine.engine_time());
        self.init = false;

        let info = self.info(records_to_json(std::slice::from_ref(&record)));
        if self.config.store_data {
            if self.dataset.is_empty() || !advance {
                self.dataset.restart(record);
            } else {
                self.dataset.push(record);
            }
            if self.config.store_all_data && done {
                self.dataset.archive_current();
                debug!(
                    episodes = self.dataset.archived_episodes(),
                    "archived completed episode"
                );
            }
        }

        Ok(StepOutcome {
            observation: self.state.clone(),
            reward,
            done,
            info,
        })
    }

    fn assign_reward(&self, record: &mut Record) -> EnvResult<f64> {
        let reward = if !self.config.reward_names.is_empty() {
            self.config
                .reward_names
                .iter()
                .map(|name| {
                    record
                        .get(name)
                        .ok_or_else(|| EnvError::MissingColumn(name.clone()))
                })
                .sum::<EnvResult<f64>>()?
        } else if let Some(reward) = record.get(REWARD_COLUMN) {
            reward
        } else {
            DEFAULT_REWARD
        };
        record.set(REWARD_COLUMN, reward);
        Ok(reward)
    }

    fn observe(&self, record: &Record) -> EnvResult<Vec<f64>> {
        let precision = self.config.precision;
        self.config
            .observation_names
            .iter()
            .map(|name| {
                record
                    .get(name)
                    .or_else(|| self.config.external_observations.get(name).copied())
                    .map(|value| precision.cast(value))
                    .ok_or_else(|| EnvError::MissingColumn(name.clone()))
            })
            .collect()
    }

    fn info(&self, data: Value) -> Info {
        Info {
            episode_id: self.episode_id,
            data,
        }
    }
}

/// Action and observation spaces described by `config`
fn spaces(config: &EnvConfig) -> (BoxSpace, BoxSpace) {
    let n_actions = config.action_names.len();
    let n_observations = config.observation_names.len();
    let action_space = BoxSpace::new(
        config.action_names.clone(),
        config.action_min.expand(n_actions),
        config.action_max.expand(n_actions),
    );
    let observation_space = BoxSpace::new(
        config.observation_names.clone(),
        config.observation_min.expand(n_observations),
        config.observation_max.expand(n_observations),
    );
    (action_space, observation_space)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvParameter;
    use crate::pipeline::{Postprocessor, StageFactories, StateProcessor};
    use rstest::rstest;

    fn no_engine(parameter: EnvParameter) -> FmiEnv {
        FmiEnv::without_engine(parameter.resolve().unwrap()).unwrap()
    }

    struct Thermostat;

    impl Postprocessor for Thermostat {
        fn do_calc(&mut self, mut record: Record, _init: bool) -> anyhow::Result<Record> {
            let heating = record.get("heating").unwrap_or(0.0);
            record.set("T_in", 18.0 + heating / 1000.0);
            Ok(record)
        }
    }

    fn thermostat_parameter() -> EnvParameter {
        EnvParameter::default()
            .with_horizon(0.0, 3600.0, 900.0)
            .with_actions(["heating"])
            .with_observations(["T_in"])
            .with_stages(
                StageFactories::default()
                    .with_postprocessor(|_| Ok(Box::new(Thermostat) as Box<dyn Postprocessor>)),
            )
    }

    #[test]
    fn test_phase_transitions() {
        let mut env = no_engine(thermostat_parameter());
        assert_eq!(env.phase(), EpisodePhase::Uninitialized);
        assert!(env.state()[0].is_nan());

        let (state, _) = env.reset().unwrap();
        assert_eq!(state, vec![18.0]);
        assert_eq!(env.phase(), EpisodePhase::Running);

        for _ in 0..3 {
            assert!(!env.step(&[1000.0]).unwrap().done);
            assert_eq!(env.phase(), EpisodePhase::Running);
        }
        let outcome = env.step(&[2000.0]).unwrap();
        assert!(outcome.done);
        assert_eq!(outcome.observation, vec![20.0]);
        assert_eq!(env.phase(), EpisodePhase::Terminated);

        env.close();
        assert_eq!(env.phase(), EpisodePhase::Uninitialized);
    }

    #[test]
    fn test_reset_on_init() {
        let mut parameter = thermostat_parameter();
        parameter.reset_on_init = true;
        let env = no_engine(parameter);

        assert_eq!(env.phase(), EpisodePhase::Running);
        assert_eq!(env.state(), &[18.0]);
        assert_eq!(env.dataset().len(), 1);
    }

    #[test]
    fn test_wrong_action_length() {
        let mut env = no_engine(thermostat_parameter());
        env.reset().unwrap();

        let error = env.step(&[1.0, 2.0]).unwrap_err();
        assert!(matches!(
            error,
            EnvError::InvalidAction {
                expected: 1,
                actual: 2
            }
        ));
    }

    #[test]
    fn test_missing_observation_column() {
        let mut env = no_engine(EnvParameter::default().with_observations(["T_in"]));
        let error = env.reset().unwrap_err();
        assert!(matches!(error, EnvError::MissingColumn(ref name) if name == "T_in"));
    }

    #[test]
    fn test_external_observation_fills_state() {
        let mut env = no_engine(
            EnvParameter::default()
                .with_observations(["occupancy"])
                .with_external_observation("occupancy", 3.0),
        );
        let (state, _) = env.reset().unwrap();
        assert_eq!(state, vec![3.0]);

        env.set_external_observation("occupancy", 5.0).unwrap();
        assert_eq!(env.step(&[]).unwrap().observation, vec![5.0]);
        assert!(env.set_external_observation("price", 1.0).is_err());
    }

    #[rstest]
    #[case::reward_sources(vec!["cost", "comfort"], None, -3.5)]
    #[case::existing_reward(vec![], Some(0.25), 0.25)]
    #[case::default_penalty(vec![], None, DEFAULT_REWARD)]
    fn test_reward_selection(
        #[case] reward_names: Vec<&'static str>,
        #[case] existing: Option<f64>,
        #[case] expected: f64,
    ) {
        let env = no_engine(EnvParameter::default().with_reward_names(reward_names));

        let mut record = Record::new(60.0);
        record.set("cost", -4.0);
        record.set("comfort", 0.5);
        if let Some(reward) = existing {
            record.set(REWARD_COLUMN, reward);
        }

        assert_eq!(env.assign_reward(&mut record).unwrap(), expected);
        assert_eq!(record.get(REWARD_COLUMN), Some(expected));
    }

    #[test]
    fn test_state_stage_transforms_observation_only() {
        struct Scale;
        impl StateProcessor for Scale {
            fn do_calc(&mut self, state: Vec<f64>, _init: bool) -> anyhow::Result<Vec<f64>> {
                Ok(state.into_iter().map(|value| value * 2.0).collect())
            }
        }

        let stages = StageFactories::default()
            .with_postprocessor(|_| Ok(Box::new(Thermostat) as Box<dyn Postprocessor>))
            .with_stateprocessor(|_| Ok(Box::new(Scale) as Box<dyn StateProcessor>));
        let mut env = no_engine(thermostat_parameter().with_stages(stages));

        let (state, _) = env.reset().unwrap();
        assert_eq!(state, vec![36.0]);
        assert_eq!(env.dataset().last().unwrap().get("T_in"), Some(18.0));
    }

    #[test]
    fn test_float32_precision_applies_to_observations() {
        let mut env = no_engine(
            EnvParameter::default()
                .with_observations(["x"])
                .with_external_observation("x", 0.1),
        );
        let (state, _) = env.reset().unwrap();
        assert_eq!(state, vec![0.1_f32 as f64]);
    }

    #[test]
    fn test_store_data_disabled_keeps_seed_row_only() {
        let mut parameter = thermostat_parameter();
        parameter.store_data = false;
        let mut env = no_engine(parameter);

        env.reset().unwrap();
        env.step(&[0.0]).unwrap();
        env.step(&[0.0]).unwrap();
        assert_eq!(env.dataset().len(), 1);
        assert_eq!(env.dataset().last().unwrap().time, 0.0);
    }

    #[test]
    fn test_step_info_carries_new_row() {
        let mut env = no_engine(thermostat_parameter());
        let (_, reset_info) = env.reset().unwrap();
        let outcome = env.step(&[500.0]).unwrap();

        assert_eq!(outcome.info.episode_id, reset_info.episode_id);
        assert_eq!(outcome.info.data["index"], serde_json::json!([900.0]));
        assert!(!env.render());
    }

    #[test]
    fn test_reset_mode_without_engine_is_physical() {
        let mut env = no_engine(thermostat_parameter().with_ignore_reset(true));
        env.reset().unwrap();
        env.reset().unwrap();

        // nothing loaded, so the window never slides
        assert_eq!(env.episode_window(), (0.0, 3600.0));
        assert_eq!(env.engine_lifecycle(), EngineLifecycle::Unloaded);
    }
}
