//! # Pipeline Stages
//!
//! Four optional, caller-supplied transformations invoked around each step:
//!
//! | Stage             | Runs on                                   |
//! |-------------------|-------------------------------------------|
//! | [`Preprocessor`]  | raw action/time record, before the engine |
//! | [`Postprocessor`] | merged record, after the engine           |
//! | [`StateProcessor`]| observation vector returned to the caller |
//! | [`ResetProcessor`]| initial record and configuration on reset |
//!
//! A stage that is not configured is the [`Identity`] stage. Errors raised by
//! a stage are returned to the caller unchanged as [`EnvError::Stage`].

use anyhow::Result;
use std::fmt;
use std::sync::Arc;

use crate::config::EnvConfig;
use crate::error::{EnvError, EnvResult};
use crate::recorder::Record;

pub trait Preprocessor: Send {
    fn do_calc(&mut self, record: Record, init: bool) -> Result<Record>;
}

pub trait Postprocessor: Send {
    fn do_calc(&mut self, record: Record, init: bool) -> Result<Record>;
}

pub trait StateProcessor: Send {
    fn do_calc(&mut self, state: Vec<f64>, init: bool) -> Result<Vec<f64>>;
}

/// Runs at the start of every reset and may rewrite the configuration
/// used for the new episode.
pub trait ResetProcessor: Send {
    fn do_calc(
        &mut self,
        record: Record,
        config: EnvConfig,
        init: bool,
    ) -> Result<(Record, EnvConfig)>;
}

/// Pass-through stage used for every slot without a factory
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl Preprocessor for Identity {
    fn do_calc(&mut self, record: Record, _init: bool) -> Result<Record> {
        Ok(record)
    }
}

impl Postprocessor for Identity {
    fn do_calc(&mut self, record: Record, _init: bool) -> Result<Record> {
        Ok(record)
    }
}

impl StateProcessor for Identity {
    fn do_calc(&mut self, state: Vec<f64>, _init: bool) -> Result<Vec<f64>> {
        Ok(state)
    }
}

impl ResetProcessor for Identity {
    fn do_calc(
        &mut self,
        record: Record,
        config: EnvConfig,
        _init: bool,
    ) -> Result<(Record, EnvConfig)> {
        Ok((record, config))
    }
}

/// Builds a stage from the resolved configuration
pub type Factory<T> = Arc<dyn Fn(&EnvConfig) -> Result<Box<T>> + Send + Sync>;

pub type PreprocessorFactory = Factory<dyn Preprocessor>;
pub type PostprocessorFactory = Factory<dyn Postprocessor>;
pub type StateProcessorFactory = Factory<dyn StateProcessor>;
pub type ResetProcessorFactory = Factory<dyn ResetProcessor>;

/// Optional constructors for each stage, called once per environment
#[derive(Clone, Default)]
pub struct StageFactories {
    pub preprocessor: Option<PreprocessorFactory>,
    pub postprocessor: Option<PostprocessorFactory>,
    pub stateprocessor: Option<StateProcessorFactory>,
    pub resetprocessor: Option<ResetProcessorFactory>,
}

impl fmt::Debug for StageFactories {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageFactories")
            .field("preprocessor", &self.preprocessor.is_some())
            .field("postprocessor", &self.postprocessor.is_some())
            .field("stateprocessor", &self.stateprocessor.is_some())
            .field("resetprocessor", &self.resetprocessor.is_some())
            .finish()
    }
}

impl StageFactories {
    pub fn with_preprocessor<F>(mut self, factory: F) -> Self
    where
        F: Fn(&EnvConfig) -> Result<Box<dyn Preprocessor>> + Send + Sync + 'static,
    {
        self.preprocessor = Some(Arc::new(factory));
        self
    }

    pub fn with_postprocessor<F>(mut self, factory: F) -> Self
    where
        F: Fn(&EnvConfig) -> Result<Box<dyn Postprocessor>> + Send + Sync + 'static,
    {
        self.postprocessor = Some(Arc::new(factory));
        self
    }

    pub fn with_stateprocessor<F>(mut self, factory: F) -> Self
    where
        F: Fn(&EnvConfig) -> Result<Box<dyn StateProcessor>> + Send + Sync + 'static,
    {
        self.stateprocessor = Some(Arc::new(factory));
        self
    }

    pub fn with_resetprocessor<F>(mut self, factory: F) -> Self
    where
        F: Fn(&EnvConfig) -> Result<Box<dyn ResetProcessor>> + Send + Sync + 'static,
    {
        self.resetprocessor = Some(Arc::new(factory));
        self
    }
}

/// The four stages of one environment, identity where not configured
pub struct Pipeline {
    pre: Box<dyn Preprocessor>,
    post: Box<dyn Postprocessor>,
    state: Box<dyn StateProcessor>,
    reset: Box<dyn ResetProcessor>,
}

fn construct<T: ?Sized>(
    kind: &str,
    factory: Option<&Factory<T>>,
    config: &EnvConfig,
) -> EnvResult<Option<Box<T>>> {
    factory
        .map(|factory| {
            factory(config).map_err(|error| {
                EnvError::Configuration(format!("failed to construct {kind}: {error:#}"))
            })
        })
        .transpose()
}

impl Pipeline {
    /// Construct every configured stage from the resolved configuration
    pub fn build(config: &EnvConfig) -> EnvResult<Self> {
        let stages = &config.stages;

        let pre: Box<dyn Preprocessor> =
            match construct("preprocessor", stages.preprocessor.as_ref(), config)? {
                Some(stage) => stage,
                None => Box::new(Identity),
            };
        let post: Box<dyn Postprocessor> =
            match construct("postprocessor", stages.postprocessor.as_ref(), config)? {
                Some(stage) => stage,
                None => Box::new(Identity),
            };
        let state: Box<dyn StateProcessor> =
            match construct("stateprocessor", stages.stateprocessor.as_ref(), config)? {
                Some(stage) => stage,
                None => Box::new(Identity),
            };
        let reset: Box<dyn ResetProcessor> =
            match construct("resetprocessor", stages.resetprocessor.as_ref(), config)? {
                Some(stage) => stage,
                None => Box::new(Identity),
            };

        tracing::debug!(stages = ?stages, "pipeline constructed");
        Ok(Self {
            pre,
            post,
            state,
            reset,
        })
    }

    pub fn pre_step(&mut self, record: Record, init: bool) -> EnvResult<Record> {
        self.pre.do_calc(record, init).map_err(EnvError::Stage)
    }

    pub fn post_step(&mut self, record: Record, init: bool) -> EnvResult<Record> {
        self.post.do_calc(record, init).map_err(EnvError::Stage)
    }

    pub fn state(&mut self, state: Vec<f64>, init: bool) -> EnvResult<Vec<f64>> {
        self.state.do_calc(state, init).map_err(EnvError::Stage)
    }

    pub fn reset(
        &mut self,
        record: Record,
        config: EnvConfig,
        init: bool,
    ) -> EnvResult<(Record, EnvConfig)> {
        self.reset
            .do_calc(record, config, init)
            .map_err(EnvError::Stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvParameter;

    struct AddColumn(&'static str, f64);

    impl Postprocessor for AddColumn {
        fn do_calc(&mut self, mut record: Record, _init: bool) -> Result<Record> {
            record.set(self.0, self.1);
            Ok(record)
        }
    }

    struct Failing;

    impl Preprocessor for Failing {
        fn do_calc(&mut self, _record: Record, _init: bool) -> Result<Record> {
            anyhow::bail!("sensor feed offline")
        }
    }

    #[test]
    fn test_unconfigured_pipeline_is_identity() {
        let config = EnvParameter::default().resolve().unwrap();
        let mut pipeline = Pipeline::build(&config).unwrap();

        let mut record = Record::new(60.0);
        record.set("a", 1.5);

        assert_eq!(pipeline.pre_step(record.clone(), true).unwrap(), record);
        assert_eq!(pipeline.post_step(record.clone(), false).unwrap(), record);
        assert_eq!(pipeline.state(vec![1.0, 2.0], false).unwrap(), vec![1.0, 2.0]);

        let (reset_record, reset_config) = pipeline
            .reset(record.clone(), config.clone(), true)
            .unwrap();
        assert_eq!(reset_record, record);
        assert_eq!(reset_config.fmu_step_size, config.fmu_step_size);
    }

    #[test]
    fn test_configured_stage_is_used() {
        let stages = StageFactories::default()
            .with_postprocessor(|_| Ok(Box::new(AddColumn("k", 7.0)) as Box<dyn Postprocessor>));
        let config = EnvParameter::default().with_stages(stages).resolve().unwrap();
        let mut pipeline = Pipeline::build(&config).unwrap();

        let record = pipeline.post_step(Record::new(0.0), true).unwrap();
        assert_eq!(record.get("k"), Some(7.0));
    }

    #[test]
    fn test_stage_error_propagates_verbatim() {
        let stages = StageFactories::default()
            .with_preprocessor(|_| Ok(Box::new(Failing) as Box<dyn Preprocessor>));
        let config = EnvParameter::default().with_stages(stages).resolve().unwrap();
        let mut pipeline = Pipeline::build(&config).unwrap();

        let error = pipeline.pre_step(Record::new(0.0), true).unwrap_err();
        assert!(matches!(error, EnvError::Stage(_)));
        assert_eq!(error.to_string(), "sensor feed offline");
    }

    #[test]
    fn test_factory_failure_is_configuration_error() {
        let stages = StageFactories::default()
            .with_stateprocessor(|_| anyhow::bail!("missing scaler file"));
        let config = EnvParameter::default().with_stages(stages).resolve().unwrap();

        let error = Pipeline::build(&config).err().unwrap();
        assert!(matches!(error, EnvError::Configuration(_)));
        assert!(error.to_string().contains("missing scaler file"));
    }
}
