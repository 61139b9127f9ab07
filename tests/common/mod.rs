#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use fmi_env::config::FmuKind;
use fmi_env::{FmuLoader, FmuModel};
use indexmap::IndexMap;

/// Name under which a [`FixedEngine`] reports which load produced it
pub const INSTANCE_OUTPUT: &str = "instance";

/// Engine that ignores its inputs and reports a fixed set of outputs
pub struct FixedEngine {
    outputs: IndexMap<String, f64>,
    instance: usize,
    time: f64,
    lag: f64,
    fail_after: Option<usize>,
    steps: usize,
    terminations: Arc<AtomicUsize>,
    inputs: Arc<Mutex<Vec<(String, f64)>>>,
}

impl FmuModel for FixedEngine {
    fn set(&mut self, names: &[String], values: &[f64]) -> Result<()> {
        let mut inputs = self.inputs.lock().map_err(|_| anyhow::anyhow!("poisoned"))?;
        inputs.extend(names.iter().cloned().zip(values.iter().copied()));
        Ok(())
    }

    fn get(&mut self, names: &[String]) -> Result<Vec<f64>> {
        names
            .iter()
            .map(|name| match name.as_str() {
                INSTANCE_OUTPUT => Ok(self.instance as f64),
                other => match self.outputs.get(other) {
                    Some(value) => Ok(*value),
                    None => bail!("unknown variable {other}"),
                },
            })
            .collect()
    }

    fn setup_experiment(
        &mut self,
        start_time: f64,
        _stop: f64,
        _defined: bool,
        _tol: f64,
    ) -> Result<()> {
        self.time = start_time;
        Ok(())
    }

    fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    fn do_step(&mut self, current_time: f64, step_size: f64) -> Result<()> {
        if self.fail_after == Some(self.steps) {
            bail!("solver diverged at t={current_time}");
        }
        self.steps += 1;
        self.time = current_time + step_size - self.lag;
        Ok(())
    }

    fn time(&self) -> f64 {
        self.time
    }

    fn terminate(&mut self) -> Result<()> {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Loader that counts loads and terminations across all its engines
#[derive(Clone, Default)]
pub struct CountingLoader {
    pub outputs: IndexMap<String, f64>,
    pub loads: Arc<AtomicUsize>,
    pub terminations: Arc<AtomicUsize>,
    /// Every `(name, value)` pushed through `set`, in call order
    pub inputs: Arc<Mutex<Vec<(String, f64)>>>,
    /// Engine clock lags the requested time by this much after each step
    pub lag: f64,
    /// Fail the step following this many successful ones
    pub fail_after: Option<usize>,
}

impl CountingLoader {
    pub fn with_outputs(outputs: &[(&str, f64)]) -> Self {
        Self {
            outputs: outputs
                .iter()
                .map(|(name, value)| (name.to_string(), *value))
                .collect(),
            ..Self::default()
        }
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }

    pub fn inputs(&self) -> Vec<(String, f64)> {
        self.inputs.lock().unwrap().clone()
    }
}

impl FmuLoader for CountingLoader {
    fn load(&self, _reference: &str, _log_level: u8, _kind: FmuKind) -> Result<Box<dyn FmuModel>> {
        let instance = self.loads.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(FixedEngine {
            outputs: self.outputs.clone(),
            instance,
            time: 0.0,
            lag: self.lag,
            fail_after: self.fail_after,
            steps: 0,
            terminations: self.terminations.clone(),
            inputs: self.inputs.clone(),
        }))
    }
}
