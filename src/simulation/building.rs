use anyhow::{anyhow, bail, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use tracing::debug;

use crate::config::FmuKind;
use crate::engine::{FmuLoader, FmuModel};

const SECONDS_PER_DAY: f64 = 86_400.0;
/// Internal integration step of the zone model
const MAX_SUBSTEP_S: f64 = 60.0;
const CEILING_HEIGHT_M: f64 = 2.7;
const AIR_DENSITY: f64 = 1.2;
const AIR_SPECIFIC_HEAT: f64 = 1005.0;

/// Lumped single-zone building parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildingConfig {
    pub floor_area_m2: f64,
    /// Envelope conductance per floor area, W/(m²·K)
    pub envelope_ua_w_per_m2k: f64,
    pub window_area_m2: f64,
    pub solar_transmittance: f64,
    pub internal_gains_w: f64,
    /// Effective thermal mass as a multiple of the air mass
    pub mass_factor: f64,
    pub initial_temp_c: f64,
    pub outdoor_mean_c: f64,
    pub outdoor_amplitude_c: f64,
    pub peak_dni_w_m2: f64,
    pub heating_cop: f64,
    pub noise_std_c: f64,
}

impl Default for BuildingConfig {
    fn default() -> Self {
        Self {
            floor_area_m2: 120.0,
            envelope_ua_w_per_m2k: 1.1,
            window_area_m2: 18.0,
            solar_transmittance: 0.55,
            internal_gains_w: 350.0,
            mass_factor: 40.0,
            initial_temp_c: 20.0,
            outdoor_mean_c: 4.0,
            outdoor_amplitude_c: 5.0,
            peak_dni_w_m2: 650.0,
            heating_cop: 3.2,
            noise_std_c: 0.0,
        }
    }
}

/// Parameters settable through `set` before initialization, with inputs
/// settable at any time
const PARAMETERS: [&str; 5] = [
    "floor_area_m2",
    "envelope_ua_w_per_m2k",
    "internal_gains_w",
    "initial_temp_c",
    "outdoor_mean_c",
];
const INPUTS: [&str; 2] = ["heating_power_w", "shade"];

/// Simulated building exposed through the engine interface
///
/// Inputs: `heating_power_w` (thermal output, W) and `shade` (0 open,
/// 1 closed). Outputs: `T_in`, `T_out`, `DNI`, `Electricity` (kWh over the
/// last step), `heating_power_w`, `shade`.
pub struct SimulatedBuilding {
    config: BuildingConfig,
    time: f64,
    start_time: f64,
    initialized: bool,
    terminated: bool,
    indoor_temp_c: f64,
    heating_power_w: f64,
    shade: f64,
    last_step_electricity_kwh: f64,
    rng: StdRng,
    noise: Option<Normal<f64>>,
}

impl SimulatedBuilding {
    pub fn new(config: BuildingConfig, seed: Option<u64>) -> Result<Self> {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let noise = if config.noise_std_c > 0.0 {
            Some(Normal::new(0.0, config.noise_std_c)?)
        } else {
            None
        };
        Ok(Self {
            indoor_temp_c: config.initial_temp_c,
            config,
            time: 0.0,
            start_time: 0.0,
            initialized: false,
            terminated: false,
            heating_power_w: 0.0,
            shade: 0.0,
            last_step_electricity_kwh: 0.0,
            rng,
            noise,
        })
    }

    /// Clear-sky direct normal irradiance with a 06:00–18:00 day
    pub fn dni_w_m2(&self, time: f64) -> f64 {
        let hour = (time.rem_euclid(SECONDS_PER_DAY)) / 3600.0;
        if (6.0..18.0).contains(&hour) {
            self.config.peak_dni_w_m2 * (PI * (hour - 6.0) / 12.0).sin()
        } else {
            0.0
        }
    }

    /// Daily sinusoid peaking at 15:00
    pub fn outdoor_temp_c(&self, time: f64) -> f64 {
        let phase = 2.0 * PI * (time.rem_euclid(SECONDS_PER_DAY) / SECONDS_PER_DAY - 0.375);
        self.config.outdoor_mean_c + self.config.outdoor_amplitude_c * phase.sin()
    }

    fn integrate(&mut self, dt_seconds: f64) {
        let volume_m3 = self.config.floor_area_m2 * CEILING_HEIGHT_M;
        let thermal_mass_j_per_k =
            volume_m3 * AIR_DENSITY * AIR_SPECIFIC_HEAT * self.config.mass_factor;
        let ua_w_per_k = self.config.envelope_ua_w_per_m2k * self.config.floor_area_m2;

        let outdoor = self.outdoor_temp_c(self.time);
        let heat_loss_w = ua_w_per_k * (self.indoor_temp_c - outdoor);
        let solar_gain_w = self.dni_w_m2(self.time)
            * self.config.window_area_m2
            * self.config.solar_transmittance
            * (1.0 - self.shade);
        let net_heat_w =
            self.heating_power_w + self.config.internal_gains_w + solar_gain_w - heat_loss_w;

        self.indoor_temp_c += net_heat_w * dt_seconds / thermal_mass_j_per_k;
        self.time += dt_seconds;
    }

    fn output(&self, name: &str) -> Result<f64> {
        let value = match name {
            "T_in" => self.indoor_temp_c,
            "T_out" => self.outdoor_temp_c(self.time),
            "DNI" => self.dni_w_m2(self.time),
            "Electricity" => self.last_step_electricity_kwh,
            "heating_power_w" => self.heating_power_w,
            "shade" => self.shade,
            other => bail!("unknown variable {other}"),
        };
        Ok(value)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.terminated {
            bail!("model has been terminated");
        }
        if !self.initialized {
            bail!("model is not initialized");
        }
        Ok(())
    }
}

impl FmuModel for SimulatedBuilding {
    fn set(&mut self, names: &[String], values: &[f64]) -> Result<()> {
        if names.len() != values.len() {
            bail!("{} names but {} values", names.len(), values.len());
        }
        for (name, value) in names.iter().zip(values) {
            if !value.is_finite() {
                bail!("non-finite value for {name}: {value}");
            }
            match name.as_str() {
                "heating_power_w" => self.heating_power_w = value.max(0.0),
                "shade" => self.shade = value.clamp(0.0, 1.0),
                parameter if PARAMETERS.contains(&parameter) => {
                    if self.initialized {
                        bail!("parameter {parameter} cannot change after initialization");
                    }
                    match parameter {
                        "floor_area_m2" => self.config.floor_area_m2 = *value,
                        "envelope_ua_w_per_m2k" => self.config.envelope_ua_w_per_m2k = *value,
                        "internal_gains_w" => self.config.internal_gains_w = *value,
                        "initial_temp_c" => self.config.initial_temp_c = *value,
                        _ => self.config.outdoor_mean_c = *value,
                    }
                }
                other => bail!(
                    "unknown variable {other}; settable: {}",
                    PARAMETERS.iter().chain(&INPUTS).copied().collect::<Vec<_>>().join(", ")
                ),
            }
        }
        Ok(())
    }

    fn get(&mut self, names: &[String]) -> Result<Vec<f64>> {
        self.ensure_running()?;
        names.iter().map(|name| self.output(name)).collect()
    }

    fn setup_experiment(
        &mut self,
        start_time: f64,
        _stop_time: f64,
        _stop_time_defined: bool,
        _tolerance: f64,
    ) -> Result<()> {
        self.start_time = start_time;
        self.time = start_time;
        Ok(())
    }

    fn initialize(&mut self) -> Result<()> {
        if self.terminated {
            bail!("model has been terminated");
        }
        self.indoor_temp_c = self.config.initial_temp_c;
        self.initialized = true;
        debug!(start_time = self.start_time, "simulated building initialized");
        Ok(())
    }

    fn do_step(&mut self, current_time: f64, step_size: f64) -> Result<()> {
        self.ensure_running()?;
        if !(step_size.is_finite() && step_size > 0.0) {
            bail!("invalid step size {step_size}");
        }

        self.time = current_time;
        let end = current_time + step_size;
        while self.time < end {
            let dt = (end - self.time).min(MAX_SUBSTEP_S);
            self.integrate(dt);
        }
        self.time = end;

        if let Some(noise) = self.noise {
            self.indoor_temp_c += noise.sample(&mut self.rng);
        }
        let thermal_kwh = self.heating_power_w * step_size / 3_600_000.0;
        self.last_step_electricity_kwh = thermal_kwh / self.config.heating_cop;
        Ok(())
    }

    fn time(&self) -> f64 {
        self.time
    }

    fn terminate(&mut self) -> Result<()> {
        if self.terminated {
            return Err(anyhow!("model already terminated"));
        }
        self.terminated = true;
        Ok(())
    }
}

/// Loader handing out [`SimulatedBuilding`] instances
#[derive(Debug, Clone, Default)]
pub struct SimulatedLoader {
    pub config: BuildingConfig,
    pub seed: Option<u64>,
}

impl SimulatedLoader {
    pub fn new(config: BuildingConfig, seed: Option<u64>) -> Self {
        Self { config, seed }
    }
}

impl FmuLoader for SimulatedLoader {
    fn load(&self, reference: &str, log_level: u8, kind: FmuKind) -> Result<Box<dyn FmuModel>> {
        if kind == FmuKind::Me {
            bail!("simulated building only supports co-simulation, requested {kind}");
        }
        debug!(reference, log_level, "loading simulated building");
        Ok(Box::new(SimulatedBuilding::new(self.config.clone(), self.seed)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|name| name.to_string()).collect()
    }

    fn running(config: BuildingConfig) -> SimulatedBuilding {
        let mut building = SimulatedBuilding::new(config, Some(7)).unwrap();
        building.setup_experiment(0.0, 86_400.0, false, 1e-6).unwrap();
        building.initialize().unwrap();
        building
    }

    #[test]
    fn test_get_requires_initialization() {
        let mut building = SimulatedBuilding::new(BuildingConfig::default(), Some(1)).unwrap();
        assert!(building.get(&names(&["T_in"])).is_err());
    }

    #[test]
    fn test_heating_raises_indoor_temperature() {
        let mut heated = running(BuildingConfig::default());
        let mut unheated = running(BuildingConfig::default());

        heated.set(&names(&["heating_power_w"]), &[4000.0]).unwrap();
        heated.do_step(0.0, 3600.0).unwrap();
        unheated.do_step(0.0, 3600.0).unwrap();

        let t_heated = heated.get(&names(&["T_in"])).unwrap()[0];
        let t_unheated = unheated.get(&names(&["T_in"])).unwrap()[0];
        assert!(t_heated > t_unheated);
        assert_eq!(heated.time(), 3600.0);
        assert!(heated.get(&names(&["Electricity"])).unwrap()[0] > 0.0);
    }

    #[test]
    fn test_shading_blocks_solar_gain() {
        let mut open = running(BuildingConfig::default());
        let mut shaded = running(BuildingConfig::default());
        shaded.set(&names(&["shade"]), &[1.0]).unwrap();

        // noon
        open.do_step(0.0, 12.0 * 3600.0).unwrap();
        shaded.do_step(0.0, 12.0 * 3600.0).unwrap();

        let t_in = names(&["T_in"]);
        assert!(open.get(&t_in).unwrap()[0] > shaded.get(&t_in).unwrap()[0]);
    }

    #[test]
    fn test_daily_profiles() {
        let building = running(BuildingConfig::default());
        assert_eq!(building.dni_w_m2(0.0), 0.0);
        assert!(building.dni_w_m2(12.0 * 3600.0) > 600.0);
        assert!(building.outdoor_temp_c(15.0 * 3600.0) > building.outdoor_temp_c(3.0 * 3600.0));
    }

    #[test]
    fn test_parameters_locked_after_initialize() {
        let mut building = SimulatedBuilding::new(BuildingConfig::default(), Some(1)).unwrap();
        building.set(&names(&["initial_temp_c"]), &[22.5]).unwrap();
        building.setup_experiment(0.0, 3600.0, false, 1e-6).unwrap();
        building.initialize().unwrap();

        assert_eq!(building.get(&names(&["T_in"])).unwrap(), vec![22.5]);
        assert!(building.set(&names(&["initial_temp_c"]), &[18.0]).is_err());
        assert!(building.set(&names(&["unknown"]), &[1.0]).is_err());
    }

    #[test]
    fn test_seeded_noise_is_reproducible() {
        let config = BuildingConfig {
            noise_std_c: 0.2,
            ..Default::default()
        };
        let mut a = running(config.clone());
        let mut b = running(config);
        a.do_step(0.0, 600.0).unwrap();
        b.do_step(0.0, 600.0).unwrap();

        assert_eq!(a.get(&names(&["T_in"])).unwrap(), b.get(&names(&["T_in"])).unwrap());
    }

    #[test]
    fn test_loader_rejects_model_exchange() {
        let loader = SimulatedLoader::default();
        assert!(loader.load("building", 4, FmuKind::Me).is_err());
        assert!(loader.load("building", 4, FmuKind::Cs).is_ok());
    }

    #[test]
    fn test_terminate_twice_fails() {
        let mut building = running(BuildingConfig::default());
        building.terminate().unwrap();
        assert!(building.terminate().is_err());
        assert!(building.do_step(0.0, 60.0).is_err());
    }
}
