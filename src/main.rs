use anyhow::{Context, Result};
use chrono::{Duration, NaiveDateTime};
use fmi_env::config::AppConfig;
use fmi_env::env::FmiEnv;
use fmi_env::recorder::Record;
use fmi_env::simulation::{BuildingConfig, SimulatedLoader};
use fmi_env::telemetry::init_tracing;
use serde_json::{Map, Value};
use std::fs::File;
use std::io::BufWriter;
use tracing::{info, warn};

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let path =
        std::env::var("FMI_ENV_CONFIG").unwrap_or_else(|_| "config/default.toml".to_string());
    let cfg = AppConfig::load(&path)?;
    let config = cfg.env.clone().resolve()?;

    if !config.use_fmu() {
        warn!("no fmu_path configured, observations must come from external signals");
    }

    let loader = SimulatedLoader::new(BuildingConfig::default(), config.seed);
    let mut env = FmiEnv::new(config, loader)?;

    let (_, reset_info) = env.reset()?;
    info!(episode_id = %reset_info.episode_id, config = %path, "simulation started");

    let neutral = vec![0.0; env.action_space().dim()];
    let mut steps = 0usize;
    let mut total_reward = 0.0;
    loop {
        let outcome = env.step(&neutral)?;
        steps += 1;
        total_reward += outcome.reward;
        if outcome.done {
            break;
        }
    }

    let rows = timestamped(env.dataset().rows(), cfg.runner.start_date);
    let file = File::create(&cfg.runner.output)
        .with_context(|| format!("creating {}", cfg.runner.output.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), &rows)?;

    info!(
        steps,
        total_reward,
        rows = rows.len(),
        output = %cfg.runner.output.display(),
        "simulation complete"
    );
    env.close();
    Ok(())
}

/// Records as JSON objects with a wall-clock `timestamp` first
fn timestamped(records: &[Record], start_date: NaiveDateTime) -> Vec<Value> {
    records
        .iter()
        .map(|record| {
            let timestamp =
                start_date + Duration::milliseconds((record.time * 1000.0).round() as i64);
            let mut row = Map::new();
            row.insert(
                "timestamp".to_string(),
                Value::String(timestamp.format("%Y-%m-%d %H:%M:%S").to_string()),
            );
            row.insert("time".to_string(), Value::from(record.time));
            for (name, value) in &record.columns {
                row.insert(name.clone(), Value::from(*value));
            }
            Value::Object(row)
        })
        .collect()
}
