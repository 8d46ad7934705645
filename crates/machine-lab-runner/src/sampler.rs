//! Randomized create-time parameters drawn from the provider's server options.

use anyhow::{anyhow, Result};
use serde_json::Value;
use std::env;
use std::fs;
use tracing::{debug, info, warn};

use crate::config::SamplerConfig;
use crate::fsutil::atomic_write_bytes;

/// One `(flag, value)` pair appended to the create command.
pub type CreateArg = (String, String);

/// Source of create arguments, drawn once per run before its launch.
pub trait CreateArgSource {
    fn next_args(&mut self) -> Result<Vec<CreateArg>>;
}

/// Fixed arguments for every run; used when there is no catalog to sample.
#[derive(Debug, Clone, Default)]
pub struct StaticCreateArgs(pub Vec<CreateArg>);

impl CreateArgSource for StaticCreateArgs {
    fn next_args(&mut self) -> Result<Vec<CreateArg>> {
        Ok(self.0.clone())
    }
}

#[derive(Debug)]
pub struct CreateArgSampler {
    options: Vec<(String, Vec<String>)>,
    rng: fastrand::Rng,
}

impl CreateArgSampler {
    pub fn load(config: &SamplerConfig, driver: &str) -> Result<Self> {
        let raw = load_catalog_text(config)?;
        let catalog: Value = serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid server options catalog: {}", e))?;
        Self::from_catalog(&catalog, driver, config)
    }

    pub fn from_catalog(catalog: &Value, driver: &str, config: &SamplerConfig) -> Result<Self> {
        let obj = catalog
            .as_object()
            .ok_or_else(|| anyhow!("server options catalog must be a JSON object"))?;
        let mut options = Vec::new();
        for (key, flag_suffix) in [
            ("datacenters", "datacenter"),
            ("cpu", "cpu"),
            ("ram", "ram"),
            ("disk", "disk-size"),
        ] {
            let Some(raw) = obj.get(key) else {
                debug!(option = key, "catalog has no entry, skipping");
                continue;
            };
            let values = match key {
                "datacenters" => raw
                    .as_object()
                    .map(|m| m.keys().cloned().collect::<Vec<_>>())
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|dc| !config.excluded_datacenters.contains(dc))
                    .collect::<Vec<_>>(),
                "cpu" => scalar_values(raw)
                    .into_iter()
                    .filter(|v| match cpu_cores(v) {
                        Some(cores) => cores < config.cpu_ceiling,
                        None => {
                            warn!(value = %v, "unrecognized cpu tier");
                            false
                        }
                    })
                    .collect(),
                "ram" => scalar_values(raw)
                    .into_iter()
                    .filter(|v| {
                        v.parse::<u64>()
                            .map(|mb| mb < config.ram_ceiling_mb)
                            .unwrap_or(false)
                    })
                    .collect(),
                _ => scalar_values(raw),
            };
            if values.is_empty() {
                return Err(anyhow!(
                    "server options catalog leaves no valid choices for '{}'",
                    key
                ));
            }
            options.push((format!("--{}-{}", driver, flag_suffix), values));
        }
        if options.is_empty() {
            return Err(anyhow!("server options catalog has no usable options"));
        }
        let rng = match config.seed {
            Some(seed) => fastrand::Rng::with_seed(seed),
            None => fastrand::Rng::new(),
        };
        Ok(Self { options, rng })
    }
}

impl CreateArgSource for CreateArgSampler {
    fn next_args(&mut self) -> Result<Vec<CreateArg>> {
        let mut args = Vec::with_capacity(self.options.len());
        for (flag, values) in &self.options {
            let value = &values[self.rng.usize(..values.len())];
            args.push((flag.clone(), value.clone()));
        }
        Ok(args)
    }
}

fn scalar_values(raw: &Value) -> Vec<String> {
    raw.as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Core count of a cpu tier such as `2B` or `8D`.
fn cpu_cores(tier: &str) -> Option<u32> {
    let digits: String = tier.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

fn load_catalog_text(config: &SamplerConfig) -> Result<String> {
    if config.catalog_path.exists() {
        info!(
            path = %config.catalog_path.display(),
            "loading server options from local file, delete it to fetch fresh options"
        );
        return Ok(fs::read_to_string(&config.catalog_path)?);
    }
    let url = config.catalog_url.as_deref().ok_or_else(|| {
        anyhow!(
            "server options catalog {} not found and no catalog_url configured",
            config.catalog_path.display()
        )
    })?;
    let client_id = env::var(&config.client_id_env)
        .map_err(|_| anyhow!("missing required env var: {}", config.client_id_env))?;
    let secret = env::var(&config.secret_env)
        .map_err(|_| anyhow!("missing required env var: {}", config.secret_env))?;
    info!(url, "fetching server options");
    let body = reqwest::blocking::Client::new()
        .get(url)
        .header("AuthClientId", client_id)
        .header("AuthSecret", secret)
        .send()?
        .error_for_status()?
        .text()?;
    atomic_write_bytes(&config.catalog_path, body.as_bytes())?;
    Ok(body)
}
