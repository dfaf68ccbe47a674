//! Metric logging backends
//!
//! A metric logger receives the resolved config once at setup, one metric
//! dictionary per logged step, and a final `close`.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::RecipeConfig;
use crate::error::Result;

/// Named scalar metrics for one step
pub type Metrics = BTreeMap<String, f64>;

pub trait MetricLogger {
    fn log_config(&mut self, config: &RecipeConfig) -> Result<()>;

    fn log_dict(&mut self, metrics: &Metrics, step: usize) -> Result<()>;

    /// Release any resources held by the logger
    fn close(&mut self) -> Result<()>;
}

fn format_step(metrics: &Metrics, step: usize) -> String {
    let body: Vec<String> = metrics.iter().map(|(k, v)| format!("{}:{}", k, v)).collect();
    format!("Step {} | {}", step, body.join(" "))
}

/// Logs metrics through `tracing`
#[derive(Debug, Default)]
pub struct StdoutLogger;

impl MetricLogger for StdoutLogger {
    fn log_config(&mut self, config: &RecipeConfig) -> Result<()> {
        info!("Running with config:\n{}", serde_json::to_string_pretty(config)?);
        Ok(())
    }

    fn log_dict(&mut self, metrics: &Metrics, step: usize) -> Result<()> {
        info!(target: "kdtune::metrics", "{}", format_step(metrics, step));
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Appends `Step N | key:value ...` lines to `log_<timestamp>.txt` in a directory
#[derive(Debug)]
pub struct DiskLogger {
    path: PathBuf,
    file: Option<File>,
}

impl DiskLogger {
    pub fn new(log_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(log_dir)?;
        let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S_%3f");
        let path = log_dir.join(format!("log_{}.txt", stamp));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!("Writing metrics to {:?}", path);
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            writeln!(file, "{}", line)?;
            file.flush()?;
        }
        Ok(())
    }
}

impl MetricLogger for DiskLogger {
    fn log_config(&mut self, config: &RecipeConfig) -> Result<()> {
        let line = format!("Config: {}", serde_json::to_string(config)?);
        self.write_line(&line)
    }

    fn log_dict(&mut self, metrics: &Metrics, step: usize) -> Result<()> {
        let line = format_step(metrics, step);
        self.write_line(&line)
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        Ok(())
    }
}
