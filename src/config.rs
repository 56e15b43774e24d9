use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;

#[derive(Parser)]
#[command(name = "grader", version = "1.0", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: String,

    /// Whether to flush the existing database
    #[arg(long = "flush-data", short = 'f', default_value_t = false)]
    pub flush_data: bool,

    /// Number of grading workers, i.e. the maximum number of sandboxes running at once
    #[arg(long = "workers", short = 'w', default_value_t = 2)]
    pub workers: u8,
}

impl CliArgs {
    /// Load the configuration from the specified file
    pub fn to_config(&self) -> anyhow::Result<Config> {
        let file = std::fs::File::open(&self.config_path)
            .with_context(|| format!("Unable to open config file {}", self.config_path))?;
        let reader = std::io::BufReader::new(file);
        serde_json::from_reader(reader)
            .with_context(|| format!("Invalid config file {}", self.config_path))
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub grading: GradingConfig,
    pub runners: Vec<RunnerConfig>,
    pub exercises: Vec<ExerciseConfig>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: Option<String>,
    pub bind_port: Option<u16>,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Engine {
    #[default]
    Docker,
    /// Runs payloads directly on the host, without any isolation
    Local,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct GradingConfig {
    pub engine: Engine,
    pub workspace_root: Option<PathBuf>,
    pub clone_timeout: Second,
    pub sandbox_timeout: Second,
    pub memory_limit: ByteSize,
    pub cpu_limit: f64,
    pub pids_limit: u32,
    pub result_file: String,
    pub max_result_bytes: ByteSize,
}

impl Default for GradingConfig {
    fn default() -> Self {
        Self {
            engine: Engine::Docker,
            workspace_root: None,
            clone_timeout: Second(60),
            sandbox_timeout: Second(120),
            memory_limit: ByteSize(512 * 1024 * 1024),
            cpu_limit: 0.5,
            pids_limit: 512,
            result_file: "result.json".to_string(),
            max_result_bytes: ByteSize(1024 * 1024),
        }
    }
}

/// Maps an exercise type to the sandbox image that grades it.
#[derive(Deserialize, Debug, Clone)]
pub struct RunnerConfig {
    #[serde(rename = "type")]
    pub exercise_type: String,
    pub image: String,
    /// Overrides the image entrypoint; the whole command line for the local engine
    #[serde(default)]
    pub command: Vec<String>,
    /// Checks that must pass for a submission to pass; empty means all of them
    #[serde(default)]
    pub required_checks: Vec<String>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ExerciseConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub exercise_type: String,
    pub result_schema_version: Option<u32>,
    #[serde(default = "default_max_score")]
    pub max_score: f64,
}

fn default_max_score() -> f64 {
    100.0
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Second(pub u64);

impl From<Second> for Duration {
    fn from(value: Second) -> Self {
        Duration::from_secs(value.0)
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(pub u64);
