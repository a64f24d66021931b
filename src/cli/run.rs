use crate::clock::{Clock, SystemClock};
use crate::config::{load_config, ConfigError};
use crate::engine::{Appendable, Appender, Engine, EngineError};
use crate::series::{Sample, SeriesLabels};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("failed to read samples from stdin: {0}")]
    Input(#[from] std::io::Error),
}

/// One line of newline-delimited JSON input.
#[derive(Debug, Deserialize)]
struct InputSample {
    labels: BTreeMap<String, String>,
    /// Milliseconds since the Unix epoch; now when absent
    #[serde(default)]
    timestamp: Option<i64>,
    value: f64,
}

impl InputSample {
    fn into_sample(self, now_ms: i64) -> Sample {
        Sample::new(
            SeriesLabels::from_pairs(self.labels),
            self.timestamp.unwrap_or(now_ms),
            self.value,
        )
    }
}

pub async fn run(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = match config_path {
        Some(path) => path,
        None => {
            eprintln!("Error: config not found");
            eprintln!("Searched locations:");
            eprintln!("  ~/.config/remote-queue/config.yml");
            eprintln!("  /etc/remote-queue/config.yml");
            eprintln!("\nUse --config <path> to specify a config file, or run 'remote-queue config init' to generate one.");
            std::process::exit(1);
        }
    };

    run_engine(&config_path).await.map_err(|e| e.into())
}

async fn run_engine(config_path: &Path) -> Result<(), RunError> {
    info!(config_path = %config_path.display(), "Loading configuration");
    let config = load_config(config_path)?;

    let engine = Engine::start(config).await?;
    let appender = engine.appender();

    info!("Reading samples from stdin, press Ctrl+C to shutdown");

    let result = tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received");
            Ok(())
        }
        result = feed_stdin(&appender) => {
            if result.is_ok() {
                info!("Input closed");
            }
            result
        }
    };

    let stats = engine.shutdown().await;
    for endpoint in &stats.endpoints {
        info!(
            endpoint = %endpoint.name,
            delivered = endpoint.total(|s| s.samples_delivered),
            dropped = endpoint.total(|s| s.samples_dropped),
            pending = endpoint.total(|s| s.queue_depth),
            "Endpoint summary"
        );
    }

    result.map_err(RunError::from)
}

async fn feed_stdin(appender: &Appender) -> std::io::Result<()> {
    let clock = SystemClock;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_no = 0u64;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let input: InputSample = match serde_json::from_str(line) {
            Ok(input) => input,
            Err(e) => {
                warn!(line = line_no, error = %e, "Skipping malformed sample");
                continue;
            }
        };

        let outcome = appender.append(input.into_sample(clock.now_ms())).await;
        if !outcome.is_accepted() {
            debug!(line = line_no, outcome = ?outcome, "Sample not accepted");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_sample_defaults_timestamp() {
        let input: InputSample =
            serde_json::from_str(r#"{"labels":{"__name__":"up","job":"node"},"value":1.5}"#).unwrap();
        let sample = input.into_sample(42_000);

        assert_eq!(sample.timestamp_ms, 42_000);
        assert_eq!(sample.value, 1.5);
        assert_eq!(sample.series.get("job"), Some("node"));
    }

    #[test]
    fn test_input_sample_explicit_timestamp() {
        let input: InputSample =
            serde_json::from_str(r#"{"labels":{"__name__":"up"},"timestamp":1000,"value":0}"#).unwrap();
        assert_eq!(input.into_sample(42_000).timestamp_ms, 1000);
    }

    #[test]
    fn test_input_sample_requires_value() {
        assert!(serde_json::from_str::<InputSample>(r#"{"labels":{}}"#).is_err());
    }
}
