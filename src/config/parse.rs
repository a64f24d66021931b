use super::types::*;
use crate::config::{env_var_pattern, expand_env_vars, expand_tilde};
use crate::series::is_valid_label_name;
use regex::Regex;
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

/// The delivery timers tick at one-second resolution.
const MIN_FLUSH_FREQUENCY: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    use std::io::Read;

    let mut file = File::open(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to open config file '{}': {}", path.display(), e),
        ))
    })?;

    let mut yaml_string = String::new();
    file.read_to_string(&mut yaml_string).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;

    parse_config(&yaml_string).map_err(|e| match e {
        ConfigError::YamlParse(e) => ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("in file '{}': {}", path.display(), e),
        )),
        other => other,
    })
}

/// Parse and validate a config from a YAML string.
pub fn parse_config(yaml: &str) -> Result<Config, ConfigError> {
    // Expand environment variables in the YAML string before parsing
    let yaml_string = expand_env_vars(yaml);
    check_unexpanded_vars(&yaml_string)?;

    let mut config: Config = serde_yaml::from_str(&yaml_string)?;
    config.data_dir = expand_tilde(&config.data_dir);

    validate_config(&config)?;
    Ok(config)
}

/// Checks for unexpanded environment variables and returns a helpful error
fn check_unexpanded_vars(yaml_string: &str) -> Result<(), ConfigError> {
    let mut unexpanded_vars: Vec<String> = env_var_pattern()
        .captures_iter(yaml_string)
        .map(|cap| cap[1].to_string())
        .collect();

    if unexpanded_vars.is_empty() {
        return Ok(());
    }

    unexpanded_vars.sort();
    unexpanded_vars.dedup();

    let error_msg = if unexpanded_vars.len() == 1 {
        format!(
            "Environment variable $env{{{0}}} is not set.\n\
             \n\
             To fix this, either:\n\
             1. Set the environment variable: export {0}=...\n\
             2. Replace $env{{{0}}} in the config file with an actual value",
            unexpanded_vars[0]
        )
    } else {
        format!(
            "Environment variables are not set: {}\n\
             \n\
             To fix this, either:\n\
             1. Set the environment variables\n\
             2. Replace the variables in the config file with actual values",
            unexpanded_vars.join(", ")
        )
    };

    Err(ConfigError::Validation(error_msg))
}

/// Validates a config and reports every violation at once.
///
/// The engine calls this before touching disk or network, so an invalid
/// config never starts any shard.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    if config.ttl.is_zero() {
        errors.push("ttl must be greater than 0".to_string());
    }

    if config.data_dir.as_os_str().is_empty() {
        errors.push("data_dir cannot be empty".to_string());
    }

    validate_serialization(&config.serialization, &mut errors);

    if config.endpoints.is_empty() {
        errors.push("at least one endpoint must be configured".to_string());
    }

    let mut names = HashSet::new();
    for (i, endpoint) in config.endpoints.iter().enumerate() {
        if !endpoint.name.is_empty() && !names.insert(endpoint.name.as_str()) {
            errors.push(format!(
                "endpoints[{}]: duplicate endpoint name '{}'",
                i, endpoint.name
            ));
        }
        validate_endpoint(i, endpoint, &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}

fn validate_serialization(serialization: &SerializationConfig, errors: &mut Vec<String>) {
    if serialization.max_signals_to_batch == 0 {
        errors.push("serialization.max_signals_to_batch must be greater than 0".to_string());
    }
    if serialization.batch_frequency.is_zero() {
        errors.push("serialization.batch_frequency must be greater than 0".to_string());
    }
    if serialization.buffer_limit == 0 {
        errors.push("serialization.buffer_limit must be greater than 0".to_string());
    }
    if serialization.segment_max_bytes == 0 {
        errors.push("serialization.segment_max_bytes must be greater than 0".to_string());
    }
}

fn endpoint_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("endpoint name pattern compiles"))
}

fn validate_endpoint(index: usize, endpoint: &EndpointConfig, errors: &mut Vec<String>) {
    let prefix = if endpoint.name.is_empty() {
        format!("endpoints[{}]", index)
    } else {
        format!("endpoint '{}'", endpoint.name)
    };

    if endpoint.name.is_empty() {
        errors.push(format!("{}: name cannot be empty", prefix));
    } else if !endpoint_name_pattern().is_match(&endpoint.name) {
        errors.push(format!(
            "{}: name may only contain letters, digits, '_' and '-'",
            prefix
        ));
    }

    if endpoint.url.is_empty() {
        errors.push(format!("{}: url cannot be empty", prefix));
    } else {
        match reqwest::Url::parse(&endpoint.url) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
            Ok(url) => errors.push(format!(
                "{}: unsupported url scheme '{}'",
                prefix,
                url.scheme()
            )),
            Err(e) => errors.push(format!("{}: invalid url '{}': {}", prefix, endpoint.url, e)),
        }
    }

    if endpoint.batch_count == 0 {
        errors.push(format!("{}: batch_count must be greater than 0", prefix));
    }

    if endpoint.flush_frequency < MIN_FLUSH_FREQUENCY {
        errors.push(format!(
            "{}: flush_frequency must be greater or equal to 1s, the internal timers resolution is 1s",
            prefix
        ));
    }

    if endpoint.queue_count == 0 {
        errors.push(format!("{}: queue_count must be greater than 0", prefix));
    }

    if endpoint.write_timeout.is_zero() {
        errors.push(format!("{}: write_timeout must be greater than 0", prefix));
    }

    for name in endpoint.external_labels.keys() {
        if !is_valid_label_name(name) {
            errors.push(format!(
                "{}: external label '{}' is not a valid label name",
                prefix, name
            ));
        }
    }
}
