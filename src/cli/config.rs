use crate::config::{generate::generate_starter_config, load_config, system_config_path, user_config_path};
use std::fs;
use std::path::PathBuf;

pub fn init(stdout: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config_content = generate_starter_config();

    if stdout {
        print!("{}", config_content);
        return Ok(());
    }

    // ~/.config/remote-queue/config.yml unless the home directory is unusable
    let config_path = match user_config_path() {
        Some(user_config) => match user_config.parent().map(fs::create_dir_all) {
            Some(Err(e)) => {
                eprintln!("Warning: Could not create config directory: {}", e);
                eprintln!("Falling back to {}", system_config_path().display());
                system_config_path()
            }
            _ => user_config,
        },
        None => system_config_path(),
    };

    if config_path.exists() {
        return Err(format!(
            "Config file already exists at {}. Remove it first or use --stdout to print the config",
            config_path.display()
        )
        .into());
    }

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&config_path, config_content)?;

    println!("Config file written to {}", config_path.display());
    Ok(())
}

pub fn validate(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let path = config_path.ok_or("No config file found. Use --config to specify a path.")?;

    println!("Validating config file: {}", path.display());

    let config = load_config(&path)?;
    println!(
        "✓ Config is valid ({} endpoint{})",
        config.endpoints.len(),
        if config.endpoints.len() == 1 { "" } else { "s" }
    );
    for endpoint in &config.endpoints {
        println!(
            "  {} -> {} ({} shards)",
            endpoint.name, endpoint.url, endpoint.queue_count
        );
    }
    Ok(())
}
