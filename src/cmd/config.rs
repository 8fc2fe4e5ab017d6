//! Configuration view and validation commands: `storyforge config`.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use storyforge::config::{CONFIG_FILE_NAME, StoryConfig, default_config_paths};

use super::super::{Cli, ConfigCommands};

/// File layer, then `STORYFORGE_*` environment overrides.
pub fn load_config(cli: &Cli) -> Result<StoryConfig> {
    let mut config = StoryConfig::load_or_default(cli.config.as_deref())?;
    config.apply_env();
    Ok(config)
}

fn config_path(cli: &Cli) -> Option<PathBuf> {
    cli.config
        .clone()
        .or_else(|| default_config_paths().into_iter().find(|p| p.exists()))
}

fn print_effective(config: &StoryConfig) -> Result<()> {
    let rendered = toml::to_string_pretty(config).context("Failed to render configuration")?;
    println!("{}", rendered.trim_end());
    Ok(())
}

pub fn cmd_config(cli: &Cli, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            match config_path(cli).filter(|p| p.exists()) {
                Some(path) => println!("# Config file: {}", path.display()),
                None => println!("# No {} found, showing defaults", CONFIG_FILE_NAME),
            }
            println!("# Effective values include STORYFORGE_* environment overrides");
            println!();
            let mut config = load_config(cli)?;
            // never echo a secret
            if config.provider.api_key.is_some() {
                config.provider.api_key = Some("<redacted>".to_string());
            }
            print_effective(&config)?;
        }
        Some(ConfigCommands::Validate) => {
            let config = load_config(cli)?;
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
        }
        Some(ConfigCommands::Init { force }) => {
            let path = cli
                .config
                .clone()
                .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
            init_config(&path, force)?;
        }
    }

    Ok(())
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        println!("{} already exists at {}", CONFIG_FILE_NAME, path.display());
        println!("Pass --force to overwrite it.");
        return Ok(());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    StoryConfig::default().save(path)?;

    println!("Created {}", path.display());
    println!();
    println!("You can now customize:");
    println!("  - [provider] model, base_url, api_key_env");
    println!("  - [compression] mode, threshold_chars, parallelism");
    println!("  - [phases.<phase>] per-phase model and sampling overrides");
    println!("  - [prompts] template overrides keyed by prompt name");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_init_writes_loadable_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE_NAME);
        init_config(&path, false).unwrap();

        let config = StoryConfig::load(&path).unwrap();
        assert_eq!(config.provider.model, StoryConfig::default().provider.model);
    }

    #[test]
    fn test_init_keeps_existing_file_without_force() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "[provider]\nmodel = \"mine\"\n").unwrap();

        init_config(&path, false).unwrap();
        assert_eq!(StoryConfig::load(&path).unwrap().provider.model, "mine");

        init_config(&path, true).unwrap();
        assert_ne!(StoryConfig::load(&path).unwrap().provider.model, "mine");
    }
}
