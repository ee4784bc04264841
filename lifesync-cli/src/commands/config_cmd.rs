use clap::{Args, Subcommand};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use super::OutputFormat;
use crate::config::Config;

#[derive(Args)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub command: ConfigSubcommand,
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Show current configuration values
    Show {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Initialize configuration file
    Init,
}

const DEFAULT_CONFIG: &str = r#"# lifesync configuration

# Directory for the local database (default: platform data dir)
# data_dir: ~/.local/share/lifesync

# User whose records this device reads and writes
owner: default

# sync:
#   server_url: "http://localhost:8080"
#   api_key: "<key from lifesync-admin>"
#   auto_sync: true
#   timeout_ms: 5000
#   dead_letter_after: 5
#   tombstone_grace_hours: 72
#   coalesce_updates: true
"#;

impl ConfigCommand {
    pub fn run(
        &self,
        config: &Config,
        cli_config_path: Option<PathBuf>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            ConfigSubcommand::Show { format } => {
                match format {
                    OutputFormat::Json => {
                        let mut value = serde_json::to_value(config)?;
                        // Never echo the key itself.
                        if let Some(key) = value.pointer_mut("/sync/api_key") {
                            if !key.is_null() {
                                *key = serde_json::Value::String("********".into());
                            }
                        }
                        println!("{}", serde_json::to_string_pretty(&value)?);
                    }
                    OutputFormat::Text => {
                        println!("Configuration");
                        println!("=============\n");

                        if let Some(path) = &config.config_file {
                            println!("Config file: {}", path.display());
                        } else {
                            println!(
                                "Config file: {} (not found)",
                                Config::default_config_path().display()
                            );
                        }
                        println!();

                        println!("data_dir: {}", config.data_dir.value.display());
                        println!("  source: {}", config.data_dir.source);
                        println!();

                        println!("owner: {}", config.owner.value);
                        println!("  source: {}", config.owner.source);
                        println!();

                        let sync = &config.sync;
                        println!("sync:");
                        println!(
                            "  server_url: {}",
                            sync.server_url.as_deref().unwrap_or("(not set)")
                        );
                        println!(
                            "  api_key: {}",
                            if sync.api_key.is_some() { "(set)" } else { "(not set)" }
                        );
                        println!("  auto_sync: {}", sync.auto_sync);
                        println!("  timeout_ms: {}", sync.timeout_ms);
                        println!("  max_attempts: {}", sync.max_attempts);
                        println!("  dead_letter_after: {}", sync.dead_letter_after);
                        println!("  tombstone_grace_hours: {}", sync.tombstone_grace_hours);
                        println!("  coalesce_updates: {}", sync.coalesce_updates);
                    }
                }
                Ok(())
            }

            ConfigSubcommand::Init => {
                let config_path = cli_config_path.unwrap_or_else(Config::default_config_path);

                if config_path.exists() {
                    println!("Config file already exists: {}", config_path.display());
                    println!("Use 'life config show' to view current configuration.");
                    return Ok(());
                }

                if let Some(parent) = config_path.parent() {
                    fs::create_dir_all(parent)?;
                }

                let mut file = fs::File::create(&config_path)?;
                file.write_all(DEFAULT_CONFIG.as_bytes())?;

                println!("Created config file: {}", config_path.display());
                println!("\nEdit this file to customize your settings.");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_init_writes_loadable_config() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("nested").join("config.yaml");

        let cmd = ConfigCommand {
            command: ConfigSubcommand::Init,
        };
        let config = Config::load(Some(path.clone())).unwrap();
        cmd.run(&config, Some(path.clone())).unwrap();
        assert!(path.exists());

        let loaded = Config::load(Some(path.clone())).unwrap();
        assert_eq!(loaded.config_file, Some(path));
        assert!(!loaded.sync.is_configured());
    }
}
