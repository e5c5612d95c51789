use clap::Parser;
use config::{Config, ConfigError, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub connection_string: String,
    pub pool_size: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    pub backend: String, // "remote" or "ollama"
    pub model: String,
    pub api_key: Option<String>,
    pub api_url: Option<String>,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    // SQL generation wants near-deterministic output; summaries read better
    // with a little variety. Two call sites, two settings.
    pub sql_temperature: f32,
    pub sql_max_tokens: usize,
    pub summary_temperature: f32,
    pub summary_max_tokens: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Tables the pipeline may see and reference. Empty means every table
    /// in the store's `main` schema.
    pub allowed_tables: Vec<String>,
    pub row_cap: usize,
    pub query_timeout_secs: u64,
    pub schema_ttl_secs: u64,
    pub cache_ttl_secs: u64,
    pub prompt_char_budget: usize,
    pub summary_sample_rows: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub web: WebConfig,
    pub llm: LlmConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to
    #[arg(short, long)]
    pub port: Option<u16>,
}

impl AppConfig {
    pub fn new(args: &CliArgs) -> Result<Self, ConfigError> {
        let mut config_builder = Config::builder();
        let mut found_file = args.config.is_some();

        // Add configuration from file if specified
        if let Some(config_path) = &args.config {
            config_builder = config_builder.add_source(File::from(config_path.as_path()));
        } else {
            // Check for config in default locations
            let default_locations = vec![
                "config.toml",
                "config/config.toml",
                "/etc/flowlens/config.toml",
            ];

            for location in default_locations {
                if Path::new(location).exists() {
                    config_builder =
                        config_builder.add_source(File::new(location, config::FileFormat::Toml));
                    found_file = true;
                    break;
                }
            }
        }

        // No file anywhere: run on defaults so a bare `flowlens` still starts
        let mut config: AppConfig = if found_file {
            config_builder.build()?.try_deserialize()?
        } else {
            AppConfig::default()
        };

        // Override with command line args if provided
        if let Some(host) = &args.host {
            config.web.host = host.clone();
        }
        if let Some(port) = args.port {
            config.web.port = port;
        }

        Ok(config)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                connection_string: "analytics.duckdb".to_string(),
                pool_size: 5,
            },
            web: WebConfig {
                host: "127.0.0.1".to_string(),
                port: 3000,
            },
            llm: LlmConfig {
                backend: "ollama".to_string(),
                model: "sqlcoder".to_string(),
                api_key: None,
                api_url: None,
                request_timeout_secs: 30,
                max_retries: 3,
                retry_backoff_ms: 250,
                sql_temperature: 0.1,
                sql_max_tokens: 1024,
                summary_temperature: 0.6,
                summary_max_tokens: 512,
            },
            pipeline: PipelineConfig {
                allowed_tables: Vec::new(),
                row_cap: 500,
                query_timeout_secs: 30,
                schema_ttl_secs: 300,
                cache_ttl_secs: 600,
                prompt_char_budget: 6000,
                summary_sample_rows: 20,
            },
        }
    }
}
