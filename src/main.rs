//! # structlint CLI
//!
//! The `structlint` binary runs the analysis pipeline on local files, exposes
//! its intermediate stages for inspection, and starts the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! structlint --config ./config/structlint.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `structlint analyze <file>` | Full analysis; prints the JSON response |
//! | `structlint detect <file>` | Print the detected format |
//! | `structlint precheck <file>` | Print local parser hints as JSON |
//! | `structlint sample <file>` | Print the truncation map for the file |
//! | `structlint serve` | Start the HTTP server |
//! | `structlint cache stats` | Show cache counters |
//! | `structlint cache flush` | Remove all cached analyses |
//!
//! Logging goes to stderr and is controlled by `RUST_LOG` (default `info`).

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use structlint::config::{self, Config};
use structlint::detect::detect_file_type;
use structlint::models::{AnalyzeRequest, FileType};
use structlint::pipeline::{open_cache, Analyzer};
use structlint::precheck::run_precheck;
use structlint::sampler::truncate_content;
use structlint::server;

/// structlint: model-assisted defect analysis for JSON, CSV, XML and YAML.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. When the file does not exist, built-in defaults are used with an
/// in-memory cache.
#[derive(Parser)]
#[command(
    name = "structlint",
    about = "Model-assisted defect analysis for JSON, CSV, XML and YAML files",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/structlint.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze a file and print the JSON response.
    Analyze {
        file: PathBuf,

        /// `auto`, `json`, `csv`, `xml` or `yaml`.
        #[arg(long, default_value = "auto")]
        file_type: String,

        /// Maximum number of findings to report (1 to 1000).
        #[arg(long)]
        max_errors: Option<u32>,

        /// Use server-sent events when calling the model.
        #[arg(long)]
        stream: bool,

        /// Neither read nor write the result cache.
        #[arg(long)]
        no_cache: bool,

        /// Pretty-print the response.
        #[arg(long)]
        pretty: bool,
    },

    /// Print the detected format of a file.
    Detect { file: PathBuf },

    /// Run the strict local parser and print its hints.
    Precheck {
        file: PathBuf,

        #[arg(long, default_value = "auto")]
        file_type: String,
    },

    /// Show how a file would be sampled for the model.
    Sample { file: PathBuf },

    /// Start the HTTP server.
    Serve,

    /// Inspect or flush the result cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Print hit/miss counters for each store.
    Stats,
    /// Delete every cached analysis.
    Flush,
}

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();
}

/// Loads the config file, or defaults when it does not exist.
fn load_or_default(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        config::load_config(path)
    } else {
        log::debug!("{} not found; using defaults", path.display());
        Ok(Config::minimal())
    }
}

fn read_file(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn resolve_file_type(name: &str, content: &str) -> anyhow::Result<FileType> {
    if name.eq_ignore_ascii_case("auto") {
        return Ok(detect_file_type(content));
    }
    FileType::parse(name).ok_or_else(|| anyhow::anyhow!("unsupported file type: {}", name))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();
    let cfg = load_or_default(&cli.config)?;

    match cli.command {
        Commands::Analyze {
            file,
            file_type,
            max_errors,
            stream,
            no_cache,
            pretty,
        } => {
            let content = read_file(&file)?;
            let analyzer = Analyzer::from_config(cfg).await?;
            let request = AnalyzeRequest {
                content,
                file_type: Some(file_type),
                file_name: file.file_name().map(|n| n.to_string_lossy().into_owned()),
                max_errors,
                stream: stream.then_some(true),
            };
            let outcome = analyzer.analyze_with(request, !no_cache).await?;
            if pretty {
                println!("{}", serde_json::to_string_pretty(&outcome.response)?);
            } else {
                println!("{}", outcome.body);
            }
        }
        Commands::Detect { file } => {
            let content = read_file(&file)?;
            println!("{}", detect_file_type(&content));
        }
        Commands::Precheck { file, file_type } => {
            let content = read_file(&file)?;
            let ft = resolve_file_type(&file_type, &content)?;
            let hints = run_precheck(&content, ft);
            println!("{}", serde_json::to_string_pretty(&hints)?);
        }
        Commands::Sample { file } => {
            let content = read_file(&file)?;
            let ft = detect_file_type(&content);
            let hints = run_precheck(&content, ft);
            let sampled = truncate_content(&content, &hints, &cfg.sampling.sampler());
            let report = serde_json::json!({
                "file_type": ft,
                "truncation_map": sampled.map,
                "note": sampled.note,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Cache { action } => {
            let cache = open_cache(&cfg, &cfg.analysis.rag_version).await;
            match action {
                CacheAction::Stats => {
                    let stats = cache.stats(cfg.cache.enabled).await;
                    println!("{}", serde_json::to_string_pretty(&stats)?);
                }
                CacheAction::Flush => {
                    let removed = cache.flush().await?;
                    println!("Flushed {} cached analyses.", removed);
                }
            }
        }
    }

    Ok(())
}
