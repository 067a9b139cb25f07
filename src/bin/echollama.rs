//! # EchoLlama CLI
//!
//! ```bash
//! echollama metadata model.gguf          # typed header entries
//! echollama metadata model.gguf --json   # same, as JSON
//! echollama config --file runtime.json   # effective configuration
//! echollama config --preset creative
//! ```

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use echollama::config::{presets, RuntimeConfig};
use echollama::metadata;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "echollama")]
#[command(author, version, about = "Inspect models and runtime configuration")]
#[command(propagate_version = true)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the metadata header of a GGUF model file
    #[command(alias = "info")]
    Metadata {
        /// Model file
        file: PathBuf,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective runtime configuration
    Config {
        /// JSON configuration file
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Start from a preset instead of the defaults
        #[arg(short, long, value_enum)]
        preset: Option<Preset>,

        /// Ignore ECHOLLAMA_* environment variables
        #[arg(long)]
        no_env: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Preset {
    Chat,
    Precise,
    Creative,
    Vision,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Metadata { file, json } => show_metadata(&file, json)?,
        Commands::Config {
            file,
            preset,
            no_env,
        } => show_config(file, preset, no_env)?,
    }

    Ok(())
}

fn show_metadata(file: &Path, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let mut diagnostics = Vec::new();
    let metadata =
        metadata::parse_with_diagnostics(file, &mut |msg: &str| diagnostics.push(msg.to_string()));

    for line in &diagnostics {
        eprintln!("{}", line);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&metadata)?);
        return Ok(());
    }

    if metadata.is_empty() {
        return Err(format!("No metadata read from {}", file.display()).into());
    }

    println!("Model: {}", metadata.model_name());
    match metadata.max_context_length() {
        Some(n) => println!("Max context length: {}", n),
        None => println!("Max context length: not found"),
    }
    println!();

    let keys = metadata.sorted_keys();
    let width = keys.iter().map(|k| k.len()).max().unwrap_or(0);
    for key in keys {
        if let Some(value) = metadata.get(key) {
            println!("{:<width$}  {}", key, value, width = width);
        }
    }

    Ok(())
}

fn show_config(
    file: Option<PathBuf>,
    preset: Option<Preset>,
    no_env: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match preset {
        Some(Preset::Chat) => presets::chat(),
        Some(Preset::Precise) => presets::precise(),
        Some(Preset::Creative) => presets::creative(),
        Some(Preset::Vision) => presets::vision(),
        None => RuntimeConfig::default(),
    };

    if let Some(path) = file {
        config.merge(RuntimeConfig::from_json_file(&path)?);
    }
    if !no_env {
        config.apply_env()?;
    }

    println!("{}", serde_json::to_string_pretty(&config)?);
    if let Err(e) = config.validate() {
        eprintln!("warning: {}", e);
    }
    Ok(())
}
