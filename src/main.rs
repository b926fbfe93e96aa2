//! # inox CLI Entry Point
//!
//! Parses arguments with clap, merges them over `inox.toml` and hands an
//! explicit build context to the engine.
//!
//! ## Command Structure
//!
//! - `compile` - build a sketch for a board
//! - `cache` - inspect and prune the shared core cache

use anyhow::{Context as _, Result};
use clap::{Args, Parser, Subcommand};
use colored::*;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use inox::BuildError;
use inox::build::{Context, FeedbackAnalyzer};
use inox::builder;
use inox::cache::{self, BuildCache};
use inox::config::{InoxConfig, load_config};

#[derive(Parser)]
#[command(name = "inox")]
#[command(about = "Build Arduino sketches from platform recipes", version = env!("CARGO_PKG_VERSION"))]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a sketch
    Compile(CompileArgs),
    /// Manage the shared core cache
    Cache {
        /// Cache folder [default: user cache dir]
        #[arg(long, global = true)]
        build_cache_path: Option<PathBuf>,
        #[command(subcommand)]
        op: CacheOp,
    },
}

#[derive(Args)]
struct CompileArgs {
    /// Sketch folder or main sketch file
    #[arg(default_value = ".")]
    sketch: PathBuf,
    /// Fully qualified board name, e.g. arduino:avr:uno
    #[arg(short = 'b', long)]
    fqbn: Option<String>,
    /// Folder for build artifacts [default: a temp folder per sketch]
    #[arg(long)]
    build_path: Option<PathBuf>,
    /// Folder of the shared core cache
    #[arg(long)]
    build_cache_path: Option<PathBuf>,
    /// Always compile the core in the build folder
    #[arg(long)]
    no_core_cache: bool,
    /// Hardware folders (repeatable)
    #[arg(long = "hardware")]
    hardware: Vec<PathBuf>,
    /// Tool folders (repeatable)
    #[arg(long = "tools")]
    tools: Vec<PathBuf>,
    /// User library folders (repeatable)
    #[arg(long = "libraries")]
    libraries: Vec<PathBuf>,
    /// Built-in library folders (repeatable)
    #[arg(long = "builtin-libraries")]
    builtin_libraries: Vec<PathBuf>,
    /// Parallel compile jobs [default: CPU count]
    #[arg(short, long)]
    jobs: Option<usize>,
    /// Compiler warnings level (none, default, more, all)
    #[arg(long)]
    warnings: Option<String>,
    /// Override a build property, key=value (repeatable)
    #[arg(long = "build-property")]
    build_properties: Vec<String>,
    /// Show every command and decision
    #[arg(short, long)]
    verbose: bool,
    /// Only write compile_commands.json, without compiling
    #[arg(long)]
    only_compilation_database: bool,
    /// Kill any tool running longer than this
    #[arg(long)]
    timeout_secs: Option<u64>,
    /// Configuration file [default: ./inox.toml]
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum CacheOp {
    /// Print cache directory path
    Path,
    /// List cached cores
    List,
    /// Remove every cached core
    Clean,
    /// Remove cores not used recently
    Purge {
        /// Maximum age in days since last use
        #[arg(long, default_value_t = 30)]
        max_age_days: u64,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Compile(args) => compile(args),
        Commands::Cache { build_cache_path, op } => run_cache(build_cache_path, op),
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", "x".red(), e);
        if let Some(hint) = failure_hint(&e) {
            eprintln!("\n{} {}", "💡".yellow(), hint);
        }
        std::process::exit(1);
    }
}

fn failure_hint(e: &anyhow::Error) -> Option<String> {
    e.chain().find_map(|cause| match cause.downcast_ref::<BuildError>() {
        Some(BuildError::ToolFailed { stderr, .. }) => FeedbackAnalyzer::analyze(stderr),
        _ => None,
    })
}

fn cache_root(explicit: Option<PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(dir) => Ok(dir),
        None => cache::default_cache_dir(),
    }
}

fn run_cache(build_cache_path: Option<PathBuf>, op: CacheOp) -> Result<()> {
    let cache = BuildCache::new(cache_root(build_cache_path)?);
    match op {
        CacheOp::Path => {
            cache::print_path(&cache);
            Ok(())
        }
        CacheOp::List => cache::list(&cache),
        CacheOp::Clean => cache::clean(&cache),
        CacheOp::Purge { max_age_days } => cache::purge(&cache, max_age_days),
    }
}

/// `<temp>/inox-sketch-<hash of the sketch path>`, stable across runs.
fn default_build_path(sketch: &Path) -> PathBuf {
    let sketch = std::path::absolute(sketch).unwrap_or_else(|_| sketch.to_path_buf());
    let digest = Sha256::digest(sketch.to_string_lossy().as_bytes());
    let hash: String = digest[..8].iter().map(|b| format!("{b:02X}")).collect();
    std::env::temp_dir().join(format!("inox-sketch-{hash}"))
}

fn merged_list(cli: Vec<PathBuf>, config: &[PathBuf]) -> Vec<PathBuf> {
    if cli.is_empty() { config.to_vec() } else { cli }
}

fn build_context(args: CompileArgs, config: InoxConfig) -> Result<Context> {
    let fqbn = args
        .fqbn
        .or(config.build.fqbn)
        .context("No board selected, pass --fqbn or set build.fqbn in inox.toml")?;
    let build_path = args
        .build_path
        .unwrap_or_else(|| default_build_path(&args.sketch));

    let mut ctx = Context::new(&args.sketch, fqbn, build_path);
    ctx.hardware_dirs = merged_list(args.hardware, &config.directories.hardware);
    ctx.tools_dirs = merged_list(args.tools, &config.directories.tools);
    ctx.other_libraries_dirs = merged_list(args.libraries, &config.directories.libraries);
    ctx.builtin_libraries_dirs = merged_list(args.builtin_libraries, &config.directories.builtin_libraries);
    ctx.core_cache_path = if args.no_core_cache {
        None
    } else {
        Some(cache_root(args.build_cache_path.or(config.directories.cache))?)
    };

    let mut properties = config.build.properties;
    properties.extend(args.build_properties);
    ctx.custom_build_properties = properties;
    ctx.jobs = args.jobs.or(config.build.jobs).unwrap_or(0);
    ctx.warnings_level = args.warnings.or(config.build.warnings).unwrap_or_default();
    ctx.verbose = args.verbose || config.build.verbose;
    ctx.progress = !ctx.verbose && console::Term::stdout().is_term();
    ctx.only_update_compilation_database = args.only_compilation_database;
    ctx.recipe_timeout = args.timeout_secs.or(config.build.timeout_secs).map(Duration::from_secs);
    Ok(ctx)
}

fn compile(args: CompileArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let mut ctx = build_context(args, config)?;

    println!(
        "{} Compiling {} for {}",
        "🔨".blue(),
        ctx.sketch_location.display().to_string().bold(),
        ctx.fqbn.cyan()
    );
    builder::compile(&mut ctx)?;

    if ctx.only_update_compilation_database {
        println!(
            "{} Compilation database written to {}",
            "✓".green(),
            ctx.build_path.join("compile_commands.json").display()
        );
    } else {
        println!("{} Build finished in {}", "✓".green(), ctx.build_path.display());
    }
    Ok(())
}
