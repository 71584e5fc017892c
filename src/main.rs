use clap::{Parser, Subcommand};
use simple_assets::process::{self, PipelineInput};
use simple_assets::{config, logging, output};
use std::path::PathBuf;

/// Shared flags for commands that take inputs.
#[derive(clap::Args, Clone)]
struct InputArgs {
    /// Documents, images, URLs or directories to process
    #[arg(required = true)]
    inputs: Vec<String>,
}

fn version_string() -> &'static str {
    let on_tag = env!("ON_RELEASE_TAG");
    if on_tag == "true" {
        env!("CARGO_PKG_VERSION")
    } else {
        let hash = env!("GIT_HASH");
        if hash.is_empty() {
            "dev@unknown"
        } else {
            // Leaked once at startup, called exactly once
            Box::leak(format!("dev@{hash}").into_boxed_str())
        }
    }
}

#[derive(Parser)]
#[command(name = "simple-assets")]
#[command(about = "Responsive image pipeline for documentation sites")]
#[command(long_about = "\
Responsive image pipeline for documentation sites

Follows the references of Markdown documents, then writes every referenced
image in up to seven widths and three formats, plus a tiny blurred
placeholder. Unchanged images are skipped on later runs.

Output files:

  processed/
  ├── 1f3a…-micro.avif       # {identity hash}-{tier}.{format}
  ├── 1f3a…-xs.webp
  ├── 1f3a…-xxl.jpg          # .png for images with transparency
  ├── 1f3a…-blur.jpg         # 32px placeholder
  ├── manifest.json          # Variants per source, for site templates
  └── .asset-cache.json      # Cache state (safe to delete)

Directories passed as inputs are searched for Markdown documents.

Run 'simple-assets gen-config' to generate a documented config.toml.")]
#[command(version = version_string())]
struct Cli {
    /// Output directory
    #[arg(long, default_value = "processed", global = true)]
    output: PathBuf,

    /// Directory containing config.toml
    #[arg(long, default_value = ".", global = true)]
    config_dir: PathBuf,

    /// Log cache decisions and timings to stderr
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the dependency tree of each input without processing
    Plan(InputArgs),
    /// Generate image variants for all inputs
    Process {
        #[command(flatten)]
        inputs: InputArgs,

        /// Ignore the cache and regenerate everything
        #[arg(long)]
        no_cache: bool,

        /// Override processing.max_concurrency
        #[arg(long)]
        max_concurrency: Option<usize>,
    },
    /// Forget cached state so the next run regenerates these images
    Invalidate(InputArgs),
    /// Print a stock config.toml with all options documented
    GenConfig,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose)?;

    match cli.command {
        Command::Plan(args) => {
            let config = config::load_config(&cli.config_dir)?;
            let pipeline = process::build_pipeline(&config, &cli.output, true)?;
            let inputs = collect_inputs(&args.inputs, &config);
            let mut failed = false;
            for (root, plan) in pipeline.plan(&inputs) {
                if let Err(e) = &plan {
                    failed |= e.is_structural();
                }
                output::print_plan(&root, &plan);
            }
            if failed {
                std::process::exit(1);
            }
        }
        Command::Process {
            inputs,
            no_cache,
            max_concurrency,
        } => {
            let mut config = config::load_config(&cli.config_dir)?;
            if max_concurrency.is_some() {
                config.processing.max_concurrency = max_concurrency;
            }
            let pipeline = process::build_pipeline(&config, &cli.output, !no_cache)?;
            let inputs = collect_inputs(&inputs.inputs, &config);

            let (tx, rx) = std::sync::mpsc::channel();
            let printer = std::thread::spawn(move || {
                for event in rx {
                    for line in output::format_event(&event) {
                        println!("{}", line);
                    }
                }
            });
            let report = pipeline.process(&inputs, Some(&tx));
            drop(tx);
            printer
                .join()
                .map_err(|_| "output thread panicked".to_string())?;

            process::write_manifest(&report, &cli.output)?;
            output::print_summary(&report);
            if !report.exit_ok() {
                std::process::exit(1);
            }
        }
        Command::Invalidate(args) => {
            let config = config::load_config(&cli.config_dir)?;
            let pipeline = process::build_pipeline(&config, &cli.output, true)?;
            for input in collect_inputs(&args.inputs, &config) {
                let id = input.identifier();
                if pipeline.invalidate(id)? {
                    println!("{id}: invalidated");
                } else {
                    println!("{id}: not cached");
                }
            }
        }
        Command::GenConfig => {
            print!("{}", config::stock_config_toml());
        }
    }

    Ok(())
}

/// Expand command-line arguments into pipeline inputs.
fn collect_inputs(raw: &[String], config: &config::PipelineConfig) -> Vec<PipelineInput> {
    raw.iter()
        .flat_map(|arg| process::discover_inputs(arg, &config.breakpoints))
        .collect()
}
