use clap::{Parser, Subcommand};
use cli::{BatchError, BatchOptions, BatchResponse, ImageReport, InputImage, process_batch};
use color_eyre::eyre::Result;
use morphometry::{Pipeline, PipelineConfig, synthetic::Scene};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{self, EnvFilter};

#[derive(Parser)]
#[command(author, version, about = "Measure coffee beans photographed next to a calibration marker", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Measure every bean in one or more photographs
    Process {
        /// Image files to analyse
        #[arg(required = true)]
        images: Vec<PathBuf>,
        /// Pipeline configuration (.toml or .json)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Images processed concurrently (defaults to the number of CPUs)
        #[arg(short, long)]
        jobs: Option<usize>,
        /// Per-image deadline in seconds
        #[arg(long, default_value = "60")]
        timeout_secs: u64,
        /// Write annotated and isolated views of each image here
        #[arg(long)]
        debug_dir: Option<PathBuf>,
        /// Pretty-print the JSON response
        #[arg(long)]
        pretty: bool,
    },
    /// Print the configuration JSON schema
    Schema,
    /// Write the default configuration as TOML
    InitConfig {
        /// Destination file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Render a synthetic scene with a marker and a few beans
    Demo {
        /// Destination image, e.g. demo.png
        #[arg(short, long)]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    // stdout carries the JSON response, logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Process {
            images,
            config,
            jobs,
            timeout_secs,
            debug_dir,
            pretty,
        } => {
            let mut options = BatchOptions {
                timeout: Duration::from_secs(timeout_secs),
                debug_dir,
                ..BatchOptions::default()
            };
            if let Some(jobs) = jobs {
                options.jobs = jobs;
            }
            process_images(&images, config.as_deref(), &options, pretty).await?;
        }
        Commands::Schema => {
            println!("{}", serde_json::to_string_pretty(&PipelineConfig::schema())?);
        }
        Commands::InitConfig { output } => {
            let toml = PipelineConfig::default().to_toml()?;
            match output {
                Some(path) => {
                    tokio::fs::write(&path, toml).await?;
                    info!("Wrote default configuration to {}", path.display());
                }
                None => print!("{toml}"),
            }
        }
        Commands::Demo { output } => {
            Scene::demo().render().save(&output)?;
            info!("Wrote demo scene to {}", output.display());
        }
    }

    Ok(())
}

async fn process_images(paths: &[PathBuf], config_path: Option<&Path>, options: &BatchOptions, pretty: bool) -> Result<()> {
    let config = match config_path {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::default(),
    };
    let pipeline = Arc::new(Pipeline::builder().with_config(config).build()?);

    if let Some(dir) = &options.debug_dir {
        tokio::fs::create_dir_all(dir).await?;
    }

    let mut inputs = Vec::with_capacity(paths.len());
    let mut unreadable = Vec::new();
    for path in paths {
        match InputImage::read(path).await {
            Ok(input) => inputs.push(input),
            Err(e) => {
                error!("Could not read {}: {}", path.display(), e);
                unreadable.push(ImageReport::from_outcome(
                    path.display().to_string(),
                    Err(BatchError::IoError(e)),
                ));
            }
        }
    }

    info!("Processing {} image(s) with {} worker(s)", inputs.len(), options.jobs);
    let batch = process_batch(pipeline, inputs, options).await;

    let mut reports = batch.images;
    reports.extend(unreadable);
    let response = BatchResponse::new(reports, batch.duplicates_skipped);

    println!("{}", response.to_json(pretty)?);
    Ok(())
}
