//! Batched Asynchronous Image Classification
//!
//! Classifies a set of images as one batch on an OpenVINO device (or the
//! built-in REFERENCE device), running the batch through a chain of
//! asynchronous inference requests.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use dlaclassify::config::Config;
use dlaclassify::engine::{backend_for_device, labels::load_labels, memcpy};
use dlaclassify::service::ClassificationPipeline;
use dlaclassify::utils::image::{expand_inputs, FileDecoder};

#[derive(Parser, Debug)]
#[command(author, version, about = "Batched asynchronous image classification")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = Config::default_path())]
    config: PathBuf,

    /// Image files or folders of images
    #[arg(short = 'i', long = "input", required = true, num_args = 1..)]
    inputs: Vec<PathBuf>,

    /// Model .xml file
    #[arg(short = 'm', long)]
    model: Option<PathBuf>,

    /// Target device (CPU, GPU, HETERO:FPGA,CPU, REFERENCE, ...)
    #[arg(short = 'd', long)]
    device: Option<String>,

    /// Custom plugins xml file
    #[arg(long)]
    plugins: Option<PathBuf>,

    /// Architecture .arch file
    #[arg(long)]
    arch_file: Option<PathBuf>,

    #[arg(long)]
    labels: Option<PathBuf>,

    /// Number of asynchronous executions of the batch
    #[arg(long)]
    iterations: Option<usize>,

    #[arg(long)]
    top_k: Option<usize>,
}

impl Cli {
    /// Command-line values take precedence over the config file
    fn apply(&self, config: &mut Config) {
        if let Some(model) = &self.model {
            config.models.model = model.clone();
        }
        if let Some(device) = &self.device {
            config.inference.device = device.clone();
        }
        if let Some(plugins) = &self.plugins {
            config.models.plugins = Some(plugins.clone());
        }
        if let Some(arch) = &self.arch_file {
            config.models.arch_file = Some(arch.clone());
        }
        if let Some(labels) = &self.labels {
            config.models.labels = Some(labels.clone());
        }
        if let Some(iterations) = self.iterations {
            config.inference.iterations = iterations;
        }
        if let Some(top_k) = self.top_k {
            config.inference.top_k = top_k;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    info!("dlaclassify v{}", env!("CARGO_PKG_VERSION"));

    let cli = Cli::parse();
    let mut config = Config::load(&cli.config).unwrap_or_else(|e| {
        info!("Using default config ({})", e);
        Config::default()
    });
    cli.apply(&mut config);
    config.validate()?;

    if !memcpy::install(config.copy.strategy.clone()) {
        info!("Bulk copy already initialized, keeping its strategy");
    }

    let image_paths = expand_inputs(&cli.inputs).context("Failed to list input images")?;
    if image_paths.is_empty() {
        bail!("No suitable images were found");
    }

    let labels = load_labels(&config.labels_path())?;
    let backend = backend_for_device(&config.inference.device, &config.backend_options())?;
    info!("Device: {}", backend.name());
    let model = backend.read_model(&config.models.model)?;

    let pipeline = ClassificationPipeline::new(
        FileDecoder::new(config.input.channel_order),
        config.inference.iterations,
        labels,
    );
    let top_k = config.inference.top_k;
    let task = tokio::task::spawn_blocking(move || {
        pipeline.run(&image_paths, model.as_ref(), top_k)
    });

    let results = match config.inference.timeout_secs {
        Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), task).await {
            Ok(joined) => joined?,
            Err(_) => {
                // the blocking run cannot be cancelled; leave without waiting on it
                error!("Classification did not finish within {}s", secs);
                std::process::exit(1);
            }
        },
        None => task.await?,
    }?;

    for result in &results {
        println!("{}", result);
    }
    info!("Classified {} images", results.len());

    Ok(())
}
