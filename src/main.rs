//! waifu2x CLI - upscale and denoise images.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use waifu2x::config::{ConvertOptions, Method, ModelDirectories, NoiseLevel, OutputFormat, Style};
use waifu2x::image::{is_list_file, list_images, load_list_file};
use waifu2x::model::{Device, ModelStore, Precision};
use waifu2x::pipeline::{
    convert_file, convert_files, BatchOptions, CancelFlag, Converter, TaskGroup,
    DEFAULT_QUEUE_CAPACITY,
};

/// Upscale and denoise images with tiled, batched inference.
#[derive(Parser, Debug)]
#[command(name = "waifu2x")]
#[command(version, about, long_about = None)]
struct Args {
    /// Model directory. Overrides --style.
    #[arg(long, value_name = "DIR")]
    model_dir: Option<PathBuf>,

    /// Noise level (0-3).
    #[arg(short, long, default_value = "0", value_parser = clap::value_parser!(u8).range(0..=3))]
    noise_level: u8,

    /// Conversion method: scale, noise, noise_scale, scale4x, noise_scale4x.
    #[arg(short, long, default_value = "noise_scale")]
    method: Method,

    /// Device ids. -1 for CPU.
    #[arg(short, long, num_args = 1.., default_values_t = [0], allow_negative_numbers = true)]
    gpu: Vec<i32>,

    /// Tiles per inference batch.
    #[arg(long, default_value = "4", value_name = "INT")]
    batch_size: usize,

    /// Tile size in source pixels.
    #[arg(long, default_value = "256", value_name = "INT")]
    tile_size: usize,

    /// Output file or directory.
    #[arg(short, long, value_name = "PATH")]
    output: PathBuf,

    /// Input file, directory, or list file (*.txt, *.csv).
    #[arg(short, long, value_name = "PATH")]
    input: PathBuf,

    /// Enable 8-way test-time augmentation.
    #[arg(long)]
    tta: bool,

    /// Run in full precision.
    #[arg(long)]
    disable_amp: bool,

    /// Bits per channel of the output (8 or 16).
    #[arg(long, value_name = "INT")]
    depth: Option<u8>,

    /// Output format for directory and list input.
    #[arg(short, long, default_value = "png", value_parser = parse_format)]
    format: OutputFormat,

    /// Style for the default model: art, art_scan (scan), photo.
    #[arg(long, default_value = "art")]
    style: Style,

    /// Convert the output to grayscale.
    #[arg(long)]
    grayscale: bool,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,
}

fn parse_format(value: &str) -> waifu2x::Result<OutputFormat> {
    OutputFormat::from_extension(value)
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("waifu2x={log_level}").into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

/// Returns whether every file converted.
fn run(args: &Args) -> Result<bool> {
    if !args.input.exists() {
        anyhow::bail!("Input does not exist: {}", args.input.display());
    }

    let options = ConvertOptions {
        method: args.method,
        noise_level: NoiseLevel::new(args.noise_level)?,
        tile_size: args.tile_size,
        batch_size: args.batch_size,
        tta: args.tta,
        precision: if args.disable_amp {
            Precision::Full
        } else {
            Precision::Reduced
        },
    };
    options.validate()?;

    let batch = BatchOptions {
        output_dir: args.output.clone(),
        format: args.format,
        depth: args.depth,
        grayscale: args.grayscale,
        queue_capacity: DEFAULT_QUEUE_CAPACITY,
        workers: TaskGroup::default_threads(),
        progress: true,
    };
    batch.validate()?;

    let single = !args.input.is_dir() && !is_list_file(&args.input);
    if single {
        // Reject a bad output extension before loading any model.
        OutputFormat::from_path(&args.output)?;
    }

    let model_dir = ModelDirectories::default().resolve(args.model_dir.as_deref(), args.style)?;
    let devices: Vec<Device> = args.gpu.iter().copied().map(Device::from_id).collect();
    let cancel = CancelFlag::new();
    let converter = Converter::new(&ModelStore::new(&model_dir), &devices, options)
        .with_context(|| format!("Failed to load models from {}", model_dir.display()))?
        .with_cancel(cancel.clone());
    watch_interrupt(cancel.clone())?;

    if single {
        convert_file(&converter, &args.input, &args.output, &batch)
            .with_context(|| format!("Failed to convert {}", args.input.display()))?;
        return Ok(true);
    }

    let inputs = collect_inputs(&args.input)?;
    tracing::info!("{} input file(s)", inputs.len());

    let report = convert_files(&converter, inputs, &batch, &cancel)?;

    for failure in &report.failures {
        tracing::error!("{}: {}", failure.path.display(), failure.error);
    }
    tracing::info!(
        "Done: {} converted, {} failed",
        report.converted.len(),
        report.failures.len()
    );
    Ok(report.is_success())
}

fn collect_inputs(input: &Path) -> Result<Vec<PathBuf>> {
    if input.is_dir() {
        list_images(input).with_context(|| format!("Failed to list {}", input.display()))
    } else {
        load_list_file(input).with_context(|| format!("Failed to read {}", input.display()))
    }
}

/// Set `cancel` on the first Ctrl-C; exit immediately on the second.
fn watch_interrupt(cancel: CancelFlag) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start signal runtime")?;

    std::thread::Builder::new()
        .name("interrupt".to_string())
        .spawn(move || {
            runtime.block_on(async {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    tracing::warn!("Cannot listen for Ctrl-C: {err}");
                    return;
                }
                tracing::warn!("Received Ctrl-C, stopping after outstanding writes");
                cancel.cancel();

                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Received second Ctrl-C, exiting");
                    std::process::exit(130);
                }
            });
        })
        .context("Failed to start interrupt thread")?;
    Ok(())
}
