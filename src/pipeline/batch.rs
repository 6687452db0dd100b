//! Directory/list conversion: load, convert and write many files.
//!
//! ```text
//! loader thread --[bounded queue]--> convert (this thread) --> writer pool
//! ```
//!
//! Loading overlaps with inference through the queue; encoding and writing
//! overlap with the next image's inference through the worker pool.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};

use crate::config::OutputFormat;
use crate::error::{Error, Result};
use crate::image::{
    load_image, output_filename, save_image, ImageMeta, ImageTensor, LoadedImage,
};

use super::convert::Converter;
use super::queue::{CancelFlag, LoadQueue};
use super::tasks::{TaskGroup, TaskId};

/// Default number of decoded images waiting for inference.
pub const DEFAULT_QUEUE_CAPACITY: usize = 128;

/// Output and scheduling settings for a run.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Directory receiving converted files.
    pub output_dir: PathBuf,
    pub format: OutputFormat,
    /// Bits per channel of the output; the source depth when `None`.
    pub depth: Option<u8>,
    pub grayscale: bool,
    pub queue_capacity: usize,
    /// Encode/write threads. Up to twice as many converted images wait for
    /// a writer before inference pauses.
    pub workers: usize,
    /// Draw a progress bar on stderr.
    pub progress: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            format: OutputFormat::default(),
            depth: None,
            grayscale: false,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            workers: TaskGroup::default_threads(),
            progress: false,
        }
    }
}

impl BatchOptions {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error for an unsupported depth or a zero queue
    /// capacity or worker count.
    pub fn validate(&self) -> Result<()> {
        if let Some(depth) = self.depth {
            if depth != 8 && depth != 16 {
                return Err(Error::config(format!(
                    "unsupported depth {depth}: expected 8 or 16"
                )));
            }
        }
        if self.queue_capacity == 0 {
            return Err(Error::config("queue capacity must be at least 1"));
        }
        if self.workers == 0 {
            return Err(Error::config("at least one worker is required"));
        }
        Ok(())
    }

    fn output_meta(&self, source: &ImageMeta) -> ImageMeta {
        ImageMeta {
            depth: self.depth.unwrap_or(source.depth),
            grayscale: self.grayscale,
            ..source.clone()
        }
    }
}

/// A file that could not be converted.
#[derive(Debug)]
pub struct FileFailure {
    /// Input file.
    pub path: PathBuf,
    pub error: Error,
}

/// Outcome of [`convert_files`].
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Files written, in input order.
    pub converted: Vec<PathBuf>,
    /// Inputs that failed, in input order.
    pub failures: Vec<FileFailure>,
    /// Highest load queue occupancy seen.
    pub peak_queue: usize,
}

impl BatchReport {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Convert one file, writing `output` in the format its extension names.
///
/// # Errors
///
/// Returns the first error: an unrecognized output extension before any
/// work, then any load, conversion or write error.
pub fn convert_file(
    converter: &Converter,
    input: &Path,
    output: &Path,
    options: &BatchOptions,
) -> Result<()> {
    let format = OutputFormat::from_path(output)?;
    options.validate()?;

    let image = load_image(input)?;
    let (width, height) = image.dimensions();
    tracing::info!("Converting {} ({width}x{height})", input.display());

    let (rgb, alpha, meta) = convert_loaded(converter, &image, options)?;

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    save_image(&rgb, alpha.as_ref(), output, &meta, format)?;
    tracing::info!("Saved {}", output.display());
    Ok(())
}

/// Convert many files into `options.output_dir`.
///
/// Failures are local to their file and collected in the report. Once
/// `cancel` is set no further image is loaded or converted, writes already
/// submitted finish, and the remaining inputs are reported as `Cancelled`.
/// Give the converter the same flag ([`Converter::with_cancel`]) to also
/// stop the image in progress.
///
/// # Errors
///
/// Returns an error for problems that prevent the run from starting
/// (invalid options, an uncreatable output directory, thread start-up), and
/// for a conversion error that no later file could avoid, such as a missing
/// model. Writes already submitted finish first.
pub fn convert_files(
    converter: &Converter,
    inputs: Vec<PathBuf>,
    options: &BatchOptions,
    cancel: &CancelFlag,
) -> Result<BatchReport> {
    options.validate()?;
    fs::create_dir_all(&options.output_dir)?;

    let progress = progress_bar(inputs.len(), options.progress);
    let mut tasks = TaskGroup::new(options.workers)?;
    let mut sources: HashMap<TaskId, (usize, PathBuf)> = HashMap::new();
    let mut seen = HashSet::new();
    let mut failures = Vec::new();
    let mut fatal = None;

    let all_inputs = inputs.clone();
    let mut queue = LoadQueue::spawn(inputs, options.queue_capacity, cancel.clone(), |path| {
        load_image(path)
    })?;

    for job in queue.by_ref() {
        if cancel.is_cancelled() {
            tracing::warn!("Interrupted; waiting for outstanding writes");
            break;
        }
        seen.insert(job.index);
        progress.set_message(file_label(&job.path));

        let output = options
            .output_dir
            .join(output_filename(&job.path, options.format));
        match job
            .value
            .and_then(|image| convert_loaded(converter, &image, options))
        {
            Ok((rgb, alpha, meta)) => {
                let format = options.format;
                let target = output.clone();
                let id = tasks.spawn(output, move || {
                    save_image(&rgb, alpha.as_ref(), &target, &meta, format)
                });
                sources.insert(id, (job.index, job.path));
            }
            Err(error) if error.is_fatal_for_run() => {
                tracing::error!("Stopping run at {}: {error}", job.path.display());
                fatal = Some(error);
                break;
            }
            Err(error) => {
                tracing::warn!("Failed to convert {}: {error}", job.path.display());
                failures.push((
                    job.index,
                    FileFailure {
                        path: job.path,
                        error,
                    },
                ));
            }
        }
        progress.inc(1);
    }

    let stats = queue.finish()?;
    let outcomes = tasks.join();
    if let Some(error) = fatal {
        progress.finish_and_clear();
        return Err(error);
    }

    let mut converted = Vec::new();
    for outcome in outcomes {
        match outcome.result {
            Ok(()) => converted.push(outcome.path),
            Err(error) => {
                tracing::warn!("Failed to write {}: {error}", outcome.path.display());
                let (index, path) = sources
                    .remove(&outcome.id)
                    .unwrap_or((usize::MAX, outcome.path));
                failures.push((index, FileFailure { path, error }));
            }
        }
    }

    for (index, path) in all_inputs.into_iter().enumerate() {
        if !seen.contains(&index) {
            failures.push((
                index,
                FileFailure {
                    path,
                    error: Error::Cancelled,
                },
            ));
        }
    }
    progress.finish_and_clear();
    failures.sort_by_key(|(index, _)| *index);

    tracing::info!(
        "Converted {} file(s), {} failed, queue peak {}/{}",
        converted.len(),
        failures.len(),
        stats.peak(),
        stats.capacity()
    );
    Ok(BatchReport {
        converted,
        failures: failures.into_iter().map(|(_, failure)| failure).collect(),
        peak_queue: stats.peak(),
    })
}

type ConvertedPlanes = (ImageTensor, Option<ImageTensor>, ImageMeta);

fn convert_loaded(
    converter: &Converter,
    image: &LoadedImage,
    options: &BatchOptions,
) -> Result<ConvertedPlanes> {
    let converted = converter.convert(image.rgb.view(), image.alpha.as_ref().map(|a| a.view()))?;
    Ok((converted.rgb, converted.alpha, options.output_meta(&image.meta)))
}

fn progress_bar(len: usize, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(u64::try_from(len).unwrap_or(u64::MAX));
    if let Ok(style) =
        ProgressStyle::default_bar().template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
    {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned())
}
