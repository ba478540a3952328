//! pixelfeed
//!
//! Decodes image files in fixed-size batches through the pixelfeed pipeline
//! and reports throughput and per-path statistics. Stands in for the data
//! loader a training job would put in front of the pipeline.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use pf_common::{OutputLayout, PipelineConfig, Sample};
use pf_decoder::BatchDecoder;

/// Batch image decoder with host/device hybrid decode
#[derive(Parser, Debug)]
#[command(name = "pixelfeed")]
#[command(about = "Decode image files in fixed-size batches")]
#[command(version)]
struct Args {
    /// Image files or directories of images
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// JSON pipeline configuration; flags below override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Samples per batch
    #[arg(short, long)]
    batch_size: Option<usize>,

    /// Host worker threads
    #[arg(short, long)]
    threads: Option<usize>,

    /// Pixel count above which the hybrid decoder is used
    #[arg(long)]
    threshold: Option<u64>,

    /// Output layout (gray, rgb, bgr)
    #[arg(long)]
    layout: Option<OutputLayout>,

    /// Pin host workers to cores
    #[arg(long)]
    pin: bool,

    /// Drop the last batch instead of padding it with repeated samples
    #[arg(long)]
    drop_last: bool,

    /// Print the final summary as JSON
    #[arg(long)]
    json: bool,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn pipeline_config(&self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_json_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => PipelineConfig::default(),
        };
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(threads) = self.threads {
            config.num_threads = threads;
        }
        if let Some(threshold) = self.threshold {
            config.hybrid_huffman_threshold = threshold;
        }
        if let Some(layout) = self.layout {
            config.output_layout = layout;
        }
        if self.pin {
            config.pin_threads = true;
        }
        config.validate().context("Invalid pipeline configuration")?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let config = args.pipeline_config()?;
    let files = collect_inputs(&args.inputs)?;
    if files.is_empty() {
        bail!("No input files found");
    }
    info!(files = files.len(), batch_size = config.batch_size, "Collected inputs");

    let batch_size = config.batch_size;
    let mut decoder = BatchDecoder::new(config).context("Failed to create batch decoder")?;

    let started = Instant::now();
    let mut decoded_bytes = 0usize;
    let mut padded = 0usize;
    for (index, chunk) in files.chunks(batch_size).enumerate() {
        if chunk.len() < batch_size && args.drop_last {
            info!(dropped = chunk.len(), "Dropping incomplete last batch");
            break;
        }
        let mut samples = chunk
            .iter()
            .map(|path| load_sample(path))
            .collect::<Result<Vec<_>>>()?;
        padded += pad_batch(&mut samples, batch_size);

        let output = decoder
            .decode(&samples)
            .with_context(|| format!("Batch {index} failed"))?;
        decoded_bytes += output.byte_len();
        debug!(batch = index, bytes = output.byte_len(), shapes = ?output.shapes(), "Batch ready");
    }
    let elapsed = started.elapsed();

    let stats = decoder.stats();
    let images = stats.batches as usize * batch_size;
    let per_sec = images as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    if args.json {
        let report = serde_json::json!({
            "batches": stats.batches,
            "images": images,
            "padded": padded,
            "hybrid_decodes": stats.hybrid_decodes,
            "host_decodes": stats.host_decodes,
            "fallback_decodes": stats.fallback_decodes,
            "downgraded": stats.downgraded,
            "staging_reallocations": stats.staging_reallocations,
            "output_reallocations": stats.output_reallocations,
            "decoded_bytes": decoded_bytes,
            "elapsed_ms": elapsed.as_millis() as u64,
            "images_per_sec": per_sec,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("batches:          {}", stats.batches);
        println!("images:           {images} ({padded} padding)");
        println!("hybrid decodes:   {}", stats.hybrid_decodes);
        println!("host decodes:     {}", stats.host_decodes);
        println!("fallback decodes: {} ({} downgraded)", stats.fallback_decodes, stats.downgraded);
        println!(
            "reallocations:    {} staging, {} output",
            stats.staging_reallocations, stats.output_reallocations
        );
        println!("decoded:          {:.1} MiB", decoded_bytes as f64 / (1024.0 * 1024.0));
        println!("elapsed:          {:.2?} ({per_sec:.1} images/s)", elapsed);
    }
    Ok(())
}

/// Expand directories (non-recursive) into their files, sorted by path.
fn collect_inputs(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_dir() {
            let mut entries = std::fs::read_dir(input)
                .with_context(|| format!("Failed to read directory {}", input.display()))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| path.is_file())
                .collect::<Vec<_>>();
            entries.sort();
            files.extend(entries);
        } else if input.is_file() {
            files.push(input.clone());
        } else {
            warn!(path = %input.display(), "Skipping missing input");
        }
    }
    Ok(files)
}

fn load_sample(path: &Path) -> Result<Sample> {
    let data = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(Sample::new(path.display().to_string(), data))
}

/// Fill a short batch up to `batch_size` by repeating its own samples.
/// Returns how many were added.
fn pad_batch(samples: &mut Vec<Sample>, batch_size: usize) -> usize {
    let real = samples.len();
    if real == 0 {
        return 0;
    }
    for i in real..batch_size {
        let copy = samples[i % real].clone();
        samples.push(copy);
    }
    batch_size.saturating_sub(real)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() {
        let args = Args::parse_from(["pixelfeed", "--batch-size", "3", "--layout", "bgr", "--pin", "img"]);
        let config = args.pipeline_config().unwrap();
        assert_eq!(config.batch_size, 3);
        assert_eq!(config.output_layout, OutputLayout::Bgr);
        assert!(config.pin_threads);
        assert_eq!(config.num_threads, PipelineConfig::default().num_threads);
    }

    #[test]
    fn zero_threads_flag_rejected() {
        let args = Args::parse_from(["pixelfeed", "--threads", "0", "img"]);
        assert!(args.pipeline_config().is_err());
    }

    #[test]
    fn short_batch_is_padded_cyclically() {
        let mut samples = vec![Sample::new("a", vec![1]), Sample::new("b", vec![2])];
        assert_eq!(pad_batch(&mut samples, 5), 3);
        let ids: Vec<&str> = samples.iter().map(|s| s.source.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "a", "b", "a"]);
        assert_eq!(pad_batch(&mut samples, 5), 0);
    }
}
