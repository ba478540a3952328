//! Pipeline configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::color::OutputLayout;
use crate::error::ConfigError;

/// Default pixel volume above which the hybrid decoder is used.
pub const DEFAULT_HYBRID_HUFFMAN_THRESHOLD: u64 = 1000 * 1000;

/// Default cap on the pixel count a single sample may declare (16384 x 16384).
pub const DEFAULT_MAX_SAMPLE_PIXELS: u64 = 16384 * 16384;

/// Construction-time configuration of a batch decoder.
///
/// Every field has a default so partial JSON files are accepted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of samples per batch. Fixed for the lifetime of the pipeline.
    pub batch_size: usize,
    /// Host worker threads used for partial decode.
    pub num_threads: usize,
    /// Pin each host worker to its own core.
    pub pin_threads: bool,
    /// Images with more pixels than this are decoded by the hybrid decoder.
    pub hybrid_huffman_threshold: u64,
    /// Channel layout of the output tensor.
    pub output_layout: OutputLayout,
    /// Accelerator ordinal.
    pub device_id: u32,
    /// Extra bytes added whenever a pinned host staging buffer grows.
    pub host_memory_padding: usize,
    /// Extra bytes added whenever a device buffer grows.
    pub device_memory_padding: usize,
    /// Samples whose header declares more pixels than this fail the batch
    /// before any memory is sized for them.
    pub max_sample_pixels: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            num_threads: 4,
            pin_threads: false,
            hybrid_huffman_threshold: DEFAULT_HYBRID_HUFFMAN_THRESHOLD,
            output_layout: OutputLayout::Rgb,
            device_id: 0,
            host_memory_padding: 8 << 20,
            device_memory_padding: 16 << 20,
            max_sample_pixels: DEFAULT_MAX_SAMPLE_PIXELS,
        }
    }
}

impl PipelineConfig {
    pub fn new(batch_size: usize, num_threads: usize) -> Self {
        Self {
            batch_size,
            num_threads,
            ..Self::default()
        }
    }

    pub fn with_layout(mut self, layout: OutputLayout) -> Self {
        self.output_layout = layout;
        self
    }

    pub fn with_hybrid_threshold(mut self, pixels: u64) -> Self {
        self.hybrid_huffman_threshold = pixels;
        self
    }

    pub fn with_padding(mut self, host: usize, device: usize) -> Self {
        self.host_memory_padding = host;
        self.device_memory_padding = device;
        self
    }

    pub fn with_max_sample_pixels(mut self, pixels: u64) -> Self {
        self.max_sample_pixels = pixels;
        self
    }

    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_json_str(&text)
    }

    /// Reject values the pipeline cannot be built with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid {
                field: "batch_size",
                reason: "must be > 0".to_string(),
            });
        }
        if self.num_threads == 0 {
            return Err(ConfigError::Invalid {
                field: "num_threads",
                reason: "must be > 0".to_string(),
            });
        }
        if self.max_sample_pixels == 0 {
            return Err(ConfigError::Invalid {
                field: "max_sample_pixels",
                reason: "must be > 0".to_string(),
            });
        }
        Ok(())
    }

    /// Whether an image of `pixels` pixels goes to the hybrid decoder.
    pub fn prefers_hybrid(&self, pixels: u64) -> bool {
        pixels > self.hybrid_huffman_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_batch_rejected() {
        let err = PipelineConfig::new(0, 2).validate().unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn zero_threads_rejected() {
        let err = PipelineConfig::new(4, 0).validate().unwrap_err();
        assert!(err.to_string().contains("num_threads"));
    }

    #[test]
    fn zero_pixel_cap_rejected() {
        let err = PipelineConfig::default()
            .with_max_sample_pixels(0)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("max_sample_pixels"));
    }

    #[test]
    fn partial_json_uses_defaults() {
        let cfg = PipelineConfig::from_json_str(
            r#"{ "batch_size": 8, "output_layout": "bgr" }"#,
        )
        .unwrap();
        assert_eq!(cfg.batch_size, 8);
        assert_eq!(cfg.output_layout, OutputLayout::Bgr);
        assert_eq!(cfg.num_threads, PipelineConfig::default().num_threads);
        assert_eq!(cfg.hybrid_huffman_threshold, DEFAULT_HYBRID_HUFFMAN_THRESHOLD);
        assert_eq!(cfg.max_sample_pixels, DEFAULT_MAX_SAMPLE_PIXELS);
    }

    #[test]
    fn malformed_json_is_config_error() {
        assert!(matches!(
            PipelineConfig::from_json_str("{ batch_size: }"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn invalid_json_values_rejected() {
        assert!(PipelineConfig::from_json_str(r#"{ "num_threads": 0 }"#).is_err());
    }

    #[test]
    fn hybrid_threshold_is_strict() {
        let cfg = PipelineConfig::default().with_hybrid_threshold(100);
        assert!(!cfg.prefers_hybrid(100));
        assert!(cfg.prefers_hybrid(101));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = PipelineConfig::from_json_file("/definitely/not/here.json").unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.json"));
    }
}
