use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    error::{ConfigError, Result},
    media::PixelFormat,
};

/// Lowest video bitrate the encoder may be initialised with (bits/s).
///
/// Down-cropped output encoded below this looks visibly degraded at common
/// delivery sizes.
pub const MIN_VIDEO_BITRATE: u64 = 2_500_000;

/// Output audio format
pub const AUDIO_SAMPLE_RATE: u32 = 44_100;
pub const AUDIO_CHANNELS: u16 = 2;
pub const AUDIO_BITRATE: u64 = 128_000;

/// Main configuration for the crop-transcoder
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Encoder tuning
    pub encoder: EncoderConfig,

    /// Decode format
    pub reader: ReaderConfig,

    /// Drain loop settings
    pub pipeline: PipelineConfig,

    /// Destination naming
    pub output: OutputConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::FileNotFound { path: path.display().to_string() })?;

        let config: Config = toml::from_str(&content)
            .map_err(|_| ConfigError::ParseFailed { path: path.display().to_string() })?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::InvalidValue {
                key: "config".to_string(),
                value: e.to_string()
            })?;

        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.encoder.validate()?;
        self.reader.validate()?;
        self.pipeline.validate()?;
        self.output.validate()?;
        Ok(())
    }
}

/// Video encoder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Target video bitrate in bits/s; never below `MIN_VIDEO_BITRATE`
    pub video_bitrate: u64,

    /// Encoder worker threads (0 lets the codec decide)
    pub threads: usize,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            video_bitrate: MIN_VIDEO_BITRATE,
            threads: num_cpus::get(),
        }
    }
}

impl EncoderConfig {
    fn validate(&self) -> Result<()> {
        if self.video_bitrate < MIN_VIDEO_BITRATE {
            return Err(ConfigError::InvalidValue {
                key: "encoder.video_bitrate".to_string(),
                value: self.video_bitrate.to_string()
            }.into());
        }
        Ok(())
    }
}

/// Fixed decode formats requested from read cursors
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// PCM sample rate audio is decoded to
    pub audio_sample_rate: u32,

    /// PCM channel count audio is decoded to
    pub audio_channels: u16,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            audio_sample_rate: AUDIO_SAMPLE_RATE,
            audio_channels: AUDIO_CHANNELS,
        }
    }
}

impl ReaderConfig {
    fn validate(&self) -> Result<()> {
        if self.audio_sample_rate == 0 {
            return Err(ConfigError::InvalidValue {
                key: "reader.audio_sample_rate".to_string(),
                value: self.audio_sample_rate.to_string()
            }.into());
        }

        if self.audio_channels == 0 {
            return Err(ConfigError::InvalidValue {
                key: "reader.audio_channels".to_string(),
                value: self.audio_channels.to_string()
            }.into());
        }

        Ok(())
    }
}

/// Drain loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Depth of the bounded channel between a read cursor and its leg
    pub channel_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { channel_capacity: 8 }
    }
}

impl PipelineConfig {
    fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "pipeline.channel_capacity".to_string(),
                value: self.channel_capacity.to_string()
            }.into());
        }
        Ok(())
    }
}

/// Destination naming configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory new files are created in; the system temp dir when unset
    pub directory: Option<PathBuf>,

    /// Appended to the generated identifier to form the file name
    pub file_suffix: String,

    /// Move the index to the front of the file for progressive playback
    pub fast_start: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: None,
            file_suffix: "_finished.mp4".to_string(),
            fast_start: true,
        }
    }
}

impl OutputConfig {
    fn validate(&self) -> Result<()> {
        let suffix_ok = !self.file_suffix.is_empty()
            && !self.file_suffix.contains(std::path::is_separator);
        if !suffix_ok {
            return Err(ConfigError::InvalidValue {
                key: "output.file_suffix".to_string(),
                value: self.file_suffix.clone()
            }.into());
        }
        Ok(())
    }

    /// Directory destinations are created in
    pub fn resolved_directory(&self) -> PathBuf {
        self.directory.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Fresh, unique destination path
    pub fn unique_path(&self) -> PathBuf {
        let name = format!("{}{}", uuid::Uuid::new_v4(), self.file_suffix);
        self.resolved_directory().join(name)
    }
}

/// Video codec family of the output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoCodec {
    H264,
}

/// Audio codec family of the output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioCodec {
    Aac,
}

/// Immutable encode contract handed to the write pipeline.
///
/// Codecs are fixed. Bitrate and thread count come from `EncoderConfig`;
/// the audio format matches what read cursors decode to, so PCM is never
/// appended to a leg declared at a different rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderSettings {
    pub video_codec: VideoCodec,
    /// Pixel format of the frames appended to the video leg
    pub input_pixel_format: PixelFormat,
    pub video_bitrate: u64,
    pub threads: usize,
    pub audio_codec: AudioCodec,
    pub audio_sample_rate: u32,
    pub audio_channels: u16,
    pub audio_bitrate: u64,
    pub fast_start: bool,
}

impl EncoderSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            video_codec: VideoCodec::H264,
            input_pixel_format: PixelFormat::Bgra,
            video_bitrate: config.encoder.video_bitrate.max(MIN_VIDEO_BITRATE),
            threads: config.encoder.threads,
            audio_codec: AudioCodec::Aac,
            audio_sample_rate: config.reader.audio_sample_rate,
            audio_channels: config.reader.audio_channels,
            audio_bitrate: AUDIO_BITRATE,
            fast_start: config.output.fast_start,
        }
    }
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Formats read cursors must emit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderSettings {
    pub pixel_format: PixelFormat,
    pub audio_sample_rate: u32,
    pub audio_channels: u16,
}

impl ReaderSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            pixel_format: PixelFormat::Bgra,
            audio_sample_rate: config.reader.audio_sample_rate,
            audio_channels: config.reader.audio_channels,
        }
    }
}

impl Default for ReaderSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_roundtrip() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("test_config.toml");

        let mut original_config = Config::default();
        original_config.encoder.video_bitrate = 4_000_000;
        original_config.output.directory = Some(dir.path().to_path_buf());

        original_config.save_to_file(&file_path).unwrap();
        let loaded_config = Config::from_file(&file_path).unwrap();

        assert_eq!(loaded_config.encoder.video_bitrate, 4_000_000);
        assert_eq!(loaded_config.output.directory, original_config.output.directory);
        assert_eq!(loaded_config.pipeline.channel_capacity, 8);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str("[pipeline]\nchannel_capacity = 2\n").unwrap();
        assert_eq!(config.pipeline.channel_capacity, 2);
        assert_eq!(config.encoder.video_bitrate, MIN_VIDEO_BITRATE);
        assert_eq!(config.output.file_suffix, "_finished.mp4");
    }

    #[test]
    fn test_bitrate_below_floor_is_rejected() {
        let mut config = Config::default();
        config.encoder.video_bitrate = 1_000_000;
        assert!(config.validate().is_err());

        // Settings never go below the floor even when validation is skipped
        assert_eq!(EncoderSettings::from_config(&config).video_bitrate, MIN_VIDEO_BITRATE);
    }

    #[test]
    fn test_audio_format_follows_reader() {
        let mut config = Config::default();
        config.reader.audio_sample_rate = 48_000;
        config.reader.audio_channels = 1;
        assert!(config.validate().is_ok());

        let encoder = EncoderSettings::from_config(&config);
        let reader = ReaderSettings::from_config(&config);
        assert_eq!(encoder.audio_sample_rate, reader.audio_sample_rate);
        assert_eq!(encoder.audio_channels, reader.audio_channels);
        assert_eq!(encoder.audio_sample_rate, 48_000);
    }

    #[test]
    fn test_zero_channel_capacity_is_rejected() {
        let mut config = Config::default();
        config.pipeline.channel_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = Config::from_file("/definitely/not/here.toml").unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_unique_paths_differ() {
        let dir = tempdir().unwrap();
        let output = OutputConfig {
            directory: Some(dir.path().to_path_buf()),
            ..OutputConfig::default()
        };
        let first = output.unique_path();
        let second = output.unique_path();
        assert_ne!(first, second);
        assert!(first.starts_with(dir.path()));
        assert!(first.to_string_lossy().ends_with("_finished.mp4"));
    }
}
