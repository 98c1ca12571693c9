use facewatch_core::DataLayout;
use std::path::PathBuf;
use std::time::Duration;

/// CLI configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the per-person image folders (default: ./enroll_folder).
    pub source_dir: PathBuf,
    /// Directory holding the database, index pair, cache and representative images.
    pub data_dir: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Maximum cosine distance accepted as a match.
    pub threshold: f32,
    /// Seconds between reconciliation passes in `watch`.
    pub watch_interval_secs: u64,
}

impl Config {
    /// Load configuration from `FACEWATCH_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build the configuration from any variable lookup.
    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = var("FACEWATCH_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(facewatch_core::default_data_dir);

        let model_dir = var("FACEWATCH_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| facewatch_core::default_model_dir(&data_dir));

        Self {
            source_dir: var("FACEWATCH_SOURCE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("enroll_folder")),
            model_dir,
            data_dir,
            threshold: parse_f32(var("FACEWATCH_THRESHOLD"), 0.6),
            watch_interval_secs: parse_u64(var("FACEWATCH_WATCH_INTERVAL_SECS"), 30).max(1),
        }
    }

    pub fn layout(&self) -> DataLayout {
        DataLayout::new(&self.data_dir)
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_secs(self.watch_interval_secs)
    }
}

fn parse_f32(value: Option<String>, default: f32) -> f32 {
    value
        .and_then(|v| v.parse().ok())
        .filter(|v: &f32| v.is_finite())
        .unwrap_or(default)
}

fn parse_u64(value: Option<String>, default: u64) -> u64 {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}
