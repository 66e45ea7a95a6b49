use camino::Utf8PathBuf;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_yaml_ng::Value;
use std::time::Duration;
use thiserror::Error;

/// Errors that make a run configuration unusable before any image is shown
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// No image paths, or zero repetitions
    #[error("No images specified in test configuration")]
    NoImages,
}

/// A transform parameter held the wrong kind of value
#[derive(Error, Debug, Clone, PartialEq)]
#[error("parameter `{key}` must be {expected}, got {found}")]
pub struct ParamError {
    pub key: String,
    pub expected: &'static str,
    pub found: String,
}

/// Untyped parameter map for a single transform.
///
/// Values come straight from YAML, so accessors convert on read and report a
/// [`ParamError`] when a key holds something of the wrong shape. A missing key
/// (or an explicit `null`) reads as `Ok(None)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransformParams(IndexMap<String, Value>);

impl TransformParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key).filter(|v| !v.is_null())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Read a number (integers are widened)
    pub fn f64(&self, key: &str) -> Result<Option<f64>, ParamError> {
        match self.get(key) {
            None => Ok(None),
            Some(v) => v
                .as_f64()
                .map(Some)
                .ok_or_else(|| Self::mismatch(key, "a number", v)),
        }
    }

    pub fn bool(&self, key: &str) -> Result<Option<bool>, ParamError> {
        match self.get(key) {
            None => Ok(None),
            Some(v) => v
                .as_bool()
                .map(Some)
                .ok_or_else(|| Self::mismatch(key, "a boolean", v)),
        }
    }

    /// Read a non-negative integer; whole floats such as `800.0` are accepted
    pub fn u32(&self, key: &str) -> Result<Option<u32>, ParamError> {
        let Some(v) = self.get(key) else {
            return Ok(None);
        };

        if let Some(n) = v.as_u64() {
            return u32::try_from(n)
                .map(Some)
                .map_err(|_| Self::mismatch(key, "an integer that fits in 32 bits", v));
        }

        match v.as_f64() {
            Some(f) if f.fract() == 0.0 && (0.0..=u32::MAX as f64).contains(&f) => {
                Ok(Some(f as u32))
            }
            _ => Err(Self::mismatch(key, "a non-negative integer", v)),
        }
    }

    /// Read an 8-bit sample value (used for background fills)
    pub fn u8(&self, key: &str) -> Result<Option<u8>, ParamError> {
        match self.u32(key) {
            Ok(Some(n)) => u8::try_from(n)
                .map(Some)
                .map_err(|_| ParamError {
                    key: key.to_string(),
                    expected: "an integer between 0 and 255",
                    found: n.to_string(),
                }),
            Ok(None) => Ok(None),
            Err(e) => Err(ParamError {
                expected: "an integer between 0 and 255",
                ..e
            }),
        }
    }

    fn mismatch(key: &str, expected: &'static str, found: &Value) -> ParamError {
        ParamError {
            key: key.to_string(),
            expected,
            found: format!("{:?}", found),
        }
    }
}

/// One named step of the transformation pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct TransformSpec {
    pub name: String,
    pub params: TransformParams,
}

impl TransformSpec {
    pub fn new(name: impl Into<String>, params: TransformParams) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }
}

/// Configuration for one trial run, loaded from `Trial Run.yaml`.
///
/// The transformation map keeps insertion order, which is the order the
/// pipeline applies the transforms in. Unknown top-level keys are kept in
/// `extra` so newer files still load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub barcode_type: String,

    pub image_paths: Vec<Utf8PathBuf>,

    #[serde(with = "seconds")]
    pub delay_between_images: Duration,

    pub repetitions: u32,

    pub transformations: IndexMap<String, TransformParams>,

    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            barcode_type: "Code128".to_string(),
            image_paths: Vec::new(),
            delay_between_images: Duration::from_millis(500),
            repetitions: 1,
            transformations: IndexMap::new(),
            extra: IndexMap::new(),
        }
    }
}

impl RunConfig {
    /// Config for the given images with no delay and no transforms
    pub fn new<I, P>(image_paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Utf8PathBuf>,
    {
        Self {
            image_paths: image_paths.into_iter().map(Into::into).collect(),
            delay_between_images: Duration::ZERO,
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_between_images = delay;
        self
    }

    pub fn with_repetitions(mut self, repetitions: u32) -> Self {
        self.repetitions = repetitions;
        self
    }

    /// Append a transform; re-adding a name replaces its parameters in place
    pub fn with_transform(mut self, name: impl Into<String>, params: TransformParams) -> Self {
        self.transformations.insert(name.into(), params);
        self
    }

    /// Image sequence after repetition expansion
    pub fn expanded_image_paths(&self) -> Vec<Utf8PathBuf> {
        let mut expanded = Vec::with_capacity(self.image_paths.len() * self.repetitions as usize);
        for _ in 0..self.repetitions {
            expanded.extend(self.image_paths.iter().cloned());
        }
        expanded
    }

    pub fn transform_specs(&self) -> Vec<TransformSpec> {
        self.transformations
            .iter()
            .map(|(name, params)| TransformSpec::new(name.clone(), params.clone()))
            .collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.repetitions == 0 || self.image_paths.is_empty() {
            return Err(ConfigError::NoImages);
        }
        Ok(())
    }
}

/// Panel refresh waveform. `Gc16` is the full-quality 16-level mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RefreshMode {
    Du,
    #[default]
    Gc16,
    Gl16,
    A2,
}

/// Display construction settings handed to the display factory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplaySettings {
    /// Skip hardware entirely and use the in-memory display
    #[serde(rename = "virtual")]
    pub virtual_display: bool,

    pub width: u32,
    pub height: u32,

    /// Panel VCOM calibration voltage
    pub vcom: f64,

    pub spi_hz: u32,

    /// Mounting rotation in degrees clockwise (0, 90, 180 or 270)
    pub rotation: u16,

    /// Mounting mirror (left-right)
    pub mirror: bool,

    pub refresh_mode: RefreshMode,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            virtual_display: false,
            width: 800,
            height: 600,
            vcom: -2.06,
            spi_hz: 24_000_000,
            rotation: 0,
            mirror: false,
            refresh_mode: RefreshMode::Gc16,
        }
    }
}

impl DisplaySettings {
    pub fn virtual_panel(width: u32, height: u32) -> Self {
        Self {
            virtual_display: true,
            width,
            height,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    /// How long `stop_test` waits for the run loop to notice the request
    #[serde(with = "seconds")]
    pub stop_grace: Duration,

    /// Upper bound on a single load/transform/render step. `None` waits forever.
    #[serde(with = "seconds_opt")]
    pub render_timeout: Option<Duration>,

    /// Maximum number of slices an inter-image delay is cut into
    pub max_delay_chunks: u32,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_millis(100),
            render_timeout: None,
            max_delay_chunks: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub log_dir: String,
    pub log_prefix: String,
    pub debug: bool,
    pub console: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_dir: "logs".to_string(),
            log_prefix: "epdtrial".to_string(),
            debug: false,
            console: true,
        }
    }
}

/// Everything in `Trial Settings.yaml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub display: DisplaySettings,
    pub controller: ControllerSettings,
    pub logging: LoggingSettings,
}

/// Durations are stored as fractional seconds
mod seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(format!(
                "expected a non-negative number of seconds, got {}",
                secs
            ))
        })
    }
}

mod seconds_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        match Option::<f64>::deserialize(deserializer)? {
            None => Ok(None),
            Some(secs) => Duration::try_from_secs_f64(secs).map(Some).map_err(|_| {
                serde::de::Error::custom(format!(
                    "expected a non-negative number of seconds, got {}",
                    secs
                ))
            }),
        }
    }
}
