//! Run options: what to say, whose voice, where to write, which model.
//!
//! Every field has a default, so a JSON options file only needs the keys it
//! changes:
//!
//! ```json
//! { "text": "Hello there.", "reference_audio": "me.wav", "device": "cpu" }
//! ```

use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{bail, ensure, Context, Result};
use serde::Deserialize;

use crate::device::DevicePreference;

/// HuggingFace repository used when no model is given.
pub const DEFAULT_REPO_ID: &str = "onnx-community/chatterbox-ONNX";

/// Namespace prepended to bare model names.
const DEFAULT_NAMESPACE: &str = "onnx-community";

pub const DEFAULT_TEXT: &str =
    "I am Leo Jiang and I am trying to learn how to webscrape on android";
pub const DEFAULT_REFERENCE: &str = "peter.ogg";
pub const DEFAULT_OUTPUT: &str = "test.wav";

// ─────────────────────────────────────────────────────────────────────────────
// Model source
// ─────────────────────────────────────────────────────────────────────────────

/// Where the pretrained model comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// HuggingFace Hub repository id, e.g. `onnx-community/chatterbox-ONNX`.
    Hub(String),
    /// Local directory with the same layout as the Hub repository.
    Local(PathBuf),
}

impl ModelSource {
    /// Interpret `s` as a local directory if one exists, else as a Hub id.
    ///
    /// Bare names (no `/`) are expanded to `onnx-community/<name>`.
    pub fn parse(s: &str) -> Self {
        let path = Path::new(s);
        if path.is_dir() {
            return ModelSource::Local(path.to_path_buf());
        }
        if s.contains('/') {
            ModelSource::Hub(s.to_string())
        } else {
            ModelSource::Hub(format!("{}/{}", DEFAULT_NAMESPACE, s))
        }
    }
}

impl Default for ModelSource {
    fn default() -> Self {
        ModelSource::Hub(DEFAULT_REPO_ID.to_string())
    }
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelSource::Hub(id) => f.write_str(id),
            ModelSource::Local(dir) => write!(f, "{}", dir.display()),
        }
    }
}

impl<'de> Deserialize<'de> for ModelSource {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Ok(ModelSource::parse(&s))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Precision
// ─────────────────────────────────────────────────────────────────────────────

/// Which export of the ONNX graphs to load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    Fp32,
    Fp16,
    Q4,
    Q8,
}

impl Precision {
    /// File-name suffix inserted before `.onnx`.
    pub fn suffix(self) -> &'static str {
        match self {
            Precision::Fp32 => "",
            Precision::Fp16 => "_fp16",
            Precision::Q4 => "_q4",
            Precision::Q8 => "_quantized",
        }
    }
}

impl FromStr for Precision {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fp32" => Ok(Self::Fp32),
            "fp16" => Ok(Self::Fp16),
            "q4" => Ok(Self::Q4),
            "q8" | "quantized" => Ok(Self::Q8),
            other => bail!("Unknown precision '{}', expected fp32, fp16, q4 or q8", other),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Generation parameters
// ─────────────────────────────────────────────────────────────────────────────

/// Knobs for the autoregressive speech-token loop.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct GenerateConfig {
    /// Upper bound on generated speech tokens.
    pub max_new_tokens: usize,
    /// Emotion intensity fed to the token embedder (0.0–2.0).
    pub exaggeration: f32,
    /// Penalty applied to already generated tokens (≥ 1.0).
    pub repetition_penalty: f32,
}

impl Default for GenerateConfig {
    fn default() -> Self {
        Self { max_new_tokens: 256, exaggeration: 0.5, repetition_penalty: 1.2 }
    }
}

impl GenerateConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.max_new_tokens >= 1, "max_new_tokens must be at least 1");
        ensure!(
            (0.0..=2.0).contains(&self.exaggeration),
            "exaggeration {} is outside 0.0–2.0",
            self.exaggeration
        );
        ensure!(
            self.repetition_penalty >= 1.0,
            "repetition_penalty {} must be >= 1.0",
            self.repetition_penalty
        );
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SynthesisOptions
// ─────────────────────────────────────────────────────────────────────────────

/// Everything one synthesis run needs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SynthesisOptions {
    pub text: String,
    pub reference_audio: PathBuf,
    pub output: PathBuf,
    pub device: DevicePreference,
    pub model: ModelSource,
    pub precision: Precision,
    #[serde(flatten)]
    pub generate: GenerateConfig,
}

impl Default for SynthesisOptions {
    fn default() -> Self {
        Self {
            text: DEFAULT_TEXT.to_string(),
            reference_audio: PathBuf::from(DEFAULT_REFERENCE),
            output: PathBuf::from(DEFAULT_OUTPUT),
            device: DevicePreference::Auto,
            model: ModelSource::default(),
            precision: Precision::Fp32,
            generate: GenerateConfig::default(),
        }
    }
}

impl SynthesisOptions {
    /// Read options from a JSON file; missing keys keep their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Cannot read options: {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse options: {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_fixed_run() {
        let o = SynthesisOptions::default();
        assert_eq!(o.text, DEFAULT_TEXT);
        assert_eq!(o.reference_audio, PathBuf::from("peter.ogg"));
        assert_eq!(o.output, PathBuf::from("test.wav"));
        assert_eq!(o.device, DevicePreference::Auto);
        assert_eq!(o.model, ModelSource::Hub(DEFAULT_REPO_ID.into()));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let o: SynthesisOptions = serde_json::from_str(
            r#"{ "text": "Hi.", "device": "cpu", "max_new_tokens": 64, "precision": "q4" }"#,
        )
        .unwrap();
        assert_eq!(o.text, "Hi.");
        assert_eq!(o.device, DevicePreference::Cpu);
        assert_eq!(o.precision, Precision::Q4);
        assert_eq!(o.generate.max_new_tokens, 64);
        assert_eq!(o.generate.exaggeration, 0.5);
        assert_eq!(o.output, PathBuf::from(DEFAULT_OUTPUT));
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opts.json");
        std::fs::write(&path, r#"{ "output": "out/a.wav" }"#).unwrap();
        let o = SynthesisOptions::from_json_file(&path).unwrap();
        assert_eq!(o.output, PathBuf::from("out/a.wav"));

        assert!(SynthesisOptions::from_json_file(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_model_source_parse() {
        assert_eq!(
            ModelSource::parse("chatterbox-ONNX"),
            ModelSource::Hub("onnx-community/chatterbox-ONNX".into())
        );
        assert_eq!(
            ModelSource::parse("someone/custom-export"),
            ModelSource::Hub("someone/custom-export".into())
        );
        let dir = tempfile::tempdir().unwrap();
        let s = dir.path().to_str().unwrap();
        assert_eq!(ModelSource::parse(s), ModelSource::Local(dir.path().to_path_buf()));
    }

    #[test]
    fn test_precision_suffix() {
        assert_eq!(Precision::Fp32.suffix(), "");
        assert_eq!("fp16".parse::<Precision>().unwrap().suffix(), "_fp16");
        assert_eq!("quantized".parse::<Precision>().unwrap(), Precision::Q8);
        assert!("int3".parse::<Precision>().is_err());
    }

    #[test]
    fn test_generate_config_validation() {
        assert!(GenerateConfig::default().validate().is_ok());
        let zero = GenerateConfig { max_new_tokens: 0, ..Default::default() };
        assert!(zero.validate().is_err());
        let loud = GenerateConfig { exaggeration: 3.0, ..Default::default() };
        assert!(loud.validate().is_err());
        let lax = GenerateConfig { repetition_penalty: 0.5, ..Default::default() };
        assert!(lax.validate().is_err());
    }
}
