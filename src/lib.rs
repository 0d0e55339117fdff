//! # chatterbox
//!
//! Voice-cloning text-to-speech with the ONNX export of
//! [Chatterbox](https://huggingface.co/onnx-community/chatterbox-ONNX), run
//! through ONNX Runtime.
//!
//! ## Quick start
//!
//! ```no_run
//! use chatterbox::{pipeline, SynthesisOptions};
//!
//! let options = SynthesisOptions {
//!     text: "Hello from Rust!".into(),
//!     reference_audio: "voice.ogg".into(),
//!     output: "hello.wav".into(),
//!     ..Default::default()
//! };
//! let report = pipeline::synthesize(&options).unwrap();
//! println!("{} samples at {} Hz on {}", report.samples, report.sample_rate, report.device);
//! ```
//!
//! Or drive the model directly:
//!
//! ```no_run
//! use chatterbox::{ChatterboxOnnx, Device, options::{GenerateConfig, ModelSource, Precision}};
//! use std::path::Path;
//!
//! let model = ChatterboxOnnx::from_source(&ModelSource::default(), Precision::Fp32, Device::Cpu).unwrap();
//! let audio = model.generate("Hi there.", Path::new("voice.wav"), &GenerateConfig::default()).unwrap();
//! chatterbox::audio::write_wav(&audio, Path::new("out.wav")).unwrap();
//! ```
//!
//! ## Pipeline
//! 1. **Device selection**: CUDA when ONNX Runtime can register it, else CPU.
//! 2. **Model load**: tokenizer + four ONNX graphs, from the Hub or a directory.
//! 3. **Reference encoding**: clip decoded, mixed to mono, resampled to 24 kHz,
//!    run through the speech encoder.
//! 4. **Token generation**: greedy decoding with a repetition penalty until the
//!    stop-speech token.
//! 5. **Vocoding**: the conditional decoder turns speech tokens into audio.
//! 6. **Output**: 16-bit PCM mono WAV at the model's sample rate.
//!
//! The crate logs through [`tracing`]; install a subscriber to see it.

pub mod audio;
pub mod device;

// Model download from HuggingFace Hub is desktop-only: mobile apps bundle the
// model and load it from a directory.
#[cfg(not(any(target_os = "ios", target_os = "android")))]
pub mod download;

pub mod error;

// C FFI for iOS / Android: exposes chatterbox_model_load / synthesize / free.
pub mod ffi;

pub mod model;
pub mod options;
pub mod pipeline;
pub mod tokenize;

// ─── Re-exports for convenience ─────────────────────────────────────────────

pub use audio::Waveform;
pub use device::{Device, DevicePreference};
pub use error::PipelineError;
pub use model::{ChatterboxOnnx, SAMPLE_RATE};
pub use options::SynthesisOptions;
pub use pipeline::{SpeechModel, SynthesisReport};
