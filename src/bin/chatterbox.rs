//! Command-line front end.
//!
//! Usage:
//!   chatterbox
//!   chatterbox --text "Hello from Rust!" --reference voice.ogg --output hello.wav
//!   chatterbox --options run.json --device cpu
//!
//! With no flags it speaks the built-in sentence in the voice of `peter.ogg`
//! and writes `test.wav`.  Set `RUST_LOG=debug` for more detail.

use std::{path::PathBuf, process::ExitCode};

use anyhow::Result;
use chatterbox::{
    options::{ModelSource, Precision},
    pipeline, DevicePreference, SynthesisOptions,
};
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "chatterbox", version, about = "Voice-cloning TTS with the Chatterbox ONNX model")]
struct Cli {
    /// JSON options file; flags below override its values.
    #[arg(long)]
    options: Option<PathBuf>,

    /// Text to speak.
    #[arg(long)]
    text: Option<String>,

    /// Reference voice clip (wav, ogg, flac, mp3).
    #[arg(long)]
    reference: Option<PathBuf>,

    /// Output WAV path (overwritten if present).
    #[arg(long)]
    output: Option<PathBuf>,

    /// auto, cpu or cuda.
    #[arg(long)]
    device: Option<DevicePreference>,

    /// HuggingFace repository id or local model directory.
    #[arg(long)]
    model: Option<String>,

    /// fp32, fp16, q4 or q8.
    #[arg(long)]
    precision: Option<Precision>,

    #[arg(long)]
    max_new_tokens: Option<usize>,

    #[arg(long)]
    exaggeration: Option<f32>,

    #[arg(long)]
    repetition_penalty: Option<f32>,
}

impl Cli {
    fn into_options(self) -> Result<SynthesisOptions> {
        let mut o = match &self.options {
            Some(path) => SynthesisOptions::from_json_file(path)?,
            None => SynthesisOptions::default(),
        };
        if let Some(v) = self.text {
            o.text = v;
        }
        if let Some(v) = self.reference {
            o.reference_audio = v;
        }
        if let Some(v) = self.output {
            o.output = v;
        }
        if let Some(v) = self.device {
            o.device = v;
        }
        if let Some(v) = self.model {
            o.model = ModelSource::parse(&v);
        }
        if let Some(v) = self.precision {
            o.precision = v;
        }
        if let Some(v) = self.max_new_tokens {
            o.generate.max_new_tokens = v;
        }
        if let Some(v) = self.exaggeration {
            o.generate.exaggeration = v;
        }
        if let Some(v) = self.repetition_penalty {
            o.generate.repetition_penalty = v;
        }
        Ok(o)
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let options = match Cli::parse().into_options() {
        Ok(o) => o,
        Err(e) => {
            error!("{e:#}");
            return ExitCode::FAILURE;
        }
    };

    match pipeline::synthesize(&options) {
        Ok(report) => {
            println!("Done: {}", report.output.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            // Load failures were already logged with their full chain.
            if !matches!(e, chatterbox::PipelineError::Load { .. }) {
                let chain: Vec<String> = std::iter::successors(
                    Some(&e as &(dyn std::error::Error + 'static)),
                    |err| err.source(),
                )
                .map(ToString::to_string)
                .collect();
                error!("{} failed: {}", e.stage(), chain.join(": "));
            }
            ExitCode::FAILURE
        }
    }
}
