//! Select device → load model → synthesise → write WAV.
//!
//! [`synthesize`] is the whole run for the Chatterbox model.  [`run`] is the
//! same sequence with the CUDA probe and the loader passed in, which is what
//! the tests drive with stand-in models.

use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{error, info};

use crate::{
    audio::{self, Waveform},
    device::{cuda_available, select_device, Device},
    error::PipelineError,
    model::ChatterboxOnnx,
    options::{GenerateConfig, SynthesisOptions},
};

/// A loaded speech-synthesis model.
pub trait SpeechModel {
    /// Rate the generated waveform is played back at.
    fn sample_rate(&self) -> u32;

    /// Speak `text` in the voice of the clip at `reference`.
    fn generate(&self, text: &str, reference: &Path, params: &GenerateConfig) -> Result<Waveform>;
}

impl SpeechModel for ChatterboxOnnx {
    fn sample_rate(&self) -> u32 {
        ChatterboxOnnx::sample_rate(self)
    }

    fn generate(&self, text: &str, reference: &Path, params: &GenerateConfig) -> Result<Waveform> {
        ChatterboxOnnx::generate(self, text, reference, params)
    }
}

/// What a successful run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisReport {
    pub device: Device,
    pub sample_rate: u32,
    pub samples: usize,
    pub output: PathBuf,
}

/// Run the full pipeline with the Chatterbox ONNX model.
pub fn synthesize(options: &SynthesisOptions) -> Result<SynthesisReport, PipelineError> {
    run(options, cuda_available, |device| {
        ChatterboxOnnx::from_source(&options.model, options.precision, device)
    })
}

/// Run the pipeline with an explicit CUDA probe and model loader.
///
/// The device line is always logged before anything else can fail.  A load
/// failure is logged with its full cause chain and ends the run; synthesis and
/// write failures are returned to the caller as-is.
pub fn run<M, P, L>(
    options: &SynthesisOptions,
    probe: P,
    load: L,
) -> Result<SynthesisReport, PipelineError>
where
    M: SpeechModel,
    P: FnOnce() -> bool,
    L: FnOnce(Device) -> Result<M>,
{
    let device = select_device(options.device, probe);
    info!("Using device: {}", device);

    let model = match load(device) {
        Ok(model) => model,
        Err(e) => {
            error!("Error loading model: {e:#}");
            error!("{e:?}");
            return Err(PipelineError::Load {
                source_name: options.model.to_string(),
                source: e.into(),
            });
        }
    };

    info!("Synthesising {:?}", options.text);
    let generated = model
        .generate(&options.text, &options.reference_audio, &options.generate)
        .map_err(|e| PipelineError::Synthesis(e.into()))?;

    // The file is annotated with the rate the model reports.
    let waveform = Waveform::new(generated.samples, model.sample_rate());
    audio::write_wav(&waveform, &options.output).map_err(|e| PipelineError::Write {
        path: options.output.clone(),
        source: e.into(),
    })?;

    Ok(SynthesisReport {
        device,
        sample_rate: waveform.sample_rate,
        samples: waveform.samples.len(),
        output: options.output.clone(),
    })
}
