//! Audio I/O: reference-clip decoding and WAV output.
//!
//! Reference clips go through [`symphonia`] (wav, ogg/vorbis, flac, mp3), are
//! mixed down to mono and resampled with [`rubato`] to the rate the speech
//! encoder expects.  Synthesised audio is written with [`hound`].

use std::{fs::File, path::Path};

use anyhow::{anyhow, bail, Context, Result};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use symphonia::core::{
    audio::SampleBuffer,
    codecs::DecoderOptions,
    errors::Error as SymphoniaError,
    formats::FormatOptions,
    io::MediaSourceStream,
    meta::MetadataOptions,
    probe::Hint,
};
use tracing::{debug, info};

/// Mono audio signal paired with its sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl Waveform {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    pub fn duration_secs(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / self.sample_rate as f32
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reference decoding
// ─────────────────────────────────────────────────────────────────────────────

/// Average interleaved frames down to one channel.
pub fn mix_to_mono(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Decode an audio file into a mono [`Waveform`] at its native rate.
pub fn decode_file(path: &Path) -> Result<Waveform> {
    let file = File::open(path)
        .with_context(|| format!("Cannot open reference audio: {}", path.display()))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .with_context(|| format!("Unrecognised audio format: {}", path.display()))?;
    let mut format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| anyhow!("No audio track in {}", path.display()))?;
    let track_id = track.id;
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| anyhow!("Unknown sample rate in {}", path.display()))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .context("Failed to create audio decoder")?;

    let mut interleaved = Vec::new();
    let mut channels = 0usize;
    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(e) => return Err(e).context("Audio demux error"),
        };
        if packet.track_id() != track_id {
            continue;
        }
        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            // Corrupt packet: skip it, keep the rest of the clip.
            Err(SymphoniaError::DecodeError(e)) => {
                debug!("Skipping undecodable packet: {e}");
                continue;
            }
            Err(e) => return Err(e).context("Audio decode error"),
        };
        let spec = *decoded.spec();
        if channels == 0 {
            channels = spec.channels.count();
        } else if spec.channels.count() != channels {
            bail!(
                "Channel count changed mid-stream in {} ({} -> {})",
                path.display(),
                channels,
                spec.channels.count()
            );
        }
        let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buf.copy_interleaved_ref(decoded);
        interleaved.extend_from_slice(buf.samples());
    }

    if interleaved.is_empty() {
        bail!("Reference audio {} contains no samples", path.display());
    }

    Ok(Waveform::new(mix_to_mono(&interleaved, channels), sample_rate))
}

/// Resample mono audio to `target_rate`; a no-op when the rates already match.
pub fn resample(audio: &Waveform, target_rate: u32) -> Result<Waveform> {
    if audio.sample_rate == target_rate || audio.samples.is_empty() {
        return Ok(Waveform::new(audio.samples.clone(), target_rate));
    }

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let ratio = target_rate as f64 / audio.sample_rate as f64;

    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, audio.samples.len(), 1)
        .context("Resampler creation failed")?;
    let delay = resampler.output_delay();
    let expected = (audio.samples.len() as f64 * ratio).round() as usize;

    let mut out = resampler
        .process(&[audio.samples.as_slice()], None)
        .context("Resampling failed")?
        .into_iter()
        .next()
        .unwrap_or_default();
    // The filter delays its output; flush with silence until the tail is out.
    while out.len() < delay + expected {
        let tail = resampler
            .process_partial::<Vec<f32>>(None, None)
            .context("Resampler flush failed")?
            .into_iter()
            .next()
            .unwrap_or_default();
        if tail.is_empty() {
            break;
        }
        out.extend(tail);
    }
    out.drain(..delay.min(out.len()));
    out.truncate(expected);

    Ok(Waveform::new(out, target_rate))
}

/// Decode `path`, mix to mono and resample to `target_rate`.
pub fn load_reference(path: &Path, target_rate: u32) -> Result<Waveform> {
    let native = decode_file(path)?;
    debug!(
        "Reference {}: {:.2} s at {} Hz",
        path.display(),
        native.duration_secs(),
        native.sample_rate
    );
    resample(&native, target_rate)
}

// ─────────────────────────────────────────────────────────────────────────────
// WAV writer
// ─────────────────────────────────────────────────────────────────────────────

/// Write `audio` as a 16-bit PCM mono WAV at its own sample rate.
///
/// An existing file at `output_path` is truncated and replaced.  16-bit PCM is
/// used rather than float because Android's `MediaPlayer` does not reliably
/// decode IEEE-float WAV.
pub fn write_wav(audio: &Waveform, output_path: &Path) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: audio.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(output_path, spec)
        .with_context(|| format!("Cannot create WAV: {}", output_path.display()))?;
    for &s in &audio.samples {
        // f32 [-1.0, 1.0] → i16
        let s16 = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        writer.write_sample(s16).context("WAV write error")?;
    }
    writer.finalize().context("WAV finalise error")?;
    info!(
        "Saved {} samples ({:.2} s) to {}",
        audio.samples.len(),
        audio.duration_secs(),
        output_path.display()
    );
    Ok(())
}
