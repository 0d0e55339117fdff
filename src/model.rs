//! ONNX model runner for the Chatterbox export.
//!
//! The export is split into four graphs, each run through [`ort`]:
//!
//! | Graph                 | Inputs                                                   | Outputs                                             |
//! |-----------------------|----------------------------------------------------------|-----------------------------------------------------|
//! | `speech_encoder`      | `audio_values [1, T]` f32                                | `cond_emb`, `prompt_token`, `ref_x_vector`, `prompt_feat` |
//! | `embed_tokens`        | `input_ids [1, N]` i64, `position_ids [1, N]` i64, `exaggeration [1]` f32 | `inputs_embeds [1, N, H]`            |
//! | `language_model`      | `inputs_embeds`, `attention_mask [1, L]` i64, `past_key_values.{i}.{key,value}` | `logits [1, N, V]`, `present.*` |
//! | `conditional_decoder` | `speech_tokens [1, S]` i64, `speaker_embeddings`, `speaker_features` | `waveform [1, T']` f32             |
//!
//! Generation is greedy with a repetition penalty: the language model emits
//! speech tokens one at a time until the stop token, then the conditional
//! decoder turns `prompt_token ++ generated` into audio.

use std::{
    borrow::Cow,
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use anyhow::{anyhow, bail, ensure, Context, Result};
use ort::{
    ep,
    session::{Session, SessionInputValue},
    tensor::TensorElementType,
    value::{DynValue, Tensor},
};
use serde::Deserialize;
use tracing::{debug, info};

use crate::{
    audio::{self, Waveform},
    device::Device,
    options::{GenerateConfig, ModelSource, Precision},
    tokenize::{TextTokenizer, TextTokens},
};

/// Audio sample rate produced by the conditional decoder.
pub const SAMPLE_RATE: u32 = 24_000;

// ─────────────────────────────────────────────────────────────────────────────
// Model constants
// ─────────────────────────────────────────────────────────────────────────────

/// Constants baked into the export.  A `config.json` next to the graphs may
/// override any of them.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub sample_rate: u32,
    pub start_speech_token: i64,
    pub stop_speech_token: i64,
    pub num_hidden_layers: usize,
    pub num_key_value_heads: usize,
    pub head_dim: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            start_speech_token: 6561,
            stop_speech_token: 6562,
            num_hidden_layers: 30,
            num_key_value_heads: 16,
            head_dim: 64,
        }
    }
}

impl ModelConfig {
    /// Read `path`, or fall back to the defaults when it does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let bytes = std::fs::read(path)
            .with_context(|| format!("Cannot read config: {}", path.display()))?;
        serde_json::from_slice(&bytes).context("Failed to parse config.json")
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// File layout
// ─────────────────────────────────────────────────────────────────────────────

/// Names of the four graphs, in load order.
pub const GRAPHS: [&str; 4] =
    ["speech_encoder", "embed_tokens", "language_model", "conditional_decoder"];

/// Repo-relative path of a graph for the given precision, e.g.
/// `onnx/language_model_fp16.onnx`.
pub fn graph_file(graph: &str, precision: Precision) -> String {
    format!("onnx/{}{}.onnx", graph, precision.suffix())
}

/// Resolved on-disk locations of everything [`ChatterboxOnnx::load`] reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub speech_encoder: PathBuf,
    pub embed_tokens: PathBuf,
    pub language_model: PathBuf,
    pub conditional_decoder: PathBuf,
}

impl ModelFiles {
    /// Layout of a local model directory (same as the Hub repository).
    pub fn in_dir(dir: &Path, precision: Precision) -> Self {
        let graph = |name: &str| dir.join(graph_file(name, precision));
        Self {
            config: dir.join("config.json"),
            tokenizer: dir.join("tokenizer.json"),
            speech_encoder: graph("speech_encoder"),
            embed_tokens: graph("embed_tokens"),
            language_model: graph("language_model"),
            conditional_decoder: graph("conditional_decoder"),
        }
    }

    /// Fail with the first required file that is missing.
    fn check_exist(&self) -> Result<()> {
        for path in [
            &self.tokenizer,
            &self.speech_encoder,
            &self.embed_tokens,
            &self.language_model,
            &self.conditional_decoder,
        ] {
            if !path.is_file() {
                bail!("Missing model file: {}", path.display());
            }
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Host-side tensors
// ─────────────────────────────────────────────────────────────────────────────

/// A tensor copied out of (or about to be copied into) ONNX Runtime.
#[derive(Debug, Clone, PartialEq)]
struct HostTensor<T> {
    shape: Vec<usize>,
    data: Vec<T>,
}

impl<T: Clone + ort::tensor::PrimitiveTensorElementType + std::fmt::Debug + 'static>
    HostTensor<T>
{
    fn new(shape: Vec<usize>, data: Vec<T>) -> Self {
        Self { shape, data }
    }

    fn to_tensor(&self) -> Result<Tensor<T>> {
        Tensor::from_array((self.shape.clone(), self.data.clone()))
            .with_context(|| format!("Failed to build tensor of shape {:?}", self.shape))
    }
}

fn extract<T>(value: &DynValue, what: &str) -> Result<HostTensor<T>>
where
    T: Clone + ort::tensor::PrimitiveTensorElementType + std::fmt::Debug + 'static,
{
    let (shape, data) = value
        .try_extract_tensor::<T>()
        .with_context(|| format!("Failed to extract {} tensor", what))?;
    let shape: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
    Ok(HostTensor::new(shape, data.to_vec()))
}

/// Concatenate two `[1, n, H]` tensors along the sequence axis.
fn concat_seq(a: &HostTensor<f32>, b: &HostTensor<f32>) -> Result<HostTensor<f32>> {
    ensure!(
        a.shape.len() == 3 && b.shape.len() == 3 && a.shape[0] == 1 && b.shape[0] == 1,
        "Expected [1, n, H] embeddings, got {:?} and {:?}",
        a.shape,
        b.shape
    );
    ensure!(
        a.shape[2] == b.shape[2],
        "Embedding width mismatch: {} vs {}",
        a.shape[2],
        b.shape[2]
    );
    let mut data = Vec::with_capacity(a.data.len() + b.data.len());
    data.extend_from_slice(&a.data);
    data.extend_from_slice(&b.data);
    Ok(HostTensor::new(vec![1, a.shape[1] + b.shape[1], a.shape[2]], data))
}

/// Logits of the last sequence position from a `[1, N, V]` tensor.
fn last_logits(logits: &HostTensor<f32>) -> Result<Vec<f32>> {
    ensure!(logits.shape.len() == 3, "Expected [1, N, V] logits, got {:?}", logits.shape);
    let (n, v) = (logits.shape[1], logits.shape[2]);
    ensure!(n > 0 && v > 0, "Empty logits tensor {:?}", logits.shape);
    Ok(logits.data[(n - 1) * v..n * v].to_vec())
}

// ─────────────────────────────────────────────────────────────────────────────
// Sampling
// ─────────────────────────────────────────────────────────────────────────────

/// Discourage tokens that were already generated: positive logits are divided
/// by `penalty`, negative ones multiplied.  Each distinct id is penalised once.
fn apply_repetition_penalty(logits: &mut [f32], generated: &[i64], penalty: f32) {
    if penalty == 1.0 {
        return;
    }
    let seen: HashSet<i64> = generated.iter().copied().collect();
    for id in seen {
        let Some(score) = usize::try_from(id).ok().and_then(|i| logits.get_mut(i)) else {
            continue;
        };
        *score = if *score < 0.0 { *score * penalty } else { *score / penalty };
    }
}

/// Index of the largest logit (first one on ties).
fn argmax(logits: &[f32]) -> Option<usize> {
    logits
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (i, &x)| match best {
            Some((_, b)) if b >= x => best,
            _ => Some((i, x)),
        })
        .map(|(i, _)| i)
}

/// Decoder input: the reference prompt tokens followed by the generated
/// tokens, without the leading start token or a trailing stop token.
fn speech_tokens(prompt: &[i64], generated: &[i64], stop: i64) -> Vec<i64> {
    let body = generated.get(1..).unwrap_or(&[]);
    let body = match body.last() {
        Some(&last) if last == stop => &body[..body.len() - 1],
        _ => body,
    };
    prompt.iter().chain(body).copied().collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// KV cache
// ─────────────────────────────────────────────────────────────────────────────

/// `past_key_values.*` fed back into the language model between steps.
struct KvCache {
    names: Vec<String>,
    tensors: Vec<HostTensor<f32>>,
}

impl KvCache {
    /// Empty cache: every entry is `[1, heads, 0, head_dim]`.
    fn empty(config: &ModelConfig) -> Self {
        let mut names = Vec::with_capacity(config.num_hidden_layers * 2);
        for layer in 0..config.num_hidden_layers {
            for kind in ["key", "value"] {
                names.push(format!("past_key_values.{layer}.{kind}"));
            }
        }
        let shape = vec![1, config.num_key_value_heads, 0, config.head_dim];
        let tensors = names.iter().map(|_| HostTensor::new(shape.clone(), Vec::new())).collect();
        Self { names, tensors }
    }

    fn len(&self) -> usize {
        self.names.len()
    }

    /// Past length along the sequence axis.
    fn seq_len(&self) -> usize {
        self.tensors.first().and_then(|t| t.shape.get(2).copied()).unwrap_or(0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session helpers
// ─────────────────────────────────────────────────────────────────────────────

fn build_session(path: &Path, device: Device) -> Result<Session> {
    let builder = Session::builder().context("Failed to create ORT session builder")?;
    let builder = match device {
        Device::Cpu => builder,
        Device::Cuda => builder
            .with_execution_providers([ep::CUDA::default().build().error_on_failure()])
            .context("Failed to register the CUDA execution provider")?,
    };
    builder
        .commit_from_file(path)
        .with_context(|| format!("Cannot load ONNX model: {}", path.display()))
}

/// Activations are exchanged as f32 only; reject graphs whose interface uses
/// another float type (common in `*_fp16` exports).
fn check_float_io(session: &Session, path: &Path) -> Result<()> {
    let io = session.inputs().iter().chain(session.outputs());
    check_float_types(io.map(|o| (o.name(), o.dtype().tensor_type())), path)
}

fn check_float_types<'a>(
    io: impl IntoIterator<Item = (&'a str, Option<TensorElementType>)>,
    path: &Path,
) -> Result<()> {
    for (name, ty) in io {
        if let Some(
            ty @ (TensorElementType::Float16
            | TensorElementType::Bfloat16
            | TensorElementType::Float64),
        ) = ty
        {
            bail!(
                "{} exposes '{}' as {}; only f32 inputs and outputs are supported \
                 (use fp32, q4 or q8 precision)",
                path.display(),
                name,
                ty
            );
        }
    }
    Ok(())
}

fn lock(session: &Mutex<Session>) -> Result<MutexGuard<'_, Session>> {
    session.lock().map_err(|_| anyhow!("ORT session mutex poisoned"))
}

/// Output of the speech encoder for one reference clip.
struct SpeakerConditioning {
    cond_emb: HostTensor<f32>,
    prompt_token: HostTensor<i64>,
    ref_x_vector: HostTensor<f32>,
    prompt_feat: HostTensor<f32>,
}

// ─────────────────────────────────────────────────────────────────────────────
// ChatterboxOnnx
// ─────────────────────────────────────────────────────────────────────────────

/// The main TTS model handle.
pub struct ChatterboxOnnx {
    speech_encoder: Mutex<Session>,
    embed_tokens: Mutex<Session>,
    language_model: Mutex<Session>,
    conditional_decoder: Mutex<Session>,
    tokenizer: TextTokenizer,
    config: ModelConfig,
    device: Device,
}

impl ChatterboxOnnx {
    /// Load the tokenizer and the four graphs, binding every session to `device`.
    pub fn load(files: &ModelFiles, device: Device) -> Result<Self> {
        files.check_exist()?;
        let config = ModelConfig::load_or_default(&files.config)?;
        let tokenizer = TextTokenizer::from_file(&files.tokenizer, config.start_speech_token)?;

        info!("Loading ONNX graphs on {}…", device);
        let open = |path: &Path| -> Result<Session> {
            let session = build_session(path, device)?;
            check_float_io(&session, path)?;
            Ok(session)
        };
        let speech_encoder = open(&files.speech_encoder)?;
        let embed_tokens = open(&files.embed_tokens)?;
        let language_model = open(&files.language_model)?;
        let conditional_decoder = open(&files.conditional_decoder)?;

        Ok(Self {
            speech_encoder: Mutex::new(speech_encoder),
            embed_tokens: Mutex::new(embed_tokens),
            language_model: Mutex::new(language_model),
            conditional_decoder: Mutex::new(conditional_decoder),
            tokenizer,
            config,
            device,
        })
    }

    /// Load from a local directory laid out like the Hub repository.
    pub fn from_dir(dir: &Path, precision: Precision, device: Device) -> Result<Self> {
        Self::load(&ModelFiles::in_dir(dir, precision), device)
    }

    /// Load from whichever [`ModelSource`] the caller configured.
    pub fn from_source(source: &ModelSource, precision: Precision, device: Device) -> Result<Self> {
        match source {
            ModelSource::Local(dir) => {
                info!("Loading model from {}…", dir.display());
                Self::from_dir(dir, precision, device)
            }
            #[cfg(not(any(target_os = "ios", target_os = "android")))]
            ModelSource::Hub(repo_id) => crate::download::load_from_hub(repo_id, precision, device),
            #[cfg(any(target_os = "ios", target_os = "android"))]
            ModelSource::Hub(repo_id) => bail!(
                "Cannot download '{}' on this platform; bundle the model and pass its directory",
                repo_id
            ),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    // ── Graph steps ───────────────────────────────────────────────────────────

    fn encode_speaker(&self, reference: &Waveform) -> Result<SpeakerConditioning> {
        let audio = HostTensor::new(vec![1, reference.samples.len()], reference.samples.clone());
        let mut session = lock(&self.speech_encoder)?;
        let outputs = session
            .run(ort::inputs!["audio_values" => audio.to_tensor()?])
            .context("Speech encoder inference failed")?;
        ensure!(
            outputs.len() >= 4,
            "Speech encoder returned {} outputs, expected 4",
            outputs.len()
        );
        Ok(SpeakerConditioning {
            cond_emb: extract(&outputs[0], "cond_emb")?,
            prompt_token: extract(&outputs[1], "prompt_token")?,
            ref_x_vector: extract(&outputs[2], "ref_x_vector")?,
            prompt_feat: extract(&outputs[3], "prompt_feat")?,
        })
    }

    fn decode_speech(&self, tokens: Vec<i64>, speaker: &SpeakerConditioning) -> Result<Vec<f32>> {
        let n = tokens.len();
        let t_tokens = Tensor::<i64>::from_array(([1usize, n], tokens))
            .context("Failed to build speech_tokens tensor")?;

        let mut session = lock(&self.conditional_decoder)?;
        let outputs = session
            .run(ort::inputs![
                "speech_tokens" => t_tokens,
                "speaker_embeddings" => speaker.ref_x_vector.to_tensor()?,
                "speaker_features" => speaker.prompt_feat.to_tensor()?
            ])
            .context("Conditional decoder inference failed")?;
        ensure!(outputs.len() > 0, "Conditional decoder returned no outputs");
        Ok(extract::<f32>(&outputs[0], "waveform")?.data)
    }

    // ── Text + reference → audio ──────────────────────────────────────────────

    /// Synthesise `text` in the voice of the clip at `reference`.
    pub fn generate(
        &self,
        text: &str,
        reference: &Path,
        params: &GenerateConfig,
    ) -> Result<Waveform> {
        params.validate()?;
        let tokens = self.tokenizer.encode(text)?;
        let reference = audio::load_reference(reference, self.config.sample_rate)?;
        let speaker = self.encode_speaker(&reference)?;

        let cfg = &self.config;
        let generated = generate_tokens(self, cfg, &speaker.cond_emb, tokens, params)?;
        debug!("Generated {} speech tokens", generated.len().saturating_sub(1));

        let tokens = speech_tokens(&speaker.prompt_token.data, &generated, cfg.stop_speech_token);
        let samples = self.decode_speech(tokens, &speaker)?;
        Ok(Waveform::new(samples, cfg.sample_rate))
    }

    /// Synthesise and write a 16-bit PCM WAV to `output_path`.
    pub fn generate_to_file(
        &self,
        text: &str,
        reference: &Path,
        output_path: &Path,
        params: &GenerateConfig,
    ) -> Result<()> {
        let audio = self.generate(text, reference, params)?;
        audio::write_wav(&audio, output_path)
    }
}

impl TokenSteps for ChatterboxOnnx {
    fn embed(&self, ids: &[i64], positions: &[i64], exaggeration: f32) -> Result<HostTensor<f32>> {
        let n = ids.len();
        let t_ids = Tensor::<i64>::from_array(([1usize, n], ids.to_vec()))
            .context("Failed to build input_ids tensor")?;
        let t_pos = Tensor::<i64>::from_array(([1usize, n], positions.to_vec()))
            .context("Failed to build position_ids tensor")?;
        let t_exag = Tensor::<f32>::from_array(([1usize], vec![exaggeration]))
            .context("Failed to build exaggeration tensor")?;

        let mut session = lock(&self.embed_tokens)?;
        let outputs = session
            .run(ort::inputs![
                "input_ids" => t_ids,
                "position_ids" => t_pos,
                "exaggeration" => t_exag
            ])
            .context("Token embedding inference failed")?;
        ensure!(outputs.len() > 0, "Token embedder returned no outputs");
        extract(&outputs[0], "inputs_embeds")
    }

    fn decode_step(
        &self,
        embeds: &HostTensor<f32>,
        mask_len: usize,
        cache: &mut KvCache,
    ) -> Result<Vec<f32>> {
        let mut feeds: Vec<(Cow<'static, str>, SessionInputValue<'static>)> =
            Vec::with_capacity(cache.len() + 2);
        feeds.push(("inputs_embeds".into(), embeds.to_tensor()?.into()));
        let mask = Tensor::<i64>::from_array(([1usize, mask_len], vec![1i64; mask_len]))
            .context("Failed to build attention_mask tensor")?;
        feeds.push(("attention_mask".into(), mask.into()));
        for (name, past) in cache.names.iter().zip(&cache.tensors) {
            feeds.push((name.clone().into(), past.to_tensor()?.into()));
        }

        let mut session = lock(&self.language_model)?;
        let outputs = session.run(feeds).context("Language model inference failed")?;
        ensure!(
            outputs.len() == cache.len() + 1,
            "Language model returned {} outputs, expected {}",
            outputs.len(),
            cache.len() + 1
        );
        let logits = extract::<f32>(&outputs[0], "logits")?;
        for (i, slot) in cache.tensors.iter_mut().enumerate() {
            *slot = extract(&outputs[i + 1], &cache.names[i])?;
        }
        last_logits(&logits)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Token loop
// ─────────────────────────────────────────────────────────────────────────────

/// The two graphs the token loop runs once per step.
trait TokenSteps {
    /// `inputs_embeds [1, N, H]` for `ids` at `positions`.
    fn embed(&self, ids: &[i64], positions: &[i64], exaggeration: f32) -> Result<HostTensor<f32>>;

    /// One language-model step over `embeds` with an all-ones attention mask
    /// of `mask_len`.  Replaces `cache` with the step's `present.*` outputs
    /// and returns the logits of the last position.
    fn decode_step(
        &self,
        embeds: &HostTensor<f32>,
        mask_len: usize,
        cache: &mut KvCache,
    ) -> Result<Vec<f32>>;
}

/// Greedy speech-token generation.
///
/// Step 0 feeds the speaker's `cond_emb` followed by the text embeddings;
/// every later step feeds only the previous token at position `step + 1`.
/// Returns the start token followed by the generated ids, ending with the stop
/// token unless `max_new_tokens` ran out first.
fn generate_tokens(
    steps: &impl TokenSteps,
    config: &ModelConfig,
    cond_emb: &HostTensor<f32>,
    text: TextTokens,
    params: &GenerateConfig,
) -> Result<Vec<i64>> {
    let mut cache = KvCache::empty(config);
    let mut generated = vec![config.start_speech_token];
    let mut ids = text.input_ids;
    let mut positions = text.position_ids;

    for step in 0..params.max_new_tokens {
        let mut embeds = steps.embed(&ids, &positions, params.exaggeration)?;
        if step == 0 {
            embeds = concat_seq(cond_emb, &embeds)?;
        }
        ensure!(
            embeds.shape.len() == 3,
            "Expected [1, N, H] embeddings, got {:?}",
            embeds.shape
        );
        let mask_len = cache.seq_len() + embeds.shape[1];
        let mut logits = steps.decode_step(&embeds, mask_len, &mut cache)?;
        apply_repetition_penalty(&mut logits, &generated, params.repetition_penalty);
        let next = argmax(&logits).context("Language model produced empty logits")? as i64;
        generated.push(next);
        if next == config.stop_speech_token {
            break;
        }
        ids = vec![next];
        positions = vec![step as i64 + 1];
    }
    Ok(generated)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    const WIDTH: usize = 2;
    const VOCAB: usize = 6563;

    /// What the language model saw on one step.
    #[derive(Debug, PartialEq)]
    struct StepSeen {
        embed_len: usize,
        mask_len: usize,
        past_len: usize,
    }

    /// Emits `script` one token per step and grows the cache like `present.*`.
    struct ScriptedSteps {
        script: Vec<i64>,
        fed: RefCell<Vec<(Vec<i64>, Vec<i64>)>>,
        seen: RefCell<Vec<StepSeen>>,
    }

    impl ScriptedSteps {
        fn new(script: &[i64]) -> Self {
            Self { script: script.to_vec(), fed: RefCell::default(), seen: RefCell::default() }
        }

        fn positions(&self) -> Vec<Vec<i64>> {
            self.fed.borrow().iter().map(|(_, p)| p.clone()).collect()
        }
    }

    impl TokenSteps for ScriptedSteps {
        fn embed(&self, ids: &[i64], positions: &[i64], _: f32) -> Result<HostTensor<f32>> {
            self.fed.borrow_mut().push((ids.to_vec(), positions.to_vec()));
            Ok(HostTensor::new(vec![1, ids.len(), WIDTH], vec![0.5; ids.len() * WIDTH]))
        }

        fn decode_step(
            &self,
            embeds: &HostTensor<f32>,
            mask_len: usize,
            cache: &mut KvCache,
        ) -> Result<Vec<f32>> {
            let step = self.seen.borrow().len();
            self.seen.borrow_mut().push(StepSeen {
                embed_len: embeds.shape[1],
                mask_len,
                past_len: cache.seq_len(),
            });
            for t in &mut cache.tensors {
                t.shape[2] += embeds.shape[1];
            }
            let mut logits = vec![0.0; VOCAB];
            logits[self.script[step] as usize] = 1.0;
            Ok(logits)
        }
    }

    fn loop_inputs() -> (ModelConfig, HostTensor<f32>, TextTokens) {
        let config = ModelConfig { num_hidden_layers: 1, ..Default::default() };
        let cond_emb = HostTensor::new(vec![1, 3, WIDTH], vec![1.0; 3 * WIDTH]);
        let text =
            TextTokens { input_ids: vec![255, 10, 11, 6561], position_ids: vec![-1, 0, 1, 0] };
        (config, cond_emb, text)
    }

    #[test]
    fn test_token_loop_stops_on_stop_token() {
        let (config, cond_emb, text) = loop_inputs();
        let steps = ScriptedSteps::new(&[100, 200, 6562, 300]);
        let generated =
            generate_tokens(&steps, &config, &cond_emb, text, &GenerateConfig::default()).unwrap();

        assert_eq!(generated, vec![6561, 100, 200, 6562]);
        let fed: Vec<Vec<i64>> = steps.fed.borrow().iter().map(|(i, _)| i.clone()).collect();
        assert_eq!(fed, vec![vec![255, 10, 11, 6561], vec![100], vec![200]]);
        assert_eq!(steps.positions(), vec![vec![-1, 0, 1, 0], vec![1], vec![2]]);
        // Conditioning is prepended once; the mask covers past + current.
        assert_eq!(
            *steps.seen.borrow(),
            vec![
                StepSeen { embed_len: 7, mask_len: 7, past_len: 0 },
                StepSeen { embed_len: 1, mask_len: 8, past_len: 7 },
                StepSeen { embed_len: 1, mask_len: 9, past_len: 8 },
            ]
        );
    }

    #[test]
    fn test_token_loop_respects_budget() {
        let (config, cond_emb, text) = loop_inputs();
        let steps = ScriptedSteps::new(&[1, 2, 3, 4, 5, 6]);
        let params = GenerateConfig { max_new_tokens: 3, ..Default::default() };
        let generated = generate_tokens(&steps, &config, &cond_emb, text, &params).unwrap();

        assert_eq!(generated, vec![6561, 1, 2, 3]);
        assert_eq!(steps.seen.borrow().len(), 3);
        assert_eq!(steps.positions().last().unwrap(), &vec![2]);
        assert_eq!(speech_tokens(&[7], &generated, config.stop_speech_token), vec![7, 1, 2, 3]);
    }

    #[test]
    fn test_token_loop_rejects_mismatched_conditioning() {
        let (config, _, text) = loop_inputs();
        let narrow = HostTensor::new(vec![1, 1, WIDTH + 1], vec![0.0; WIDTH + 1]);
        let steps = ScriptedSteps::new(&[6562]);
        assert!(
            generate_tokens(&steps, &config, &narrow, text, &GenerateConfig::default()).is_err()
        );
        assert!(steps.seen.borrow().is_empty());
    }

    #[test]
    fn test_half_precision_io_rejected() {
        let path = Path::new("onnx/language_model_fp16.onnx");
        let f32_io = [
            ("inputs_embeds", Some(TensorElementType::Float32)),
            ("attention_mask", Some(TensorElementType::Int64)),
            ("opaque", None),
        ];
        assert!(check_float_types(f32_io, path).is_ok());

        let f16_io = [
            ("inputs_embeds", Some(TensorElementType::Float32)),
            ("past_key_values.0.key", Some(TensorElementType::Float16)),
        ];
        let err = check_float_types(f16_io, path).unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("past_key_values.0.key") && msg.contains("f16"), "got: {msg}");
    }

    #[test]
    fn test_graph_file_names() {
        assert_eq!(graph_file("embed_tokens", Precision::Fp32), "onnx/embed_tokens.onnx");
        assert_eq!(
            graph_file("language_model", Precision::Q8),
            "onnx/language_model_quantized.onnx"
        );
    }

    #[test]
    fn test_model_files_in_dir() {
        let files = ModelFiles::in_dir(Path::new("/m"), Precision::Fp16);
        assert_eq!(files.tokenizer, PathBuf::from("/m/tokenizer.json"));
        assert_eq!(files.speech_encoder, PathBuf::from("/m/onnx/speech_encoder_fp16.onnx"));
        assert_eq!(
            files.conditional_decoder,
            PathBuf::from("/m/onnx/conditional_decoder_fp16.onnx")
        );
    }

    #[test]
    fn test_load_missing_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = ChatterboxOnnx::from_dir(dir.path(), Precision::Fp32, Device::Cpu)
            .err()
            .unwrap();
        assert!(format!("{err:#}").contains("Missing model file"), "got: {err:#}");
    }

    #[test]
    fn test_from_local_source_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let source = ModelSource::Local(dir.path().to_path_buf());
        assert!(ChatterboxOnnx::from_source(&source, Precision::Fp32, Device::Cpu).is_err());
    }

    #[test]
    fn test_config_defaults_and_override() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("config.json");
        assert_eq!(ModelConfig::load_or_default(&missing).unwrap(), ModelConfig::default());

        std::fs::write(&missing, r#"{ "num_hidden_layers": 24 }"#).unwrap();
        let cfg = ModelConfig::load_or_default(&missing).unwrap();
        assert_eq!(cfg.num_hidden_layers, 24);
        assert_eq!(cfg.stop_speech_token, 6562);
    }

    #[test]
    fn test_repetition_penalty() {
        let mut logits = vec![2.0, -2.0, 1.0, 4.0];
        apply_repetition_penalty(&mut logits, &[0, 1, 1, 99, -3], 2.0);
        assert_eq!(logits, vec![1.0, -4.0, 1.0, 4.0]);
    }

    #[test]
    fn test_repetition_penalty_identity() {
        let mut logits = vec![2.0, -2.0];
        apply_repetition_penalty(&mut logits, &[0, 1], 1.0);
        assert_eq!(logits, vec![2.0, -2.0]);
    }

    #[test]
    fn test_argmax() {
        assert_eq!(argmax(&[0.1, 0.9, 0.3]), Some(1));
        assert_eq!(argmax(&[0.5, 0.5]), Some(0));
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn test_speech_tokens_strip_start_and_stop() {
        assert_eq!(speech_tokens(&[7, 8], &[6561, 1, 2, 6562], 6562), vec![7, 8, 1, 2]);
        // Budget ran out: last token is real speech and is kept.
        assert_eq!(speech_tokens(&[7], &[6561, 1, 2], 6562), vec![7, 1, 2]);
        assert_eq!(speech_tokens(&[7], &[6561], 6562), vec![7]);
    }

    #[test]
    fn test_concat_seq() {
        let a = HostTensor::new(vec![1, 1, 2], vec![1.0, 2.0]);
        let b = HostTensor::new(vec![1, 2, 2], vec![3.0, 4.0, 5.0, 6.0]);
        let c = concat_seq(&a, &b).unwrap();
        assert_eq!(c.shape, vec![1, 3, 2]);
        assert_eq!(c.data, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        let wide = HostTensor::new(vec![1, 1, 3], vec![0.0; 3]);
        assert!(concat_seq(&a, &wide).is_err());
    }

    #[test]
    fn test_last_logits() {
        let t = HostTensor::new(vec![1, 2, 3], vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(last_logits(&t).unwrap(), vec![3.0, 4.0, 5.0]);
        assert!(last_logits(&HostTensor::new(vec![1, 0, 3], vec![])).is_err());
    }

    #[test]
    fn test_empty_kv_cache() {
        let cfg = ModelConfig { num_hidden_layers: 2, ..Default::default() };
        let cache = KvCache::empty(&cfg);
        assert_eq!(cache.len(), 4);
        assert_eq!(cache.names[0], "past_key_values.0.key");
        assert_eq!(cache.names[3], "past_key_values.1.value");
        assert_eq!(cache.tensors[0].shape, vec![1, 16, 0, 64]);
        assert_eq!(cache.seq_len(), 0);
    }
}
