//! HuggingFace Hub model downloader.
//!
//! Fetches `tokenizer.json`, the optional `config.json`, and the four ONNX
//! graphs (plus their external-data shards) from a HuggingFace repository, then
//! constructs and returns a [`ChatterboxOnnx`].

use std::path::PathBuf;

use anyhow::{Context, Result};
use hf_hub::api::sync::{Api, ApiRepo};
use tracing::{debug, info};

use crate::{
    device::Device,
    model::{graph_file, ChatterboxOnnx, ModelFiles, GRAPHS},
    options::{Precision, DEFAULT_REPO_ID},
};

// ─────────────────────────────────────────────────────────────────────────────
// Download helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Download a single file from a HuggingFace repository.
fn hf_download(repo: &ApiRepo, repo_id: &str, filename: &str) -> Result<PathBuf> {
    repo.get(filename)
        .with_context(|| format!("Failed to download '{}' from '{}'", filename, repo_id))
}

/// Repository files that belong to `graph_file`: the graph itself and any
/// external-data shards (`….onnx_data`, `….onnx_data_1`, …).
pub fn graph_companions<'a>(siblings: &'a [String], graph_file: &str) -> Vec<&'a str> {
    siblings
        .iter()
        .map(String::as_str)
        .filter(|name| {
            name.strip_prefix(graph_file)
                .is_some_and(|rest| rest.is_empty() || rest.starts_with("_data"))
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Public API
// ─────────────────────────────────────────────────────────────────────────────

/// Download every file the model needs and return their cached locations.
///
/// Files are cached in the HuggingFace Hub cache directory
/// (`~/.cache/huggingface/hub` by default), so the graph and its data shards
/// end up side by side in the same snapshot directory.
pub fn fetch_from_hub(repo_id: &str, precision: Precision) -> Result<ModelFiles> {
    info!("Downloading model files from {}…", repo_id);
    let api = Api::new().context("Failed to initialise HuggingFace Hub client")?;
    let repo = api.model(repo_id.to_string());

    let siblings: Vec<String> = repo
        .info()
        .with_context(|| format!("Cannot list repository '{}'", repo_id))?
        .siblings
        .into_iter()
        .map(|s| s.rfilename)
        .collect();

    let tokenizer = hf_download(&repo, repo_id, "tokenizer.json")?;

    // config.json is optional; without it the built-in constants apply.
    let config = if siblings.iter().any(|s| s == "config.json") {
        hf_download(&repo, repo_id, "config.json")?
    } else {
        tokenizer.with_file_name("config.json")
    };

    let mut graphs = Vec::with_capacity(GRAPHS.len());
    for graph in GRAPHS {
        let file = graph_file(graph, precision);
        let companions = graph_companions(&siblings, &file);
        if companions.is_empty() {
            anyhow::bail!("Repository '{}' has no {}", repo_id, file);
        }
        let mut graph_path = None;
        for name in companions {
            debug!("Fetching {}", name);
            let path = hf_download(&repo, repo_id, name)?;
            if name == file {
                graph_path = Some(path);
            }
        }
        graphs.push(graph_path.with_context(|| format!("'{}' missing from '{}'", file, repo_id))?);
    }

    let [speech_encoder, embed_tokens, language_model, conditional_decoder]: [PathBuf; 4] =
        graphs.try_into().map_err(|_| anyhow::anyhow!("Expected four graphs"))?;

    Ok(ModelFiles {
        config,
        tokenizer,
        speech_encoder,
        embed_tokens,
        language_model,
        conditional_decoder,
    })
}

/// Download and initialise a [`ChatterboxOnnx`] model from HuggingFace.
///
/// # Example
/// ```no_run
/// use chatterbox::{download, options::{GenerateConfig, Precision}, Device};
///
/// let model = download::load_from_hub("onnx-community/chatterbox-ONNX", Precision::Fp32, Device::Cpu).unwrap();
/// let audio = model
///     .generate("Hello world", std::path::Path::new("voice.wav"), &GenerateConfig::default())
///     .unwrap();
/// ```
pub fn load_from_hub(
    repo_id: &str,
    precision: Precision,
    device: Device,
) -> Result<ChatterboxOnnx> {
    let files = fetch_from_hub(repo_id, precision)?;
    info!("Loading model…");
    ChatterboxOnnx::load(&files, device)
}

/// Convenience alias using the default fp32 export.
pub fn load_default(device: Device) -> Result<ChatterboxOnnx> {
    load_from_hub(DEFAULT_REPO_ID, Precision::Fp32, device)
}
