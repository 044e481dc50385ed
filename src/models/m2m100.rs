// M2M100 encoder-decoder on candle
use crate::error::{Result, TranslatorError};
use crate::generation::{beam_search, BeamDecoder, GenerationConfig};
use crate::models::tokenizer::M2M100Tokenizer;
use crate::models::TranslationModel;
use candle::{DType, Device, Module, Tensor};
use candle_nn::{embedding, layer_norm, linear, Activation, Embedding, LayerNorm, Linear, VarBuilder};
use hf_hub::api::sync::ApiBuilder;
use hf_hub::{Repo, RepoType};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_MODEL_ID: &str = "facebook/m2m100_1.2B";
const LAYER_NORM_EPS: f64 = 1e-5;
// fairseq keeps two reserved rows in front of the positional table
const POSITION_OFFSET: usize = 2;

fn default_activation() -> Activation {
    Activation::Relu
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub vocab_size: usize,
    pub d_model: usize,
    pub encoder_layers: usize,
    pub decoder_layers: usize,
    pub encoder_attention_heads: usize,
    pub decoder_attention_heads: usize,
    pub encoder_ffn_dim: usize,
    pub decoder_ffn_dim: usize,
    #[serde(default = "default_activation")]
    pub activation_function: Activation,
    pub max_position_embeddings: usize,
    #[serde(default = "default_true")]
    pub scale_embedding: bool,
    pub pad_token_id: u32,
    pub eos_token_id: u32,
    pub decoder_start_token_id: u32,
}

impl Config {
    fn validate(&self) -> Result<()> {
        for (heads, name) in [
            (self.encoder_attention_heads, "encoder_attention_heads"),
            (self.decoder_attention_heads, "decoder_attention_heads"),
        ] {
            if heads == 0 || self.d_model % heads != 0 {
                return Err(TranslatorError::Config(format!(
                    "d_model {} is not divisible by {name} {heads}",
                    self.d_model
                )));
            }
        }
        if self.max_position_embeddings <= POSITION_OFFSET {
            return Err(TranslatorError::Config(format!(
                "max_position_embeddings {} is too small",
                self.max_position_embeddings
            )));
        }
        Ok(())
    }

    /// Longest content a single generation may produce.
    pub fn max_new_tokens(&self) -> usize {
        self.max_position_embeddings - POSITION_OFFSET
    }
}

/// fairseq sinusoidal table, `[num_positions, dim]`, with the padding row zeroed.
pub(crate) fn sinusoidal_positions(
    num_positions: usize,
    dim: usize,
    padding_idx: usize,
    device: &Device,
) -> candle::Result<Tensor> {
    let half_dim = dim / 2;
    let scale = (10000f64).ln() / (half_dim.max(2) - 1) as f64;
    let freqs: Vec<f64> = (0..half_dim).map(|i| (-scale * i as f64).exp()).collect();
    let mut table = vec![0f32; num_positions * dim];
    for pos in 0..num_positions {
        if pos == padding_idx {
            continue;
        }
        let row = &mut table[pos * dim..(pos + 1) * dim];
        for (i, freq) in freqs.iter().enumerate() {
            let angle = pos as f64 * freq;
            row[i] = angle.sin() as f32;
            row[half_dim + i] = angle.cos() as f32;
        }
    }
    Tensor::from_vec(table, (num_positions, dim), device)
}

struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl Attention {
    fn load(embed_dim: usize, num_heads: usize, vb: VarBuilder) -> candle::Result<Self> {
        let head_dim = embed_dim / num_heads;
        Ok(Self {
            q_proj: linear(embed_dim, embed_dim, vb.pp("q_proj"))?,
            k_proj: linear(embed_dim, embed_dim, vb.pp("k_proj"))?,
            v_proj: linear(embed_dim, embed_dim, vb.pp("v_proj"))?,
            out_proj: linear(embed_dim, embed_dim, vb.pp("out_proj"))?,
            num_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
        })
    }

    // [b, len, d] -> [b, heads, len, head_dim]
    fn split_heads(&self, xs: &Tensor) -> candle::Result<Tensor> {
        let (b, len, _) = xs.dims3()?;
        xs.reshape((b, len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn key_value(&self, xs: &Tensor) -> candle::Result<(Tensor, Tensor)> {
        let k = self.split_heads(&self.k_proj.forward(xs)?)?;
        let v = self.split_heads(&self.v_proj.forward(xs)?)?;
        Ok((k, v))
    }

    // no mask: single unpadded source, and decoding feeds one position at a time
    fn attend(&self, query: &Tensor, key: &Tensor, value: &Tensor) -> candle::Result<Tensor> {
        let (b, len, _) = query.dims3()?;
        let q = (self.split_heads(&self.q_proj.forward(query)?)? * self.scale)?;
        let weights = candle_nn::ops::softmax_last_dim(&q.matmul(&key.t()?)?)?;
        let out = weights
            .matmul(value)?
            .transpose(1, 2)?
            .reshape((b, len, self.num_heads * self.head_dim))?;
        self.out_proj.forward(&out)
    }
}

struct FeedForward {
    fc1: Linear,
    fc2: Linear,
    activation: Activation,
}

impl FeedForward {
    fn load(embed_dim: usize, ffn_dim: usize, activation: Activation, vb: VarBuilder) -> candle::Result<Self> {
        Ok(Self {
            fc1: linear(embed_dim, ffn_dim, vb.pp("fc1"))?,
            fc2: linear(ffn_dim, embed_dim, vb.pp("fc2"))?,
            activation,
        })
    }
}

impl Module for FeedForward {
    fn forward(&self, xs: &Tensor) -> candle::Result<Tensor> {
        self.fc2.forward(&self.activation.forward(&self.fc1.forward(xs)?)?)
    }
}

struct EncoderLayer {
    self_attn: Attention,
    self_attn_layer_norm: LayerNorm,
    ffn: FeedForward,
    final_layer_norm: LayerNorm,
}

impl EncoderLayer {
    fn load(cfg: &Config, vb: VarBuilder) -> candle::Result<Self> {
        let d = cfg.d_model;
        Ok(Self {
            self_attn: Attention::load(d, cfg.encoder_attention_heads, vb.pp("self_attn"))?,
            self_attn_layer_norm: layer_norm(d, LAYER_NORM_EPS, vb.pp("self_attn_layer_norm"))?,
            ffn: FeedForward::load(d, cfg.encoder_ffn_dim, cfg.activation_function, vb.clone())?,
            final_layer_norm: layer_norm(d, LAYER_NORM_EPS, vb.pp("final_layer_norm"))?,
        })
    }

    // pre-norm residual blocks
    fn forward(&self, xs: &Tensor) -> candle::Result<Tensor> {
        let normed = self.self_attn_layer_norm.forward(xs)?;
        let (k, v) = self.self_attn.key_value(&normed)?;
        let xs = (xs + self.self_attn.attend(&normed, &k, &v)?)?;
        let normed = self.final_layer_norm.forward(&xs)?;
        xs + self.ffn.forward(&normed)?
    }
}

/// Per-layer key/value state of one decoding session.
#[derive(Default)]
struct LayerCache {
    self_kv: Option<(Tensor, Tensor)>,
    cross_kv: Option<(Tensor, Tensor)>,
}

struct DecoderLayer {
    self_attn: Attention,
    self_attn_layer_norm: LayerNorm,
    encoder_attn: Attention,
    encoder_attn_layer_norm: LayerNorm,
    ffn: FeedForward,
    final_layer_norm: LayerNorm,
}

impl DecoderLayer {
    fn load(cfg: &Config, vb: VarBuilder) -> candle::Result<Self> {
        let d = cfg.d_model;
        Ok(Self {
            self_attn: Attention::load(d, cfg.decoder_attention_heads, vb.pp("self_attn"))?,
            self_attn_layer_norm: layer_norm(d, LAYER_NORM_EPS, vb.pp("self_attn_layer_norm"))?,
            encoder_attn: Attention::load(d, cfg.decoder_attention_heads, vb.pp("encoder_attn"))?,
            encoder_attn_layer_norm: layer_norm(
                d,
                LAYER_NORM_EPS,
                vb.pp("encoder_attn_layer_norm"),
            )?,
            ffn: FeedForward::load(d, cfg.decoder_ffn_dim, cfg.activation_function, vb.clone())?,
            final_layer_norm: layer_norm(d, LAYER_NORM_EPS, vb.pp("final_layer_norm"))?,
        })
    }

    /// One incremental step: `xs` is `[beams, 1, d]`, earlier positions come from `cache`.
    fn forward_step(
        &self,
        xs: &Tensor,
        encoder_out: &Tensor,
        cache: &mut LayerCache,
    ) -> candle::Result<Tensor> {
        let normed = self.self_attn_layer_norm.forward(xs)?;
        let (k, v) = self.self_attn.key_value(&normed)?;
        let (k, v) = match cache.self_kv.take() {
            Some((past_k, past_v)) => (
                Tensor::cat(&[&past_k, &k], 2)?,
                Tensor::cat(&[&past_v, &v], 2)?,
            ),
            None => (k, v),
        };
        let xs = (xs + self.self_attn.attend(&normed, &k, &v)?)?;
        cache.self_kv = Some((k, v));

        // encoder keys and values never change within a session
        let (ck, cv) = match cache.cross_kv.clone() {
            Some(kv) => kv,
            None => {
                let kv = self.encoder_attn.key_value(encoder_out)?;
                cache.cross_kv = Some(kv.clone());
                kv
            }
        };
        let normed = self.encoder_attn_layer_norm.forward(&xs)?;
        let xs = (&xs + self.encoder_attn.attend(&normed, &ck, &cv)?)?;

        let normed = self.final_layer_norm.forward(&xs)?;
        xs + self.ffn.forward(&normed)?
    }
}

pub struct M2M100Model {
    shared: Embedding,
    embed_scale: f64,
    embed_positions: Tensor,
    encoder_layers: Vec<EncoderLayer>,
    encoder_layer_norm: LayerNorm,
    decoder_layers: Vec<DecoderLayer>,
    decoder_layer_norm: LayerNorm,
    lm_head: Linear,
    padding_idx: usize,
    config: Config,
}

impl M2M100Model {
    pub fn load(vb: VarBuilder, config: &Config) -> Result<Self> {
        config.validate()?;
        let d = config.d_model;
        let model_vb = vb.pp("model");
        // checkpoints tie every embedding to `shared`, some only keep the encoder copy
        let shared = if model_vb.contains_tensor("shared.weight") {
            embedding(config.vocab_size, d, model_vb.pp("shared"))?
        } else {
            embedding(config.vocab_size, d, model_vb.pp("encoder.embed_tokens"))?
        };
        let lm_head = Linear::new(shared.embeddings().clone(), None);
        let padding_idx = config.pad_token_id as usize;
        let embed_positions = sinusoidal_positions(
            config.max_position_embeddings + POSITION_OFFSET,
            d,
            padding_idx,
            vb.device(),
        )?
        .to_dtype(vb.dtype())?;

        let encoder_vb = model_vb.pp("encoder");
        let encoder_layers = (0..config.encoder_layers)
            .map(|i| EncoderLayer::load(config, encoder_vb.pp(format!("layers.{i}"))))
            .collect::<candle::Result<Vec<_>>>()?;
        let decoder_vb = model_vb.pp("decoder");
        let decoder_layers = (0..config.decoder_layers)
            .map(|i| DecoderLayer::load(config, decoder_vb.pp(format!("layers.{i}"))))
            .collect::<candle::Result<Vec<_>>>()?;

        Ok(Self {
            shared,
            embed_scale: if config.scale_embedding {
                (d as f64).sqrt()
            } else {
                1.0
            },
            embed_positions,
            encoder_layers,
            encoder_layer_norm: layer_norm(d, LAYER_NORM_EPS, encoder_vb.pp("layer_norm"))?,
            decoder_layers,
            decoder_layer_norm: layer_norm(d, LAYER_NORM_EPS, decoder_vb.pp("layer_norm"))?,
            lm_head,
            padding_idx,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // token embeddings plus positions `past_len..past_len + len`, for `[b, len]` ids
    fn embed(&self, input_ids: &Tensor, past_len: usize) -> candle::Result<Tensor> {
        let (_, len) = input_ids.dims2()?;
        let start = self.padding_idx + 1 + past_len;
        let positions = self.embed_positions.narrow(0, start, len)?;
        let tokens = (self.shared.forward(input_ids)? * self.embed_scale)?;
        tokens.broadcast_add(&positions.unsqueeze(0)?)
    }

    /// Encodes one unpadded source sequence into `[1, len, d]`.
    pub fn encode(&self, input_ids: &[u32], device: &Device) -> candle::Result<Tensor> {
        let input = Tensor::new(input_ids, device)?.unsqueeze(0)?;
        let mut xs = self.embed(&input, 0)?;
        for layer in &self.encoder_layers {
            xs = layer.forward(&xs)?;
        }
        self.encoder_layer_norm.forward(&xs)
    }

    /// Starts an incremental decoding session over `encoder_out` for `num_beams` rows.
    pub fn session(&self, encoder_out: &Tensor, num_beams: usize) -> candle::Result<DecodingSession<'_>> {
        let (_, src_len, d) = encoder_out.dims3()?;
        let encoder_out = encoder_out.broadcast_as((num_beams, src_len, d))?.contiguous()?;
        Ok(DecodingSession {
            model: self,
            caches: (0..self.decoder_layers.len()).map(|_| LayerCache::default()).collect(),
            encoder_out,
            past_len: 0,
        })
    }
}

pub struct DecodingSession<'a> {
    model: &'a M2M100Model,
    caches: Vec<LayerCache>,
    encoder_out: Tensor,
    past_len: usize,
}

impl DecodingSession<'_> {
    fn logits(&mut self, last_tokens: &[u32]) -> candle::Result<Vec<Vec<f32>>> {
        let model = self.model;
        let input = Tensor::new(last_tokens, self.encoder_out.device())?.unsqueeze(1)?;
        let mut xs = model.embed(&input, self.past_len)?;
        for (layer, cache) in model.decoder_layers.iter().zip(self.caches.iter_mut()) {
            xs = layer.forward_step(&xs, &self.encoder_out, cache)?;
        }
        let xs = model.decoder_layer_norm.forward(&xs)?;
        self.past_len += 1;
        model
            .lm_head
            .forward(&xs)?
            .squeeze(1)?
            .to_dtype(DType::F32)?
            .to_vec2::<f32>()
    }
}

impl BeamDecoder for DecodingSession<'_> {
    fn step(&mut self, last_tokens: &[u32]) -> Result<Vec<Vec<f32>>> {
        Ok(self.logits(last_tokens)?)
    }

    fn reorder(&mut self, order: &[usize]) -> Result<()> {
        let order: Vec<u32> = order.iter().map(|i| *i as u32).collect();
        let index = Tensor::new(order.as_slice(), self.encoder_out.device())?;
        for cache in self.caches.iter_mut() {
            if let Some((k, v)) = cache.self_kv.take() {
                cache.self_kv = Some((k.index_select(&index, 0)?, v.index_select(&index, 0)?));
            }
        }
        Ok(())
    }
}

/// Files of one checkpoint on local disk.
pub struct ModelFiles {
    pub config: PathBuf,
    pub vocab: PathBuf,
    pub sentencepiece: PathBuf,
    pub weights: PathBuf,
}

impl ModelFiles {
    /// Resolves every file through the local hub cache, downloading what is missing.
    pub fn from_hub(model_id: &str, revision: &str, token: Option<String>) -> Result<Self> {
        let api = ApiBuilder::new().with_token(token).build()?;
        let repo = api.repo(Repo::with_revision(
            model_id.to_string(),
            RepoType::Model,
            revision.to_string(),
        ));
        let weights = match repo.get("model.safetensors") {
            Ok(path) => path,
            Err(e) => {
                log::info!("no safetensors weights for {model_id} ({e}), using pytorch_model.bin");
                repo.get("pytorch_model.bin")?
            }
        };
        Ok(Self {
            config: repo.get("config.json")?,
            vocab: repo.get("vocab.json")?,
            sentencepiece: repo.get("sentencepiece.bpe.model")?,
            weights,
        })
    }
}

fn load_weights(path: &Path, dtype: DType, device: &Device) -> Result<VarBuilder<'static>> {
    let is_safetensors = path.extension().map_or(false, |ext| ext == "safetensors");
    let vb = if is_safetensors {
        unsafe { VarBuilder::from_mmaped_safetensors(&[path], dtype, device)? }
    } else {
        VarBuilder::from_pth(path, dtype, device)?
    };
    Ok(vb)
}

pub struct M2M100Translator {
    name: String,
    model: M2M100Model,
    tokenizer: M2M100Tokenizer,
    device: Device,
    generation: GenerationConfig,
}

impl M2M100Translator {
    pub fn load(name: &str, files: &ModelFiles, device: Device) -> Result<Self> {
        let config: Config = serde_json::from_str(&std::fs::read_to_string(&files.config)?)?;
        let tokenizer = M2M100Tokenizer::from_files(&files.sentencepiece, &files.vocab)?;
        let vb = load_weights(&files.weights, DType::F32, &device)?;
        let model = M2M100Model::load(vb, &config)?;
        Ok(Self {
            name: name.to_string(),
            model,
            tokenizer,
            device,
            generation: GenerationConfig::default(),
        })
    }
}

impl TranslationModel for M2M100Translator {
    fn name(&self) -> &str {
        &self.name
    }

    fn languages(&self) -> Vec<String> {
        self.tokenizer.vocab().languages().to_vec()
    }

    fn resolves(&self, code: &str) -> bool {
        self.tokenizer
            .vocab()
            .lang_id(code)
            .map_or(false, |id| (id as usize) < self.model.config().vocab_size)
    }

    fn translate(&self, text: &str, source: &str, target: &str, max_length: usize) -> Result<String> {
        let config = self.model.config();
        let target_id = self
            .tokenizer
            .vocab()
            .lang_id(target)
            .ok_or_else(|| TranslatorError::UnsupportedLanguage(target.to_string()))?;

        let mut input_ids = self.tokenizer.encode(text, source)?;
        let max_source = config.max_position_embeddings;
        if input_ids.len() > max_source {
            log::warn!("source truncated from {} to {max_source} tokens", input_ids.len());
            input_ids.truncate(max_source - 1);
            input_ids.push(self.tokenizer.vocab().eos_id());
        }

        let generation = self
            .generation
            .clone()
            .with_max_new_tokens(max_length.clamp(1, config.max_new_tokens()));
        let encoder_out = self.model.encode(&input_ids, &self.device)?;
        let mut session = self.model.session(&encoder_out, generation.num_beams)?;
        let output = beam_search(
            &mut session,
            &generation,
            config.decoder_start_token_id,
            Some(target_id),
            config.eos_token_id,
        )?;
        Ok(self.tokenizer.decode(&output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn tiny_config() -> Config {
        serde_json::from_str(
            r#"{
                "vocab_size": 16,
                "d_model": 8,
                "encoder_layers": 1,
                "decoder_layers": 1,
                "encoder_attention_heads": 2,
                "decoder_attention_heads": 2,
                "encoder_ffn_dim": 16,
                "decoder_ffn_dim": 16,
                "activation_function": "relu",
                "max_position_embeddings": 32,
                "scale_embedding": true,
                "pad_token_id": 1,
                "eos_token_id": 2,
                "decoder_start_token_id": 2
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn positional_table_zeroes_padding_row() {
        let table = sinusoidal_positions(6, 4, 1, &Device::Cpu).unwrap();
        let rows = table.to_vec2::<f32>().unwrap();
        assert!(rows[1].iter().all(|v| *v == 0.0));
        // position 0: sin(0) = 0, cos(0) = 1
        assert_eq!(rows[0], vec![0.0, 0.0, 1.0, 1.0]);
        assert!((rows[2][0] - 2f32.sin()).abs() < 1e-6);
    }

    #[test]
    fn config_rejects_uneven_heads() {
        let mut config = tiny_config();
        config.encoder_attention_heads = 3;
        assert!(matches!(config.validate(), Err(TranslatorError::Config(_))));
    }

    #[test]
    fn random_model_decodes_with_cache() {
        let config = tiny_config();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = M2M100Model::load(vb, &config).unwrap();

        let encoder_out = model.encode(&[5, 6, 7, 2], &Device::Cpu).unwrap();
        assert_eq!(encoder_out.dims3().unwrap(), (1, 4, 8));

        let mut session = model.session(&encoder_out, 3).unwrap();
        let rows = session.step(&[2, 2, 2]).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].len(), 16);
        session.reorder(&[0, 0, 1]).unwrap();
        let rows = session.step(&[9, 10, 11]).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(session.past_len, 2);
    }

    #[test]
    fn beam_search_respects_budget_on_random_weights() {
        let config = tiny_config();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = M2M100Model::load(vb, &config).unwrap();
        let encoder_out = model.encode(&[5, 6, 2], &Device::Cpu).unwrap();
        let generation = GenerationConfig::default().with_max_new_tokens(3);
        let mut session = model.session(&encoder_out, generation.num_beams).unwrap();
        let tokens = beam_search(&mut session, &generation, 2, Some(12), 2).unwrap();
        assert_eq!(&tokens[..2], &[2, 12]);
        assert!(tokens.len() <= 2 + 3);
        assert!(tokens.len() > 2);
    }
}
