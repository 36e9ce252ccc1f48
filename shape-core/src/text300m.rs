use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{layer_norm, linear, linear_no_bias, LayerNorm, Linear, VarBuilder};
use candle_transformers::models::clip::text_model::{
    self, ClipTextConfig, ClipTextTransformer,
};
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;

use crate::{LatentModel, Loader, ModelSources};

/// Tokens prepended to the latent sequence: timestep and prompt.
const COND_TOKENS: usize = 2;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Text300MConfig {
    pub n_ctx: usize,
    pub d_latent: usize,
    pub width: usize,
    pub layers: usize,
    pub heads: usize,
    pub clip_dim: usize,
    pub max_text_tokens: usize,
}

impl Text300MConfig {
    pub fn text300m() -> Self {
        Self {
            n_ctx: 1024,
            d_latent: 1024,
            width: 1024,
            layers: 24,
            heads: 16,
            clip_dim: 768,
            max_text_tokens: 77,
        }
    }
}

impl Default for Text300MConfig {
    fn default() -> Self {
        Self::text300m()
    }
}

fn clip_config(clip_dim: usize, max_text_tokens: usize) -> ClipTextConfig {
    ClipTextConfig {
        vocab_size: 49408,
        projection_dim: clip_dim,
        activation: text_model::Activation::QuickGelu,
        intermediate_size: 3072,
        embed_dim: 768,
        max_position_embeddings: max_text_tokens,
        pad_with: None,
        num_hidden_layers: 12,
        num_attention_heads: 12,
    }
}

/// Sinusoidal embedding of continuous timesteps, `(batch,)` to `(batch, dim)`.
fn timestep_embedding(t: &Tensor, dim: usize) -> Result<Tensor> {
    let half = dim / 2;
    let freqs: Vec<f32> = (0..half)
        .map(|i| (-(10_000f32.ln()) * i as f32 / half as f32).exp())
        .collect();
    let freqs = Tensor::from_vec(freqs, (1, half), t.device())?;
    let args = t
        .to_dtype(DType::F32)?
        .unsqueeze(1)?
        .broadcast_mul(&freqs)?;
    let mut emb = Tensor::cat(&[args.cos()?, args.sin()?], 1)?;
    if dim % 2 == 1 {
        emb = emb.pad_with_zeros(1, 0, 1)?;
    }
    Ok(emb)
}

struct Mlp {
    c_fc: Linear,
    c_proj: Linear,
}

impl Mlp {
    fn new(width: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            c_fc: linear(width, width * 4, vb.pp("c_fc"))?,
            c_proj: linear(width * 4, width, vb.pp("c_proj"))?,
        })
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        self.c_proj.forward(&self.c_fc.forward(xs)?.gelu_erf()?)
    }
}

struct Attention {
    c_qkv: Linear,
    c_proj: Linear,
    heads: usize,
}

impl Attention {
    fn new(width: usize, heads: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            c_qkv: linear(width, width * 3, vb.pp("c_qkv"))?,
            c_proj: linear(width, width, vb.pp("c_proj"))?,
            heads,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, n, width) = xs.dims3()?;
        let attn_ch = width / self.heads;
        let scale = 1.0 / (attn_ch as f64).sqrt().sqrt();

        let qkv = self
            .c_qkv
            .forward(xs)?
            .reshape((b, n, self.heads, 3 * attn_ch))?;
        let split = |i: usize| -> Result<Tensor> {
            Ok(qkv
                .narrow(3, i * attn_ch, attn_ch)?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let (q, k, v) = (split(0)?, split(1)?, split(2)?);

        let weights = (q * scale)?.matmul(&(k * scale)?.t()?)?;
        let dtype = weights.dtype();
        let weights = candle_nn::ops::softmax_last_dim(&weights.to_dtype(DType::F32)?)?
            .to_dtype(dtype)?;
        let out = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, n, width))?;
        Ok(self.c_proj.forward(&out)?)
    }
}

struct ResidualBlock {
    ln_1: LayerNorm,
    attn: Attention,
    ln_2: LayerNorm,
    mlp: Mlp,
}

impl ResidualBlock {
    fn new(width: usize, heads: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            ln_1: layer_norm(width, 1e-5, vb.pp("ln_1"))?,
            attn: Attention::new(width, heads, vb.pp("attn"))?,
            ln_2: layer_norm(width, 1e-5, vb.pp("ln_2"))?,
            mlp: Mlp::new(width, vb.pp("mlp"))?,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = (xs + self.attn.forward(&self.ln_1.forward(xs)?)?)?;
        Ok((&xs + self.mlp.forward(&self.ln_2.forward(&xs)?)?)?)
    }
}

/// Transformer denoiser over the latent token sequence, conditioned on a
/// timestep token and a CLIP prompt token.
struct LatentTransformer {
    time_embed: Mlp,
    clip_embed: Linear,
    input_proj: Linear,
    pos_emb: Tensor,
    ln_pre: LayerNorm,
    blocks: Vec<ResidualBlock>,
    ln_post: LayerNorm,
    output_proj: Linear,
    width: usize,
    clip_scale: f64,
}

impl LatentTransformer {
    fn new(config: &Text300MConfig, vb: VarBuilder) -> Result<Self> {
        let width = config.width;
        let blocks = (0..config.layers)
            .map(|i| ResidualBlock::new(width, config.heads, vb.pp(format!("backbone.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            time_embed: Mlp::new(width, vb.pp("time_embed"))?,
            clip_embed: linear(config.clip_dim, width, vb.pp("clip_embed"))?,
            input_proj: linear(config.d_latent, width, vb.pp("input_proj"))?,
            pos_emb: vb.get((config.n_ctx + COND_TOKENS, width), "pos_emb")?,
            ln_pre: layer_norm(width, 1e-5, vb.pp("ln_pre"))?,
            blocks,
            ln_post: layer_norm(width, 1e-5, vb.pp("ln_post"))?,
            output_proj: linear(width, config.d_latent, vb.pp("output_proj"))?,
            width,
            clip_scale: (config.clip_dim as f64).sqrt(),
        })
    }

    /// `x` is `(batch, n_ctx, d_latent)`, `t` is `(batch,)` and `cond` is
    /// `(batch, clip_dim)`; the output has the shape of `x`.
    fn forward(&self, x: &Tensor, t: &Tensor, cond: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let t_emb = timestep_embedding(t, self.width)?.to_dtype(dtype)?;
        let t_emb = self.time_embed.forward(&t_emb)?.unsqueeze(1)?;
        let c_emb = self
            .clip_embed
            .forward(&(cond * self.clip_scale)?)?
            .unsqueeze(1)?;

        let h = self.input_proj.forward(x)?;
        let h = Tensor::cat(&[&t_emb, &c_emb, &h], 1)?;
        let mut h = self.ln_pre.forward(&h.broadcast_add(&self.pos_emb)?)?;
        for block in &self.blocks {
            h = block.forward(&h)?;
        }
        let h = self.ln_post.forward(&h)?;
        let n = h.dim(1)?;
        let h = self.output_proj.forward(&h.narrow(1, COND_TOKENS, n - COND_TOKENS)?)?;
        Ok(h)
    }
}

pub struct Text300M {
    config: Text300MConfig,
    tokenizer: Tokenizer,
    clip: ClipTextTransformer,
    text_projection: Linear,
    transformer: LatentTransformer,
    device: Device,
    dtype: DType,
}

impl Text300M {
    fn tokenize(&self, prompt: &str) -> Result<Vec<u32>> {
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        let max = self.config.max_text_tokens;
        if tokens.len() > max {
            // Keep the end-of-text id; the pooled embedding is read there.
            if let Some(&eot) = tokens.last() {
                tokens.truncate(max - 1);
                tokens.push(eot);
            }
        }
        Ok(tokens)
    }
}

impl LatentModel for Text300M {
    fn latent_shape(&self) -> (usize, usize) {
        (self.config.n_ctx, self.config.d_latent)
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn embed_prompt(&self, prompt: &str) -> Result<Tensor> {
        let tokens = self.tokenize(prompt)?;
        let input_ids = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        let pooled = self.clip.forward(&input_ids)?;
        let embedding = self
            .text_projection
            .forward(&pooled)?
            .to_dtype(DType::F32)?;
        let norm = embedding.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?;
        Ok(embedding.broadcast_div(&norm)?)
    }

    fn forward(&self, x_t: &Tensor, t: &Tensor, cond: &Tensor) -> Result<Tensor> {
        let out = self.transformer.forward(
            &x_t.to_dtype(self.dtype)?,
            t,
            &cond.to_dtype(self.dtype)?,
        )?;
        Ok(out.to_dtype(DType::F32)?)
    }
}

pub struct Text300MLoader;

impl Loader for Text300MLoader {
    type Model = Text300M;

    async fn load(sources: &ModelSources, device: &Device) -> Result<Self::Model> {
        let dtype = if device.is_cuda() {
            DType::F16
        } else {
            DType::F32
        };

        let config: Text300MConfig = sources
            .shap_e
            .read_json("text300M.json")
            .await
            .context("failed to read text300M config")?;
        let model_file = sources
            .shap_e
            .get("text300M.safetensors")
            .await
            .context("failed to get text300M weights")?;
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[model_file], dtype, device)
                .context("failed to build text300M var builder")?
        };
        let transformer =
            LatentTransformer::new(&config, vb).context("failed to load text300M")?;

        let clip_model_file = sources
            .clip
            .get("model.safetensors")
            .await
            .context("failed to get CLIP model file")?;
        let clip_vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[clip_model_file], dtype, device)
                .context("failed to build CLIP var builder")?
        };
        let clip = ClipTextTransformer::new(
            clip_vb.pp("text_model"),
            &clip_config(config.clip_dim, config.max_text_tokens),
        )
        .context("failed to load CLIP model")?;
        let text_projection = linear_no_bias(768, config.clip_dim, clip_vb.pp("text_projection"))
            .context("failed to load CLIP text projection")?;
        let tokenizer_file = sources
            .clip
            .get("tokenizer.json")
            .await
            .context("failed to get CLIP tokenizer")?;
        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;

        Ok(Text300M {
            config,
            tokenizer,
            clip,
            text_projection,
            transformer,
            device: device.clone(),
            dtype,
        })
    }
}
