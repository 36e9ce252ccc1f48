//! Latent decoder: a latent is projected into the weights of a small MLP
//! that maps positions to a signed distance and a colour. The zero level set
//! of that field is the generated surface.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{layer_norm, LayerNorm, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::marching::{marching_tetrahedra, Grid};
use crate::{LatentDecoder, Loader, ModelSources, TriMesh};

/// SDF plus RGB logits.
const FIELD_CHANNELS: usize = 4;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TransmitterConfig {
    pub n_ctx: usize,
    pub d_latent: usize,
    #[serde(default = "default_hidden")]
    pub hidden: usize,
    #[serde(default = "default_depth")]
    pub depth: usize,
    #[serde(default = "default_posenc_octaves")]
    pub posenc_octaves: usize,
    #[serde(default = "default_grid_size")]
    pub grid_size: usize,
    #[serde(default = "default_bbox_min")]
    pub bbox_min: [f32; 3],
    #[serde(default = "default_bbox_max")]
    pub bbox_max: [f32; 3],
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

fn default_hidden() -> usize {
    256
}
fn default_depth() -> usize {
    4
}
fn default_posenc_octaves() -> usize {
    8
}
fn default_grid_size() -> usize {
    128
}
fn default_bbox_min() -> [f32; 3] {
    [-1.0; 3]
}
fn default_bbox_max() -> [f32; 3] {
    [1.0; 3]
}
fn default_chunk_size() -> usize {
    1 << 16
}

impl TransmitterConfig {
    pub fn transmitter() -> Self {
        Self {
            n_ctx: 1024,
            d_latent: 1024,
            hidden: default_hidden(),
            depth: default_depth(),
            posenc_octaves: default_posenc_octaves(),
            grid_size: default_grid_size(),
            bbox_min: default_bbox_min(),
            bbox_max: default_bbox_max(),
            chunk_size: default_chunk_size(),
        }
    }

    fn input_dim(&self) -> usize {
        3 + 6 * self.posenc_octaves
    }

    /// `(d_in, d_out)` of every latent-derived MLP layer.
    fn layer_dims(&self) -> Vec<(usize, usize)> {
        (0..self.depth)
            .map(|i| {
                let d_in = if i == 0 { self.input_dim() } else { self.hidden };
                let d_out = if i + 1 == self.depth {
                    FIELD_CHANNELS
                } else {
                    self.hidden
                };
                (d_in, d_out)
            })
            .collect()
    }

    fn validate(&self) -> Result<()> {
        if self.depth == 0 {
            anyhow::bail!("transmitter needs at least one MLP layer");
        }
        if self.chunk_size == 0 {
            anyhow::bail!("chunk_size must be positive");
        }
        let rows: usize = self.layer_dims().iter().map(|(_, d_out)| d_out).sum();
        if rows > self.n_ctx {
            anyhow::bail!(
                "MLP needs {rows} latent rows but latents only have {}",
                self.n_ctx
            );
        }
        Ok(())
    }
}

/// Projects a block of latent rows into one weight matrix.
struct ChannelsProj {
    weight: Tensor,
    bias: Tensor,
    norm: LayerNorm,
}

impl ChannelsProj {
    fn new(vectors: usize, channels: usize, d_latent: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            weight: vb.get((vectors, channels, d_latent), "weight")?,
            bias: vb.get((vectors, channels), "bias")?,
            norm: layer_norm(channels, 1e-5, vb.pp("norm"))?,
        })
    }

    /// `(vectors, d_latent)` rows to a `(vectors, channels)` matrix.
    fn forward(&self, rows: &Tensor) -> Result<Tensor> {
        let projected = self
            .weight
            .matmul(&rows.unsqueeze(2)?.contiguous()?)?
            .squeeze(2)?;
        Ok(self.norm.forward(&(projected + &self.bias)?)?)
    }
}

/// Maps `(m, 3)` positions to `(m, 4)` outputs: signed distance (negative
/// inside) followed by RGB logits.
pub(crate) trait FieldQuery {
    fn query(&self, points: &Tensor) -> Result<Tensor>;
}

struct ImplicitField {
    layers: Vec<(Tensor, Tensor)>,
    scales: Option<Tensor>,
}

impl ImplicitField {
    fn encode(&self, points: &Tensor) -> Result<Tensor> {
        let Some(scales) = &self.scales else {
            return Ok(points.clone());
        };
        let scaled = points.unsqueeze(2)?.broadcast_mul(scales)?.flatten_from(1)?;
        Ok(Tensor::cat(&[points, &scaled.sin()?, &scaled.cos()?], 1)?)
    }
}

impl FieldQuery for ImplicitField {
    fn query(&self, points: &Tensor) -> Result<Tensor> {
        let mut h = self.encode(points)?;
        let last = self.layers.len() - 1;
        for (i, (weight, bias)) in self.layers.iter().enumerate() {
            h = h.matmul(&weight.t()?)?.broadcast_add(bias)?;
            if i < last {
                h = h.silu()?;
            }
        }
        Ok(h)
    }
}

pub(crate) fn extract_mesh(
    field: &impl FieldQuery,
    grid: &Grid,
    chunk_size: usize,
    device: &Device,
) -> Result<TriMesh> {
    let points = grid.points();
    let mut sdf = Vec::with_capacity(points.len());
    for chunk in points.chunks(chunk_size) {
        let out = field.query(&points_tensor(chunk, device)?)?;
        sdf.extend(out.narrow(1, 0, 1)?.flatten_all()?.to_vec1::<f32>()?);
    }

    let mesh = marching_tetrahedra(grid, &sdf, 0.0)?;

    let mut colors = Vec::with_capacity(mesh.verts.len());
    for chunk in mesh.verts.chunks(chunk_size) {
        let out = field.query(&points_tensor(chunk, device)?)?;
        let rgb = candle_nn::ops::sigmoid(&out.narrow(1, 1, 3)?)?.to_vec2::<f32>()?;
        colors.extend(rgb.into_iter().map(|c| [c[0], c[1], c[2]]));
    }
    mesh.with_vertex_colors(colors)
}

fn points_tensor(points: &[[f32; 3]], device: &Device) -> Result<Tensor> {
    let flat: Vec<f32> = points.iter().flatten().copied().collect();
    Ok(Tensor::from_vec(flat, (points.len(), 3), device)?)
}

pub struct Transmitter {
    config: TransmitterConfig,
    params_proj: Vec<ChannelsProj>,
    biases: Vec<Tensor>,
    device: Device,
}

impl Transmitter {
    pub fn new(config: TransmitterConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let mut params_proj = Vec::with_capacity(config.depth);
        let mut biases = Vec::with_capacity(config.depth);
        for (i, (d_in, d_out)) in config.layer_dims().into_iter().enumerate() {
            params_proj.push(ChannelsProj::new(
                d_out,
                d_in,
                config.d_latent,
                vb.pp(format!("params_proj.{i}")),
            )?);
            biases.push(vb.get(d_out, &format!("mlp.{i}.bias"))?);
        }
        Ok(Self {
            device: vb.device().clone(),
            config,
            params_proj,
            biases,
        })
    }

    fn field(&self, latent: &Tensor) -> Result<ImplicitField> {
        let mut layers = Vec::with_capacity(self.params_proj.len());
        let mut offset = 0;
        for (proj, bias) in self.params_proj.iter().zip(&self.biases) {
            let vectors = proj.bias.dim(0)?;
            let weight = proj.forward(&latent.narrow(0, offset, vectors)?)?;
            layers.push((weight, bias.clone()));
            offset += vectors;
        }

        let scales = match self.config.posenc_octaves {
            0 => None,
            octaves => {
                let scales: Vec<f32> = (0..octaves).map(|k| (1u32 << k) as f32).collect();
                Some(Tensor::from_vec(scales, (1, 1, octaves), &self.device)?)
            }
        };
        Ok(ImplicitField { layers, scales })
    }
}

impl LatentDecoder for Transmitter {
    fn latent_shape(&self) -> (usize, usize) {
        (self.config.n_ctx, self.config.d_latent)
    }

    fn decode_mesh(&self, latent: &Tensor) -> Result<TriMesh> {
        let latent = match latent.rank() {
            3 => latent.get(0)?,
            _ => latent.clone(),
        };
        let latent = latent
            .to_device(&self.device)?
            .to_dtype(DType::F32)?
            .reshape(self.latent_shape())
            .context("latent does not match the transmitter's shape")?;

        let field = self.field(&latent)?;
        let grid = Grid::new(
            self.config.grid_size,
            self.config.bbox_min,
            self.config.bbox_max,
        )?;
        extract_mesh(&field, &grid, self.config.chunk_size, &self.device)
    }
}

pub struct TransmitterLoader;

impl Loader for TransmitterLoader {
    type Model = Transmitter;

    async fn load(sources: &ModelSources, device: &Device) -> Result<Self::Model> {
        let config: TransmitterConfig = sources
            .shap_e
            .read_json("transmitter.json")
            .await
            .context("failed to read transmitter config")?;
        let weights = sources
            .shap_e
            .get("transmitter.safetensors")
            .await
            .context("failed to get transmitter weights")?;
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, device)
                .context("failed to build transmitter var builder")?
        };
        Transmitter::new(config, vb).context("failed to load transmitter")
    }
}
