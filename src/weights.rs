// src/weights.rs
//! Weight tables.
//!
//! [`HostWeights`] is the borrowed view the external model parser hands to
//! `prepare`: raw quantized bytes for every matrix, f32 slices for norm
//! weights and biases, all matrices row-major `[n_out][n_in]`.
//! [`DeviceWeights`] is the device-resident mirror created by [`upload`],
//! which also validates every slice length against the config and enforces a
//! single weight format across all matrices.

use crate::config::{Arch, ModelConfig, WeightType};
use crate::cuda::{CudaContext, DeviceBytes, DeviceF32};
use anyhow::{bail, Result};
use log::debug;

#[derive(Debug, Clone, Copy)]
pub struct HostTensor<'a> {
    pub data: &'a [u8],
    pub ty: WeightType,
}

#[derive(Debug, Clone, Copy)]
pub struct HostExpert<'a> {
    pub w1: HostTensor<'a>,
    pub w2: HostTensor<'a>,
    pub w3: HostTensor<'a>,
}

#[derive(Debug, Clone)]
pub struct HostLayer<'a> {
    /// Pre-attention norm weight. For parallel-branch architectures this is
    /// the single shared LayerNorm of the layer.
    pub norm_att: Option<&'a [f32]>,
    /// Pre-FFN norm weight; absent for parallel-branch architectures.
    pub norm_ffn: Option<&'a [f32]>,
    pub wq: HostTensor<'a>,
    pub wk: HostTensor<'a>,
    pub wv: HostTensor<'a>,
    pub wo: HostTensor<'a>,
    pub bq: Option<&'a [f32]>,
    pub bk: Option<&'a [f32]>,
    pub bv: Option<&'a [f32]>,
    /// Dense FFN projections; absent when the layer routes through experts.
    pub w1: Option<HostTensor<'a>>,
    pub w2: Option<HostTensor<'a>>,
    pub w3: Option<HostTensor<'a>>,
    pub b1: Option<&'a [f32]>,
    pub b2: Option<&'a [f32]>,
    pub moe_gate: Option<HostTensor<'a>>,
    pub experts: Vec<HostExpert<'a>>,
}

#[derive(Debug, Clone)]
pub struct HostWeights<'a> {
    pub token_embedding: HostTensor<'a>,
    pub layers: Vec<HostLayer<'a>>,
    pub final_norm: Option<&'a [f32]>,
    pub wcls: HostTensor<'a>,
    pub bcls: Option<&'a [f32]>,
}

#[derive(Debug)]
pub struct DeviceTensor {
    pub data: DeviceBytes,
    pub ty: WeightType,
    pub rows: usize,
    pub cols: usize,
}

#[derive(Debug)]
pub struct DeviceExpert {
    pub w1: DeviceTensor,
    pub w2: DeviceTensor,
    pub w3: DeviceTensor,
}

#[derive(Debug)]
pub struct DeviceLayer {
    pub norm_att: Option<DeviceF32>,
    pub norm_ffn: Option<DeviceF32>,
    pub wq: DeviceTensor,
    pub wk: DeviceTensor,
    pub wv: DeviceTensor,
    pub wo: DeviceTensor,
    pub bq: Option<DeviceF32>,
    pub bk: Option<DeviceF32>,
    pub bv: Option<DeviceF32>,
    pub w1: Option<DeviceTensor>,
    pub w2: Option<DeviceTensor>,
    pub w3: Option<DeviceTensor>,
    pub b1: Option<DeviceF32>,
    pub b2: Option<DeviceF32>,
    pub moe_gate: Option<DeviceTensor>,
    pub experts: Vec<DeviceExpert>,
    /// Device arrays of per-expert weight pointers, indexed by the routing
    /// kernel after top-k selection.
    #[cfg(feature = "cuda")]
    pub expert_ptrs: Option<[DeviceBytes; 3]>,
}

#[derive(Debug)]
pub struct DeviceWeights {
    pub weight_ty: WeightType,
    pub token_embedding: DeviceTensor,
    pub layers: Vec<DeviceLayer>,
    pub final_norm: Option<DeviceF32>,
    pub wcls: DeviceTensor,
    pub bcls: Option<DeviceF32>,
    /// Total weight element count.
    pub n_params: u64,
    /// Total device bytes occupied by weights.
    pub n_bytes: u64,
}

struct Uploader<'c> {
    ctx: &'c CudaContext,
    weight_ty: WeightType,
    n_params: u64,
    n_bytes: u64,
}

impl<'c> Uploader<'c> {
    fn matrix(&mut self, name: &str, t: HostTensor<'_>, rows: usize, cols: usize) -> Result<DeviceTensor> {
        if t.ty != self.weight_ty {
            bail!(
                "{}: weight format {:?} differs from model format {:?}",
                name,
                t.ty,
                self.weight_ty
            );
        }
        let expect = t.ty.bytes_for(rows * cols);
        if t.data.len() != expect {
            bail!(
                "{}: expected {} bytes for [{} x {}] {:?}, got {}",
                name,
                expect,
                rows,
                cols,
                t.ty,
                t.data.len()
            );
        }
        self.n_params += (rows * cols) as u64;
        self.n_bytes += t.data.len() as u64;
        Ok(DeviceTensor {
            data: self.ctx.upload_bytes(t.data)?,
            ty: t.ty,
            rows,
            cols,
        })
    }

    fn vector(&mut self, name: &str, v: Option<&[f32]>, len: usize) -> Result<Option<DeviceF32>> {
        match v {
            None => Ok(None),
            Some(v) => {
                if v.len() != len {
                    bail!("{}: expected {} elements, got {}", name, len, v.len());
                }
                self.n_params += len as u64;
                self.n_bytes += (len * 4) as u64;
                Ok(Some(self.ctx.upload_f32(v)?))
            }
        }
    }

    fn required_vector(&mut self, name: &str, v: Option<&[f32]>, len: usize) -> Result<DeviceF32> {
        match self.vector(name, v, len)? {
            Some(d) => Ok(d),
            None => bail!("{} is required for this architecture", name),
        }
    }
}

/// Upload every weight block to the device and validate shapes. Device
/// allocations persist for the process lifetime.
pub fn upload(ctx: &CudaContext, config: &ModelConfig, hw: &HostWeights<'_>) -> Result<DeviceWeights> {
    if hw.layers.len() != config.n_layers {
        bail!(
            "weight table has {} layers, config says {}",
            hw.layers.len(),
            config.n_layers
        );
    }

    let dim = config.dim;
    let hidden = config.hidden_dim;
    let q_dim = config.q_dim();
    let kv_dim = config.kv_dim();
    let mut up = Uploader {
        ctx,
        weight_ty: hw.token_embedding.ty,
        n_params: 0,
        n_bytes: 0,
    };

    let token_embedding = up.matrix("token_embedding", hw.token_embedding, config.vocab_size, dim)?;

    let mut layers = Vec::with_capacity(config.n_layers);
    for (l, hl) in hw.layers.iter().enumerate() {
        let norm_att = up.vector(&format!("layer {l} norm_att"), hl.norm_att, dim)?;
        let norm_ffn = up.vector(&format!("layer {l} norm_ffn"), hl.norm_ffn, dim)?;
        if !config.arch.uses_layernorm() {
            if norm_att.is_none() || norm_ffn.is_none() {
                bail!("layer {l}: RMSNorm weights are required for {:?}", config.arch);
            }
        } else if config.arch.parallel_branches() && norm_ffn.is_some() {
            bail!("layer {l}: parallel-branch layers carry a single shared norm");
        }

        let wq = up.matrix(&format!("layer {l} wq"), hl.wq, q_dim, dim)?;
        let wk = up.matrix(&format!("layer {l} wk"), hl.wk, kv_dim, dim)?;
        let wv = up.matrix(&format!("layer {l} wv"), hl.wv, kv_dim, dim)?;
        let wo = up.matrix(&format!("layer {l} wo"), hl.wo, dim, q_dim)?;
        let bq = up.vector(&format!("layer {l} bq"), hl.bq, q_dim)?;
        let bk = up.vector(&format!("layer {l} bk"), hl.bk, kv_dim)?;
        let bv = up.vector(&format!("layer {l} bv"), hl.bv, kv_dim)?;

        let mut layer = DeviceLayer {
            norm_att,
            norm_ffn,
            wq,
            wk,
            wv,
            wo,
            bq,
            bk,
            bv,
            w1: None,
            w2: None,
            w3: None,
            b1: up.vector(&format!("layer {l} b1"), hl.b1, hidden)?,
            b2: up.vector(&format!("layer {l} b2"), hl.b2, dim)?,
            moe_gate: None,
            experts: Vec::new(),
            #[cfg(feature = "cuda")]
            expert_ptrs: None,
        };

        if config.is_moe() {
            let gate = match hl.moe_gate {
                Some(g) => g,
                None => bail!("layer {l}: expert gate matrix is required for MoE"),
            };
            layer.moe_gate = Some(up.matrix(&format!("layer {l} moe_gate"), gate, config.n_experts, dim)?);
            if hl.experts.len() != config.n_experts {
                bail!(
                    "layer {l}: {} expert weight sets, config says {}",
                    hl.experts.len(),
                    config.n_experts
                );
            }
            for (e, he) in hl.experts.iter().enumerate() {
                layer.experts.push(DeviceExpert {
                    w1: up.matrix(&format!("layer {l} expert {e} w1"), he.w1, hidden, dim)?,
                    w2: up.matrix(&format!("layer {l} expert {e} w2"), he.w2, dim, hidden)?,
                    w3: up.matrix(&format!("layer {l} expert {e} w3"), he.w3, hidden, dim)?,
                });
            }
            #[cfg(feature = "cuda")]
            {
                layer.expert_ptrs = Some(upload_expert_ptrs(ctx, &layer.experts)?);
            }
        } else {
            let (w1, w2) = match (hl.w1, hl.w2) {
                (Some(w1), Some(w2)) => (w1, w2),
                _ => bail!("layer {l}: dense FFN requires w1 and w2"),
            };
            layer.w1 = Some(up.matrix(&format!("layer {l} w1"), w1, hidden, dim)?);
            layer.w2 = Some(up.matrix(&format!("layer {l} w2"), w2, dim, hidden)?);
            if config.arch.ungated_ffn() {
                if hl.w3.is_some() {
                    bail!("layer {l}: {:?} uses a single-branch FFN, w3 must be absent", config.arch);
                }
            } else {
                let w3 = match hl.w3 {
                    Some(w3) => w3,
                    None => bail!("layer {l}: gated FFN requires w3"),
                };
                layer.w3 = Some(up.matrix(&format!("layer {l} w3"), w3, hidden, dim)?);
            }
        }
        layers.push(layer);
    }

    let final_norm = if config.arch.uses_layernorm() {
        up.vector("final_norm", hw.final_norm, dim)?
    } else {
        Some(up.required_vector("final_norm", hw.final_norm, dim)?)
    };
    let wcls = up.matrix("wcls", hw.wcls, config.vocab_size, dim)?;
    let bcls = up.vector("bcls", hw.bcls, config.vocab_size)?;

    debug!(
        "uploaded {} params ({} MiB) as {:?}",
        up.n_params,
        up.n_bytes / (1024 * 1024),
        up.weight_ty
    );

    Ok(DeviceWeights {
        weight_ty: up.weight_ty,
        token_embedding,
        layers,
        final_norm,
        wcls,
        bcls,
        n_params: up.n_params,
        n_bytes: up.n_bytes,
    })
}

#[cfg(feature = "cuda")]
fn upload_expert_ptrs(ctx: &CudaContext, experts: &[DeviceExpert]) -> Result<[DeviceBytes; 3]> {
    let mut w1 = Vec::with_capacity(experts.len() * 8);
    let mut w2 = Vec::with_capacity(experts.len() * 8);
    let mut w3 = Vec::with_capacity(experts.len() * 8);
    for e in experts {
        w1.extend_from_slice(&(e.w1.data.ptr() as u64).to_le_bytes());
        w2.extend_from_slice(&(e.w2.data.ptr() as u64).to_le_bytes());
        w3.extend_from_slice(&(e.w3.data.ptr() as u64).to_le_bytes());
    }
    Ok([
        ctx.upload_bytes(&w1)?,
        ctx.upload_bytes(&w2)?,
        ctx.upload_bytes(&w3)?,
    ])
}

impl Arch {
    /// Numeric id shared with the GPU side.
    pub fn device_tag(self) -> i32 {
        match self {
            Arch::LlamaLike => 0,
            Arch::Qwen => 1,
            Arch::Phi => 2,
            Arch::Mixtral => 3,
            Arch::Olmo => 4,
            Arch::Gemma => 5,
        }
    }
}
