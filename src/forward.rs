// src/forward.rs
//! The forward driver: per-token, single-stream execution of the full
//! decoder stack, dispatching the architecture-specific sequence of norms,
//! attention and FFN variants and accumulating into the residual stream.
//!
//! `Transformer::forward` runs either the multi-kernel driver below or the
//! cooperative fused path in [`crate::coop`]. Both share the position math in
//! [`crate::kvcache`] and dispatch on the `(weight, kv)` format pair resolved
//! at prepare time.

use crate::config::{ForwardFlags, KvType, ModelConfig};
use crate::coop;
use crate::cuda::{CudaContext, DeviceF32};
use crate::kvcache::{kv_positions, KvCache};
use crate::weights::{upload, DeviceWeights, HostWeights};
use anyhow::{anyhow, bail, Result};
use log::debug;

#[cfg(not(feature = "cuda"))]
use crate::config::WeightType;
#[cfg(not(feature = "cuda"))]
use crate::kernels::{
    embed_gather, ffn_gate, layernorm, matvec, matvec_scaled_add, moe_select, rmsnorm, rope_freq,
    softmax_exp,
};
#[cfg(not(feature = "cuda"))]
use crate::weights::DeviceLayer;
#[cfg(not(feature = "cuda"))]
use rayon::prelude::*;

/// Scratch activations for one in-flight forward pass. Allocated once at
/// prepare time; exclusively owned by the single forward call in flight.
#[derive(Debug)]
pub struct RunState {
    /// Residual stream (dim).
    pub(crate) x: DeviceF32,
    /// Normalized input to attention / FFN (dim).
    pub(crate) xb: DeviceF32,
    /// Parallel-branch MLP accumulator (dim).
    pub(crate) xa: DeviceF32,
    /// FFN hidden activation (hidden_dim).
    pub(crate) hb: DeviceF32,
    /// Per-active-expert hidden activations (n_experts_active * hidden_dim).
    pub(crate) he: DeviceF32,
    /// Query vector, overwritten with the attention context (n_heads * head_dim).
    pub(crate) q: DeviceF32,
    /// Attention scores (n_heads * seq_len).
    pub(crate) att: DeviceF32,
    /// MoE routing scratch (n_experts + 2 * n_experts_active).
    pub(crate) exp: DeviceF32,
    /// Output logits (vocab_size).
    pub(crate) logits: DeviceF32,
    #[cfg(feature = "cuda")]
    pub(crate) logits_host: Vec<f32>,
}

impl RunState {
    fn new(ctx: &CudaContext, config: &ModelConfig) -> Result<Self> {
        Ok(Self {
            x: ctx.alloc_f32(config.dim)?,
            xb: ctx.alloc_f32(config.dim)?,
            xa: ctx.alloc_f32(config.dim)?,
            hb: ctx.alloc_f32(config.hidden_dim)?,
            he: ctx.alloc_f32(config.n_experts_active * config.hidden_dim)?,
            q: ctx.alloc_f32(config.q_dim())?,
            att: ctx.alloc_f32(config.n_heads * config.seq_len)?,
            exp: ctx.alloc_f32(config.n_experts + 2 * config.n_experts_active)?,
            logits: ctx.alloc_f32(config.vocab_size)?,
            #[cfg(feature = "cuda")]
            logits_host: vec![0.0; config.vocab_size],
        })
    }
}

/// A prepared model: device-resident weights, run state and KV cache.
#[derive(Debug)]
pub struct Transformer {
    pub(crate) config: ModelConfig,
    pub(crate) weights: DeviceWeights,
    pub(crate) state: RunState,
    pub(crate) kv: KvCache,
    pub(crate) ctx: CudaContext,
    n_forward: u64,
}

impl Transformer {
    /// Validate the config, upload all weights and allocate run state and the
    /// KV cache. Any failure here is unrecoverable for the session.
    pub fn prepare(config: ModelConfig, weights: &HostWeights<'_>, kv_type: KvType) -> Result<Self> {
        config.validate()?;
        let ctx = CudaContext::new(-1)?;
        let device_weights = upload(&ctx, &config, weights)?;
        let state = RunState::new(&ctx, &config)?;
        let kv = KvCache::new(&ctx, &config, kv_type)?;
        #[cfg(feature = "cuda")]
        coop::upload_layer_table(&ctx, &device_weights)?;
        debug!(
            "prepared {:?} model: {} layers, dim {}, {} params, kv {:?}",
            config.arch, config.n_layers, config.dim, device_weights.n_params, kv_type
        );
        Ok(Self {
            config,
            weights: device_weights,
            state,
            kv,
            ctx,
            n_forward: 0,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn n_params(&self) -> u64 {
        self.weights.n_params
    }

    pub fn n_bytes(&self) -> u64 {
        self.weights.n_bytes
    }

    pub fn n_forward(&self) -> u64 {
        self.n_forward
    }

    /// `(kv_sink, kv_pos, kv_len)` the driver will use for `pos`.
    pub fn kv_positions(&self, pos: u32) -> (u32, u32, u32) {
        kv_positions(pos, self.config.seq_len as u32)
    }

    /// One forward pass. Returns the logits slice, or `None` when
    /// `UPDATE_KV_ONLY` is set (prompt pre-fill).
    ///
    /// The caller must advance `pos` by exactly one per call once the cache
    /// has wrapped; sink re-rotation assumes single-step advancement.
    pub fn forward(&mut self, token: u32, pos: u32, flags: ForwardFlags) -> Result<Option<&[f32]>> {
        let fused = self.config.arch.supports_fused() && coop::requested();
        self.forward_with_mode(token, pos, flags, fused)
    }

    /// Forward with an explicit driver choice; `fused` requires an
    /// architecture the cooperative kernel supports.
    pub fn forward_with_mode(
        &mut self,
        token: u32,
        pos: u32,
        flags: ForwardFlags,
        fused: bool,
    ) -> Result<Option<&[f32]>> {
        flags.validate()?;
        if token as usize >= self.config.vocab_size {
            bail!(
                "token {} out of range for vocab_size {}",
                token,
                self.config.vocab_size
            );
        }
        if fused && !self.config.arch.supports_fused() {
            bail!(
                "cooperative fused path does not support {:?}",
                self.config.arch
            );
        }
        self.n_forward += 1;
        if fused {
            coop::forward_fused(self, token, pos, flags)
        } else {
            self.forward_kernels(token, pos, flags)
        }
    }
}

pub(crate) fn required<'a>(v: &'a Option<DeviceF32>, what: &str) -> Result<&'a DeviceF32> {
    v.as_ref()
        .ok_or_else(|| anyhow!("{} weights missing", what))
}

// ---------------------------------------------------------------------------
// Host (reference) driver
// ---------------------------------------------------------------------------

#[cfg(not(feature = "cuda"))]
impl Transformer {
    fn forward_kernels(
        &mut self,
        token: u32,
        pos: u32,
        flags: ForwardFlags,
    ) -> Result<Option<&[f32]>> {
        let Transformer {
            config,
            weights,
            state,
            kv,
            ..
        } = self;
        let cfg: &ModelConfig = config;
        let wt = weights.weight_ty;
        let eps = cfg.norm_eps;
        let (kv_sink, kv_pos, kv_len) = kv_positions(pos, cfg.seq_len as u32);

        let RunState {
            x,
            xb,
            xa,
            hb,
            he,
            q,
            att,
            exp,
            logits,
        } = state;
        let x = x.as_mut_slice();
        let xb = xb.as_mut_slice();
        let xa = xa.as_mut_slice();
        let hb = hb.as_mut_slice();
        let he = he.as_mut_slice();
        let q = q.as_mut_slice();
        let att = att.as_mut_slice();
        let exp = exp.as_mut_slice();
        let logits = logits.as_mut_slice();

        embed_gather(
            x,
            weights.token_embedding.data.as_slice(),
            wt,
            token as usize,
            cfg.embed_scale,
        );

        if kv_sink > 0 {
            kv.rotate_sinks(kv_sink);
        }

        for l in 0..cfg.n_layers {
            let layer = &weights.layers[l];

            // pre-attention norm (shared norm for parallel branches)
            if cfg.arch.uses_layernorm() {
                let acc = (cfg.arch.parallel_branches() && l > 0).then_some(&*xa);
                let w = layer.norm_att.as_ref().map(|w| w.as_slice());
                layernorm(xb, x, acc, w, eps);
            } else {
                rmsnorm(xb, x, required(&layer.norm_att, "attention norm")?.as_slice(), eps);
            }

            qkv_rope_host(cfg, layer, wt, kv, l, xb, q, pos, kv_pos);

            if flags.update_kv_only() && l == cfg.n_layers - 1 {
                return Ok(None);
            }

            attention_host(cfg, kv, l, q, att, kv_len as usize);

            // attention output projection with residual
            matvec(x, layer.wo.data.as_slice(), wt, q, None, true);

            if cfg.arch.parallel_branches() {
                // MLP branch: reads the shared normalized input, accumulates
                // into xa which the next layer's norm folds back in
                let w1 = required_t(&layer.w1, "w1")?;
                let w2 = required_t(&layer.w2, "w2")?;
                ffn_gate(
                    hb,
                    xb,
                    w1.data.as_slice(),
                    None,
                    layer.b1.as_ref().map(|b| b.as_slice()),
                    wt,
                    true,
                );
                matvec(
                    xa,
                    w2.data.as_slice(),
                    wt,
                    hb,
                    layer.b2.as_ref().map(|b| b.as_slice()),
                    false,
                );
                continue;
            }

            // pre-FFN norm
            if cfg.arch.uses_layernorm() {
                let w = layer.norm_ffn.as_ref().map(|w| w.as_slice());
                layernorm(xb, x, None, w, eps);
            } else {
                rmsnorm(xb, x, required(&layer.norm_ffn, "FFN norm")?.as_slice(), eps);
            }

            if cfg.is_moe() {
                let gate = required_t(&layer.moe_gate, "moe_gate")?;
                matvec(&mut exp[..cfg.n_experts], gate.data.as_slice(), wt, xb, None, false);
                moe_select(exp, cfg.n_experts, cfg.n_experts_active);
                for a in 0..cfg.n_experts_active {
                    let weight = exp[cfg.n_experts + 2 * a];
                    let e = exp[cfg.n_experts + 2 * a + 1] as usize;
                    let expert = &layer.experts[e];
                    let he_a = &mut he[a * cfg.hidden_dim..(a + 1) * cfg.hidden_dim];
                    ffn_gate(
                        he_a,
                        xb,
                        expert.w1.data.as_slice(),
                        Some(expert.w3.data.as_slice()),
                        None,
                        wt,
                        false,
                    );
                    matvec_scaled_add(x, expert.w2.data.as_slice(), wt, he_a, weight);
                }
            } else {
                let w1 = required_t(&layer.w1, "w1")?;
                let w2 = required_t(&layer.w2, "w2")?;
                ffn_gate(
                    hb,
                    xb,
                    w1.data.as_slice(),
                    layer.w3.as_ref().map(|w| w.data.as_slice()),
                    layer.b1.as_ref().map(|b| b.as_slice()),
                    wt,
                    cfg.arch.gelu_ffn(),
                );
                matvec(x, w2.data.as_slice(), wt, hb, None, true);
            }
        }

        // final norm + classifier
        if cfg.arch.uses_layernorm() {
            let acc = cfg.arch.parallel_branches().then_some(&*xa);
            let w = weights.final_norm.as_ref().map(|w| w.as_slice());
            layernorm(xb, x, acc, w, eps);
        } else {
            rmsnorm(xb, x, required(&weights.final_norm, "final norm")?.as_slice(), eps);
        }
        matvec(
            logits,
            weights.wcls.data.as_slice(),
            wt,
            xb,
            weights.bcls.as_ref().map(|b| b.as_slice()),
            false,
        );

        Ok(Some(logits))
    }

    /// Residual stream after the last forward (reference path introspection).
    pub fn x(&self) -> &[f32] {
        self.state.x.as_slice()
    }

    /// Parallel-branch accumulator after the last forward.
    pub fn xa(&self) -> &[f32] {
        self.state.xa.as_slice()
    }

    /// Attention score buffer after the last forward.
    pub fn att(&self) -> &[f32] {
        self.state.att.as_slice()
    }

    /// Query buffer; holds the per-head attention context after a forward.
    pub fn q(&self) -> &[f32] {
        self.state.q.as_slice()
    }

    pub fn kv(&self) -> &KvCache {
        &self.kv
    }
}

#[cfg(not(feature = "cuda"))]
fn required_t<'a>(
    v: &'a Option<crate::weights::DeviceTensor>,
    what: &str,
) -> Result<&'a crate::weights::DeviceTensor> {
    v.as_ref().ok_or_else(|| anyhow!("{} weights missing", what))
}

/// Fused QKV projection + rotary embedding + KV-cache write for one token.
#[cfg(not(feature = "cuda"))]
#[allow(clippy::too_many_arguments)]
pub(crate) fn qkv_rope_host(
    cfg: &ModelConfig,
    layer: &DeviceLayer,
    wt: WeightType,
    kv: &mut KvCache,
    l: usize,
    xb: &[f32],
    q: &mut [f32],
    pos: u32,
    kv_pos: u32,
) {
    use crate::kernels::dot_row;

    let dh = cfg.head_dim;
    let theta = cfg.rope_theta;
    let wq = layer.wq.data.as_slice();
    let wk = layer.wk.data.as_slice();
    let wv = layer.wv.data.as_slice();
    let bq = layer.bq.as_ref().map(|b| b.as_slice());
    let bk = layer.bk.as_ref().map(|b| b.as_slice());
    let bv = layer.bv.as_ref().map(|b| b.as_slice());
    let t = kv_pos as usize;

    for j in (0..cfg.q_dim()).step_by(2) {
        let mut v0 = dot_row(wq, wt, j, xb);
        let mut v1 = dot_row(wq, wt, j + 1, xb);
        if let Some(b) = bq {
            v0 += b[j];
            v1 += b[j + 1];
        }
        let freq = rope_freq(j % dh, cfg.rotary_dim, theta);
        let (sin, cos) = (pos as f32 * freq).sin_cos();
        q[j] = v0 * cos - v1 * sin;
        q[j + 1] = v0 * sin + v1 * cos;
    }
    for j in (0..cfg.kv_dim()).step_by(2) {
        let mut v0 = dot_row(wk, wt, j, xb);
        let mut v1 = dot_row(wk, wt, j + 1, xb);
        if let Some(b) = bk {
            v0 += b[j];
            v1 += b[j + 1];
        }
        let freq = rope_freq(j % dh, cfg.rotary_dim, theta);
        let (sin, cos) = (pos as f32 * freq).sin_cos();
        kv.write_key(l, t, j, v0 * cos - v1 * sin);
        kv.write_key(l, t, j + 1, v0 * sin + v1 * cos);
    }
    // values are not rotated
    for j in 0..cfg.kv_dim() {
        let mut v = dot_row(wv, wt, j, xb);
        if let Some(b) = bv {
            v += b[j];
        }
        kv.write_value(l, t, j, v);
    }
}

/// Scaled dot-product scores, exponentiation, and softmax-weighted value mix.
/// The per-head context overwrites the query slot; normalization is folded
/// into the mix as a divide by the exponent sum.
#[cfg(not(feature = "cuda"))]
pub(crate) fn attention_host(
    cfg: &ModelConfig,
    kv: &KvCache,
    l: usize,
    q: &mut [f32],
    att: &mut [f32],
    kv_len: usize,
) {
    let dh = cfg.head_dim;
    let kv_mul = cfg.kv_mul();
    let smax = cfg.seq_len;
    let scale = 1.0 / (dh as f32).sqrt();

    q.par_chunks_mut(dh)
        .zip(att.par_chunks_mut(smax))
        .enumerate()
        .for_each(|(h, (qh, ah))| {
            let hk = h / kv_mul;
            for (t, a) in ah.iter_mut().take(kv_len).enumerate() {
                let mut dot = 0.0f32;
                for (i, &qv) in qh.iter().enumerate() {
                    dot += qv * kv.read_key(l, t, hk * dh + i);
                }
                *a = dot * scale;
            }
            softmax_exp(&mut ah[..kv_len]);
            let sum: f32 = ah[..kv_len].iter().sum();
            for (i, qv) in qh.iter_mut().enumerate() {
                let mut acc = 0.0f32;
                for (t, &a) in ah.iter().take(kv_len).enumerate() {
                    acc += a * kv.read_value(l, t, hk * dh + i);
                }
                *qv = acc / sum;
            }
        });
}

// ---------------------------------------------------------------------------
// Device driver
// ---------------------------------------------------------------------------

#[cfg(feature = "cuda")]
impl Transformer {
    fn forward_kernels(
        &mut self,
        token: u32,
        pos: u32,
        flags: ForwardFlags,
    ) -> Result<Option<&[f32]>> {
        use crate::cuda::ffi;
        use std::ffi::c_void;
        use std::ptr;

        let cfg = self.config.clone();
        let raw = self.ctx.raw();
        let kv_ty = self.kv.ty();
        let dbits = self.weights.weight_ty.dbits() as i32;
        let kvbits = kv_ty.kvbits() as i32;
        let (kv_sink, kv_pos, kv_len) = kv_positions(pos, cfg.seq_len as u32);

        let dim = cfg.dim as i32;
        let hidden = cfg.hidden_dim as i32;
        let q_dim = cfg.q_dim() as i32;
        let kv_dim = cfg.kv_dim() as i32;
        let head_dim = cfg.head_dim as i32;
        let smax = cfg.seq_len as i32;
        let n_heads = cfg.n_heads as i32;
        let kv_mul = cfg.kv_mul() as i32;
        let eps = cfg.norm_eps;

        let fv = |o: &Option<DeviceF32>| -> *const c_void {
            o.as_ref().map_or(ptr::null(), |v| v.ptr() as *const c_void)
        };
        let ck = CudaContext::check;

        unsafe {
            ck(
                ffi::warpllm_embed(
                    raw,
                    self.state.x.ptr(),
                    self.weights.token_embedding.data.ptr(),
                    token as i32,
                    dim,
                    dbits,
                    cfg.embed_scale,
                ),
                "embed",
            )?;

            if kv_sink > 0 {
                ck(
                    ffi::warpllm_sink_rotate(
                        raw,
                        self.kv.key_ptr(),
                        kvbits,
                        cfg.n_layers as i32,
                        kv_sink as i32,
                        kv_dim,
                        head_dim,
                        cfg.rotary_dim as i32,
                        cfg.rope_theta,
                        smax,
                    ),
                    "sink_rotate",
                )?;
            }

            for l in 0..cfg.n_layers {
                let layer = &self.weights.layers[l];
                let kc = (self.kv.key_ptr() as usize + kv_ty.bytes_for(self.kv.layer_offset(l)))
                    as *mut c_void;
                let vc = (self.kv.value_ptr() as usize + kv_ty.bytes_for(self.kv.layer_offset(l)))
                    as *mut c_void;

                if cfg.arch.uses_layernorm() {
                    let acc = if cfg.arch.parallel_branches() && l > 0 {
                        self.state.xa.ptr() as *const c_void
                    } else {
                        ptr::null()
                    };
                    ck(
                        ffi::warpllm_layernorm(
                            raw,
                            self.state.xb.ptr(),
                            self.state.x.ptr(),
                            acc,
                            fv(&layer.norm_att),
                            dim,
                            eps,
                        ),
                        "layernorm",
                    )?;
                } else {
                    ck(
                        ffi::warpllm_rmsnorm(
                            raw,
                            self.state.xb.ptr(),
                            self.state.x.ptr(),
                            required(&layer.norm_att, "attention norm")?.ptr(),
                            dim,
                            eps,
                        ),
                        "rmsnorm",
                    )?;
                }

                ck(
                    ffi::warpllm_qkv_rope(
                        raw,
                        self.state.q.ptr(),
                        kc,
                        vc,
                        self.state.xb.ptr(),
                        layer.wq.data.ptr(),
                        layer.wk.data.ptr(),
                        layer.wv.data.ptr(),
                        fv(&layer.bq),
                        fv(&layer.bk),
                        fv(&layer.bv),
                        dbits,
                        kvbits,
                        dim,
                        q_dim,
                        kv_dim,
                        head_dim,
                        cfg.rotary_dim as i32,
                        cfg.rope_theta,
                        pos as i32,
                        kv_pos as i32,
                        smax,
                    ),
                    "qkv_rope",
                )?;

                if flags.update_kv_only() && l == cfg.n_layers - 1 {
                    // stream-ordered: later forwards observe this KV write
                    return Ok(None);
                }

                ck(
                    ffi::warpllm_attn_score(
                        raw,
                        self.state.att.ptr(),
                        self.state.q.ptr(),
                        kc,
                        kvbits,
                        n_heads,
                        head_dim,
                        kv_mul,
                        kv_len as i32,
                        smax,
                    ),
                    "attn_score",
                )?;
                ck(
                    ffi::warpllm_attn_softmax(raw, self.state.att.ptr(), n_heads, kv_len as i32, smax),
                    "attn_softmax",
                )?;
                ck(
                    ffi::warpllm_attn_mix(
                        raw,
                        self.state.q.ptr(),
                        self.state.att.ptr(),
                        vc,
                        kvbits,
                        n_heads,
                        head_dim,
                        kv_mul,
                        kv_len as i32,
                        smax,
                    ),
                    "attn_mix",
                )?;
                ck(
                    ffi::warpllm_matvec(
                        raw,
                        self.state.x.ptr(),
                        layer.wo.data.ptr(),
                        self.state.q.ptr(),
                        q_dim,
                        dim,
                        dbits,
                        ptr::null(),
                        1,
                        1.0,
                        0,
                    ),
                    "attn_out",
                )?;

                if cfg.arch.parallel_branches() {
                    let w1 = layer.w1.as_ref().ok_or_else(|| anyhow!("w1 missing"))?;
                    let w2 = layer.w2.as_ref().ok_or_else(|| anyhow!("w2 missing"))?;
                    ck(ffi::warpllm_stream_fork(raw), "stream_fork")?;
                    ck(
                        ffi::warpllm_ffn_gated(
                            raw,
                            self.state.hb.ptr(),
                            self.state.xb.ptr(),
                            w1.data.ptr(),
                            ptr::null(),
                            fv(&layer.b1),
                            dbits,
                            dim,
                            hidden,
                            1,
                            1,
                        ),
                        "ffn_up",
                    )?;
                    ck(
                        ffi::warpllm_matvec(
                            raw,
                            self.state.xa.ptr(),
                            w2.data.ptr(),
                            self.state.hb.ptr(),
                            hidden,
                            dim,
                            dbits,
                            fv(&layer.b2),
                            0,
                            1.0,
                            1,
                        ),
                        "ffn_down",
                    )?;
                    ck(ffi::warpllm_stream_join(raw), "stream_join")?;
                    continue;
                }

                if cfg.arch.uses_layernorm() {
                    ck(
                        ffi::warpllm_layernorm(
                            raw,
                            self.state.xb.ptr(),
                            self.state.x.ptr(),
                            ptr::null(),
                            fv(&layer.norm_ffn),
                            dim,
                            eps,
                        ),
                        "layernorm",
                    )?;
                } else {
                    ck(
                        ffi::warpllm_rmsnorm(
                            raw,
                            self.state.xb.ptr(),
                            self.state.x.ptr(),
                            required(&layer.norm_ffn, "FFN norm")?.ptr(),
                            dim,
                            eps,
                        ),
                        "rmsnorm",
                    )?;
                }

                if cfg.is_moe() {
                    let gate = layer
                        .moe_gate
                        .as_ref()
                        .ok_or_else(|| anyhow!("moe_gate missing"))?;
                    let ptrs = layer
                        .expert_ptrs
                        .as_ref()
                        .ok_or_else(|| anyhow!("expert pointer table missing"))?;
                    ck(
                        ffi::warpllm_moe_gate(
                            raw,
                            self.state.exp.ptr(),
                            self.state.xb.ptr(),
                            gate.data.ptr(),
                            dbits,
                            dim,
                            cfg.n_experts as i32,
                            cfg.n_experts_active as i32,
                        ),
                        "moe_gate",
                    )?;
                    for a in 0..cfg.n_experts_active {
                        let he_a = (self.state.he.ptr() as usize + a * cfg.hidden_dim * 4)
                            as *mut c_void;
                        ck(
                            ffi::warpllm_moe_ffn(
                                raw,
                                he_a,
                                self.state.xb.ptr(),
                                ptrs[0].ptr(),
                                ptrs[2].ptr(),
                                self.state.exp.ptr(),
                                a as i32,
                                dbits,
                                dim,
                                hidden,
                                cfg.n_experts as i32,
                            ),
                            "moe_ffn",
                        )?;
                        ck(
                            ffi::warpllm_moe_down(
                                raw,
                                self.state.x.ptr(),
                                he_a,
                                ptrs[1].ptr(),
                                self.state.exp.ptr(),
                                a as i32,
                                dbits,
                                hidden,
                                dim,
                                cfg.n_experts as i32,
                            ),
                            "moe_down",
                        )?;
                    }
                } else {
                    let w1 = layer.w1.as_ref().ok_or_else(|| anyhow!("w1 missing"))?;
                    let w2 = layer.w2.as_ref().ok_or_else(|| anyhow!("w2 missing"))?;
                    ck(
                        ffi::warpllm_ffn_gated(
                            raw,
                            self.state.hb.ptr(),
                            self.state.xb.ptr(),
                            w1.data.ptr(),
                            layer.w3.as_ref().map_or(ptr::null(), |w| {
                                w.data.ptr() as *const c_void
                            }),
                            fv(&layer.b1),
                            dbits,
                            dim,
                            hidden,
                            cfg.arch.gelu_ffn() as i32,
                            0,
                        ),
                        "ffn_gate",
                    )?;
                    ck(
                        ffi::warpllm_matvec(
                            raw,
                            self.state.x.ptr(),
                            w2.data.ptr(),
                            self.state.hb.ptr(),
                            hidden,
                            dim,
                            dbits,
                            ptr::null(),
                            1,
                            1.0,
                            0,
                        ),
                        "ffn_down",
                    )?;
                }
            }

            if cfg.arch.uses_layernorm() {
                let acc = if cfg.arch.parallel_branches() {
                    self.state.xa.ptr() as *const c_void
                } else {
                    ptr::null()
                };
                ck(
                    ffi::warpllm_layernorm(
                        raw,
                        self.state.xb.ptr(),
                        self.state.x.ptr(),
                        acc,
                        fv(&self.weights.final_norm),
                        dim,
                        eps,
                    ),
                    "layernorm",
                )?;
            } else {
                ck(
                    ffi::warpllm_rmsnorm(
                        raw,
                        self.state.xb.ptr(),
                        self.state.x.ptr(),
                        required(&self.weights.final_norm, "final norm")?.ptr(),
                        dim,
                        eps,
                    ),
                    "rmsnorm",
                )?;
            }
            ck(
                ffi::warpllm_matvec(
                    raw,
                    self.state.logits.ptr(),
                    self.weights.wcls.data.ptr(),
                    self.state.xb.ptr(),
                    dim,
                    cfg.vocab_size as i32,
                    dbits,
                    fv(&self.weights.bcls),
                    0,
                    1.0,
                    0,
                ),
                "classifier",
            )?;
        }

        self.ctx
            .download_f32(&self.state.logits, &mut self.state.logits_host)?;
        self.ctx.synchronize()?;
        Ok(Some(&self.state.logits_host))
    }
}
