// src/coop.rs
//! Cooperative fused forward path.
//!
//! Instead of issuing dozens of kernels per layer, the whole per-token pass
//! runs inside one persistent grid-synchronous kernel: all blocks stay
//! resident, a grid-wide barrier separates the phases (norm → QKV/RoPE →
//! score → softmax → mix → output → FFN norm/gate → FFN down), and the
//! per-layer weight pointers come from a device-resident table uploaded once
//! at prepare time. This eliminates per-token launch overhead on the GPU.
//!
//! Supported for LlamaLike, Mixtral and Gemma; selected at call time by
//! `CALM_COOP=1` when the architecture allows it. The host build emulates the
//! fused path with a single phase-ordered sweep over the same layer table and
//! must produce logits identical to the multi-kernel reference driver.

use crate::config::ForwardFlags;
use crate::forward::Transformer;
use anyhow::Result;

#[cfg(feature = "cuda")]
use crate::cuda::CudaContext;
#[cfg(feature = "cuda")]
use crate::weights::DeviceWeights;

/// Whether the environment asks for the fused driver.
pub(crate) fn requested() -> bool {
    matches!(std::env::var("CALM_COOP").ok().as_deref(), Some("1"))
}

#[cfg(not(feature = "cuda"))]
pub(crate) fn forward_fused(
    t: &mut Transformer,
    token: u32,
    pos: u32,
    flags: ForwardFlags,
) -> Result<Option<&[f32]>> {
    use crate::forward::{attention_host, qkv_rope_host, required};
    use crate::kernels::{
        embed_gather, ffn_gate, matvec, matvec_scaled_add, moe_select, rmsnorm,
    };
    use crate::kvcache::kv_positions;

    let Transformer {
        config: cfg,
        weights,
        state,
        kv,
        ..
    } = t;
    let wt = weights.weight_ty;
    let eps = cfg.norm_eps;
    let (kv_sink, kv_pos, kv_len) = kv_positions(pos, cfg.seq_len as u32);

    let x = state.x.as_mut_slice();
    let xb = state.xb.as_mut_slice();
    let hb = state.hb.as_mut_slice();
    let he = state.he.as_mut_slice();
    let q = state.q.as_mut_slice();
    let att = state.att.as_mut_slice();
    let exp = state.exp.as_mut_slice();
    let logits = state.logits.as_mut_slice();

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

    // one sweep over the layer table; phase boundaries below correspond to
    // the grid-wide barriers of the persistent kernel
    for (l, layer) in weights.layers.iter().enumerate() {
        // phase: attention norm
        rmsnorm(xb, x, required(&layer.norm_att, "attention norm")?.as_slice(), eps);
        // phase: QKV + RoPE + KV write
        qkv_rope_host(cfg, layer, wt, kv, l, xb, q, pos, kv_pos);
        if flags.update_kv_only() && l == cfg.n_layers - 1 {
            return Ok(None);
        }
        // phases: score, softmax, mix
        attention_host(cfg, kv, l, q, att, kv_len as usize);
        // phase: output projection
        matvec(x, layer.wo.data.as_slice(), wt, q, None, true);
        // phase: FFN norm
        rmsnorm(xb, x, required(&layer.norm_ffn, "FFN norm")?.as_slice(), eps);
        if cfg.is_moe() {
            let gate = layer
                .moe_gate
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("moe_gate weights missing"))?;
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
                // the kernel accumulates expert mixtures with atomic adds
                matvec_scaled_add(x, expert.w2.data.as_slice(), wt, he_a, weight);
            }
        } else {
            let w1 = layer
                .w1
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("w1 weights missing"))?;
            let w2 = layer
                .w2
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("w2 weights missing"))?;
            // phase: FFN gate
            ffn_gate(
                hb,
                xb,
                w1.data.as_slice(),
                layer.w3.as_ref().map(|w| w.data.as_slice()),
                None,
                wt,
                cfg.arch.gelu_ffn(),
            );
            // phase: FFN down projection
            matvec(x, w2.data.as_slice(), wt, hb, None, true);
        }
    }

    rmsnorm(xb, x, required(&weights.final_norm, "final norm")?.as_slice(), eps);
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

#[cfg(feature = "cuda")]
pub(crate) fn forward_fused(
    t: &mut Transformer,
    token: u32,
    pos: u32,
    flags: ForwardFlags,
) -> Result<Option<&[f32]>> {
    use crate::cuda::ffi;
    use crate::kvcache::kv_positions;
    use std::ptr;

    let cfg = &t.config;
    let (kv_sink, kv_pos, kv_len) = kv_positions(pos, cfg.seq_len as u32);
    let fv = |o: &Option<crate::cuda::DeviceF32>| {
        o.as_ref()
            .map_or(ptr::null(), |v| v.ptr() as *const std::ffi::c_void)
    };

    let args = ffi::FusedArgs {
        arch: cfg.arch.device_tag(),
        dbits: t.weights.weight_ty.dbits() as i32,
        kvbits: t.kv.ty().kvbits() as i32,
        dim: cfg.dim as i32,
        hidden_dim: cfg.hidden_dim as i32,
        head_dim: cfg.head_dim as i32,
        n_layers: cfg.n_layers as i32,
        n_heads: cfg.n_heads as i32,
        n_kv_heads: cfg.n_kv_heads as i32,
        vocab_size: cfg.vocab_size as i32,
        max_seq: cfg.seq_len as i32,
        rotary_dim: cfg.rotary_dim as i32,
        n_experts: cfg.n_experts as i32,
        n_experts_active: cfg.n_experts_active as i32,
        rope_theta: cfg.rope_theta,
        norm_eps: cfg.norm_eps,
        embed_scale: cfg.embed_scale,
        token: token as i32,
        pos: pos as i32,
        kv_sink: kv_sink as i32,
        kv_pos: kv_pos as i32,
        kv_len: kv_len as i32,
        update_kv_only: flags.update_kv_only() as i32,
        x: t.state.x.ptr(),
        xb: t.state.xb.ptr(),
        hb: t.state.hb.ptr(),
        he: t.state.he.ptr(),
        q: t.state.q.ptr(),
        att: t.state.att.ptr(),
        exp: t.state.exp.ptr(),
        logits: t.state.logits.ptr(),
        key_cache: t.kv.key_ptr(),
        value_cache: t.kv.value_ptr(),
        token_embedding: t.weights.token_embedding.data.ptr(),
        rms_final: fv(&t.weights.final_norm),
        wcls: t.weights.wcls.data.ptr(),
        bcls: fv(&t.weights.bcls),
    };
    CudaContext::check(
        unsafe { ffi::warpllm_fused_forward(t.ctx.raw(), &args) },
        "fused_forward",
    )?;
    if flags.update_kv_only() {
        return Ok(None);
    }
    t.ctx
        .download_f32(&t.state.logits, &mut t.state.logits_host)?;
    t.ctx.synchronize()?;
    Ok(Some(&t.state.logits_host))
}

/// Build and upload the per-layer weight-pointer table the persistent kernel
/// indexes by layer. Called once from prepare.
#[cfg(feature = "cuda")]
pub(crate) fn upload_layer_table(ctx: &CudaContext, weights: &DeviceWeights) -> Result<()> {
    use crate::cuda::ffi;
    use std::ptr;

    let fv = |o: &Option<crate::cuda::DeviceF32>| {
        o.as_ref()
            .map_or(ptr::null(), |v| v.ptr() as *const std::ffi::c_void)
    };
    let ft = |o: &Option<crate::weights::DeviceTensor>| {
        o.as_ref()
            .map_or(ptr::null(), |w| w.data.ptr() as *const std::ffi::c_void)
    };

    let mut table = Vec::with_capacity(weights.layers.len());
    for layer in &weights.layers {
        let eptrs = layer.expert_ptrs.as_ref();
        table.push(ffi::LayerBundle {
            rms_att: fv(&layer.norm_att),
            rms_ffn: fv(&layer.norm_ffn),
            wq: layer.wq.data.ptr(),
            wk: layer.wk.data.ptr(),
            wv: layer.wv.data.ptr(),
            wo: layer.wo.data.ptr(),
            bq: fv(&layer.bq),
            bk: fv(&layer.bk),
            bv: fv(&layer.bv),
            w1: ft(&layer.w1),
            w2: ft(&layer.w2),
            w3: ft(&layer.w3),
            b1: fv(&layer.b1),
            b2: fv(&layer.b2),
            moe_gate: ft(&layer.moe_gate),
            moe_w1: eptrs.map_or(ptr::null(), |p| p[0].ptr() as *const std::ffi::c_void),
            moe_w2: eptrs.map_or(ptr::null(), |p| p[1].ptr() as *const std::ffi::c_void),
            moe_w3: eptrs.map_or(ptr::null(), |p| p[2].ptr() as *const std::ffi::c_void),
        });
    }
    CudaContext::check(
        unsafe { ffi::warpllm_upload_layer_table(ctx.raw(), table.as_ptr(), table.len() as i32) },
        "upload_layer_table",
    )
}
