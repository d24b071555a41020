// src/kernels.rs
//! Reference numeric kernels.
//!
//! These run the forward pass when the `cuda` feature is off and serve as the
//! oracle the GPU kernels are validated against. Each operates on one token's
//! worth of data, mirroring the kernel granularity in `cuda/kernels.cu`:
//! weight matrices are raw bytes in one of the three supported formats with
//! dequantization inlined in the inner loop, activations are f32 slices.

use crate::config::WeightType;
use crate::quant::{decode_at, f8_decode, gf4_decode, GF4_GROUP};
use half::f16;
use rayon::prelude::*;

/// `o[i] = dequant(E[token*dim + i]) * scale`
pub fn embed_gather(out: &mut [f32], table: &[u8], ty: WeightType, token: usize, scale: f32) {
    let dim = out.len();
    for (i, o) in out.iter_mut().enumerate() {
        *o = decode_at(table, ty, token * dim + i) * scale;
    }
}

/// `o[j] = x[j] * w[j] / sqrt(mean(x^2) + eps)`
pub fn rmsnorm(out: &mut [f32], x: &[f32], w: &[f32], eps: f32) {
    let n = x.len();
    let ss: f32 = x.iter().map(|&v| v * v).sum::<f32>() / n as f32;
    let s = 1.0 / (ss + eps).sqrt();
    for j in 0..n {
        out[j] = x[j] * w[j] * s;
    }
}

/// LayerNorm with an optional accumulator folded into `x` in place.
///
/// Mean and variance use a shifted estimator (values are offset by the first
/// element before squaring) to keep the sum of squares small. `w = None`
/// normalizes with unit weight.
pub fn layernorm(out: &mut [f32], x: &mut [f32], acc: Option<&[f32]>, w: Option<&[f32]>, eps: f32) {
    let n = x.len();
    if let Some(acc) = acc {
        for j in 0..n {
            x[j] += acc[j];
        }
    }
    let shift = x[0];
    let mut sum = 0.0f32;
    let mut sum_sq = 0.0f32;
    for &v in x.iter() {
        let d = v - shift;
        sum += d;
        sum_sq += d * d;
    }
    let mean_shifted = sum / n as f32;
    let var = sum_sq / n as f32 - mean_shifted * mean_shifted;
    let mean = mean_shifted + shift;
    let s = 1.0 / (var + eps).sqrt();
    for j in 0..n {
        let wj = w.map_or(1.0, |w| w[j]);
        out[j] = (x[j] - mean) * wj * s;
    }
}

/// Dot product of matrix row `i` (row-major `[n_out][n_in]`) with `x`,
/// dequantizing inline per format.
pub fn dot_row(w: &[u8], ty: WeightType, i: usize, x: &[f32]) -> f32 {
    let n = x.len();
    match ty {
        WeightType::F16 => {
            let base = i * n * 2;
            let mut acc = 0.0f32;
            for (j, &xj) in x.iter().enumerate() {
                let b = base + 2 * j;
                acc += f16::from_le_bytes([w[b], w[b + 1]]).to_f32() * xj;
            }
            acc
        }
        WeightType::F8e5m2 => {
            let base = i * n;
            let mut acc = 0.0f32;
            for (j, &xj) in x.iter().enumerate() {
                acc += f8_decode(w[base + j]) * xj;
            }
            acc
        }
        WeightType::Gf4 => {
            let words = n / GF4_GROUP;
            let base = i * words * 4;
            let mut acc = 0.0f32;
            for g in 0..words {
                let b = base + 4 * g;
                let word = u32::from_le_bytes([w[b], w[b + 1], w[b + 2], w[b + 3]]);
                for k in 0..GF4_GROUP {
                    acc += gf4_decode(word, k) * x[g * GF4_GROUP + k];
                }
            }
            acc
        }
    }
}

/// `y[i] = sum_j W[i,j] x[j] (+ bias) `, or `y[i] += ...` when `accumulate`.
pub fn matvec(
    out: &mut [f32],
    w: &[u8],
    ty: WeightType,
    x: &[f32],
    bias: Option<&[f32]>,
    accumulate: bool,
) {
    out.par_iter_mut().enumerate().for_each(|(i, o)| {
        let mut v = dot_row(w, ty, i, x);
        if let Some(b) = bias {
            v += b[i];
        }
        *o = if accumulate { *o + v } else { v };
    });
}

/// `y[i] += scale * sum_j W[i,j] x[j]` (MoE expert mixture accumulation).
pub fn matvec_scaled_add(out: &mut [f32], w: &[u8], ty: WeightType, x: &[f32], scale: f32) {
    out.par_iter_mut().enumerate().for_each(|(i, o)| {
        *o += scale * dot_row(w, ty, i, x);
    });
}

#[inline]
pub fn silu(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

/// tanh-approximated GELU.
#[inline]
pub fn gelu(x: f32) -> f32 {
    0.5 * x * (1.0 + (0.797_884_56 * (x + 0.044715 * x * x * x)).tanh())
}

/// Gated FFN hidden activation, fused per output element:
/// `hb[i] = act(W1[i]·x + b1[i]) * (W3[i]·x)`, with `W3 = None` degenerating
/// to the single-branch `hb[i] = act(W1[i]·x + b1[i])`.
#[allow(clippy::too_many_arguments)]
pub fn ffn_gate(
    hb: &mut [f32],
    x: &[f32],
    w1: &[u8],
    w3: Option<&[u8]>,
    b1: Option<&[f32]>,
    ty: WeightType,
    use_gelu: bool,
) {
    hb.par_iter_mut().enumerate().for_each(|(i, o)| {
        let mut g = dot_row(w1, ty, i, x);
        if let Some(b) = b1 {
            g += b[i];
        }
        let a = if use_gelu { gelu(g) } else { silu(g) };
        *o = match w3 {
            Some(w3) => a * dot_row(w3, ty, i, x),
            None => a,
        };
    });
}

/// Subtract the max and exponentiate in place; the caller folds the missing
/// `1/sum` normalization into its next step.
pub fn softmax_exp(xs: &mut [f32]) {
    let max = xs.iter().fold(f32::NEG_INFINITY, |m, &v| m.max(v));
    for v in xs.iter_mut() {
        *v = (*v - max).exp();
    }
}

/// Full softmax in place.
pub fn softmax(xs: &mut [f32]) {
    softmax_exp(xs);
    let sum: f32 = xs.iter().sum();
    for v in xs.iter_mut() {
        *v /= sum;
    }
}

/// Rotary frequency for a head-dim offset: `theta^(-j/rotary_dim)` inside the
/// rotary span, zero (no rotation) past it.
#[inline]
pub fn rope_freq(j_head: usize, rotary_dim: usize, theta: f32) -> f32 {
    if j_head < rotary_dim {
        theta.powf(-(j_head as f32) / rotary_dim as f32)
    } else {
        0.0
    }
}

/// Top-k expert selection over gate logits.
///
/// `exp[0..n_experts]` holds the gate logits on entry and the softmax
/// probabilities on exit; `exp[n_experts + 2a]` / `exp[n_experts + 2a + 1]`
/// receive the a-th selected (weight, expert index) pair. Selection mirrors
/// the GPU reduction: each candidate is packed into a 32-bit key with the
/// probability bits in the high 24 and the expert index in the low 8, the
/// argmax key is extracted `n_active` times (zeroing the winner in between),
/// and the surviving weights are renormalized to sum to 1.
pub fn moe_select(exp: &mut [f32], n_experts: usize, n_active: usize) {
    let (probs, pairs) = exp.split_at_mut(n_experts);
    softmax(probs);
    for a in 0..n_active {
        let mut best = 0u32;
        for (e, &p) in probs.iter().enumerate() {
            let key = (p.to_bits() & 0xFFFF_FF00) | e as u32;
            if key > best {
                best = key;
            }
        }
        let e = (best & 0xFF) as usize;
        pairs[2 * a] = f32::from_bits(best & 0xFFFF_FF00);
        pairs[2 * a + 1] = e as f32;
        probs[e] = 0.0;
    }
    let sum: f32 = (0..n_active).map(|a| pairs[2 * a]).sum();
    if sum > 0.0 {
        for a in 0..n_active {
            pairs[2 * a] /= sum;
        }
    }
}
