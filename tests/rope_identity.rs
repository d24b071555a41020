// Rotary embedding laws: identity at position 0, and no rotation for head
// elements past the rotary span.
#![cfg(not(feature = "cuda"))]

mod common;

use anyhow::Result;
use common::{dense_config, TinyModel};
use half::f16;
use warp_llm::{ForwardFlags, KvType, WeightType};

fn rmsnorm_ref(x: &[f32], w: &[f32], eps: f32) -> Vec<f32> {
    let ms = x.iter().map(|v| v * v).sum::<f32>() / x.len() as f32;
    let s = 1.0 / (ms + eps).sqrt();
    x.iter().zip(w).map(|(v, wj)| v * wj * s).collect()
}

fn plain_k_projection(m: &TinyModel, token: usize) -> Vec<f32> {
    let cfg = &m.config;
    let d = cfg.dim;
    let emb = m.emb_f32();
    let xb = rmsnorm_ref(
        &emb[token * d..(token + 1) * d],
        m.layer_vec_f32(0, "norm_att").unwrap(),
        cfg.norm_eps,
    );
    let wk = m.layer_tensor_f32(0, "wk");
    (0..cfg.kv_dim())
        .map(|j| (0..d).map(|c| wk[j * d + c] * xb[c]).sum())
        .collect()
}

#[test]
fn keys_at_position_zero_equal_plain_projection() -> Result<()> {
    let mut cfg = dense_config();
    cfg.rotary_dim = 8; // rotary span covers only half of each head
    let m = TinyModel::new(cfg.clone(), WeightType::F16);
    let mut t = m.prepare(KvType::F16)?;
    t.forward(5, 0, ForwardFlags::NONE)?;

    let plain = plain_k_projection(&m, 5);
    for j in 0..cfg.kv_dim() {
        let expect = f16::from_f32(plain[j]).to_f32();
        let got = t.kv().read_key(0, 0, j);
        assert!(
            (got - expect).abs() < 1e-4,
            "key {j}: got {got}, expect {expect}"
        );
    }
    Ok(())
}

#[test]
fn elements_past_rotary_span_are_never_rotated() -> Result<()> {
    let mut cfg = dense_config();
    cfg.rotary_dim = 8;
    let m = TinyModel::new(cfg.clone(), WeightType::F16);
    let mut t = m.prepare(KvType::F16)?;
    t.forward(5, 0, ForwardFlags::NONE)?;
    t.forward(9, 1, ForwardFlags::NONE)?;

    let plain = plain_k_projection(&m, 9);
    let dh = cfg.head_dim;
    let mut saw_rotated = false;
    for j in (0..cfg.kv_dim()).step_by(2) {
        let got0 = t.kv().read_key(0, 1, j);
        let got1 = t.kv().read_key(0, 1, j + 1);
        if j % dh >= cfg.rotary_dim {
            // untouched by RoPE even at pos > 0
            let e0 = f16::from_f32(plain[j]).to_f32();
            let e1 = f16::from_f32(plain[j + 1]).to_f32();
            assert!((got0 - e0).abs() < 1e-4, "key {j} should be unrotated");
            assert!((got1 - e1).abs() < 1e-4, "key {} should be unrotated", j + 1);
        } else {
            // rotated by pos * theta^(-j_head/rotary_dim)
            let freq = cfg.rope_theta.powf(-((j % dh) as f32) / cfg.rotary_dim as f32);
            let (s, c) = (1.0f32 * freq).sin_cos();
            let e0 = plain[j] * c - plain[j + 1] * s;
            let e1 = plain[j] * s + plain[j + 1] * c;
            assert!((got0 - e0).abs() < 1e-3, "key {j}: got {got0}, expect {e0}");
            assert!((got1 - e1).abs() < 1e-3);
            if (got0 - f16::from_f32(plain[j]).to_f32()).abs() > 1e-3 {
                saw_rotated = true;
            }
        }
    }
    assert!(saw_rotated, "expected at least one visibly rotated pair");
    Ok(())
}
