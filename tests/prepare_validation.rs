// prepare-time validation: shape mismatches, mixed formats and missing
// tensors are rejected with the offending field named.
#![cfg(not(feature = "cuda"))]

mod common;

use anyhow::Result;
use common::{dense_config, TinyModel};
use warp_llm::quant::encode_tensor;
use warp_llm::{ForwardFlags, HostTensor, KvType, Transformer, WeightType};

#[test]
fn rejects_wrong_tensor_shape() {
    let m = TinyModel::new(dense_config(), WeightType::F16);
    let mut w = m.weights();
    let short = vec![0u8; 16];
    w.layers[0].wq = HostTensor {
        data: &short,
        ty: WeightType::F16,
    };
    let err = Transformer::prepare(m.config.clone(), &w, KvType::F16)
        .unwrap_err()
        .to_string();
    assert!(err.contains("wq"), "error should name the tensor: {err}");
}

#[test]
fn rejects_mixed_weight_formats() {
    let m = TinyModel::new(dense_config(), WeightType::F16);
    let mut w = m.weights();
    let requant = encode_tensor(
        &m.layer_tensor_f32(0, "wq"),
        WeightType::F8e5m2,
    );
    w.layers[0].wq = HostTensor {
        data: &requant,
        ty: WeightType::F8e5m2,
    };
    let err = Transformer::prepare(m.config.clone(), &w, KvType::F16)
        .unwrap_err()
        .to_string();
    assert!(err.contains("format"), "unexpected error: {err}");
}

#[test]
fn rejects_layer_count_mismatch() {
    let m = TinyModel::new(dense_config(), WeightType::F16);
    let mut w = m.weights();
    w.layers.pop();
    let err = Transformer::prepare(m.config.clone(), &w, KvType::F16)
        .unwrap_err()
        .to_string();
    assert!(err.contains("layers"), "unexpected error: {err}");
}

#[test]
fn rejects_missing_ffn_gate() {
    let m = TinyModel::new(dense_config(), WeightType::F16);
    let mut w = m.weights();
    w.layers[0].w3 = None;
    let err = Transformer::prepare(m.config.clone(), &w, KvType::F16)
        .unwrap_err()
        .to_string();
    assert!(err.contains("w3"), "unexpected error: {err}");
}

#[test]
fn rejects_missing_norm_weights() {
    let m = TinyModel::new(dense_config(), WeightType::F16);
    let mut w = m.weights();
    w.layers[1].norm_att = None;
    assert!(Transformer::prepare(m.config.clone(), &w, KvType::F16).is_err());
}

#[test]
fn rejects_bad_forward_arguments() -> Result<()> {
    let m = TinyModel::new(dense_config(), WeightType::F16);
    let mut t = m.prepare(KvType::F16)?;

    let err = t.forward(32, 0, ForwardFlags::NONE).unwrap_err().to_string();
    assert!(err.contains("token"), "unexpected error: {err}");

    let err = t
        .forward(0, 0, warp_llm::ForwardFlags(0x8))
        .unwrap_err()
        .to_string();
    assert!(err.contains("flags"), "unexpected error: {err}");
    Ok(())
}

#[test]
fn rejects_invalid_config_at_prepare() {
    let m = TinyModel::new(dense_config(), WeightType::F16);
    let mut cfg = m.config.clone();
    cfg.n_kv_heads = 3;
    assert!(Transformer::prepare(cfg, &m.weights(), KvType::F16).is_err());
}
