// The score -> softmax -> mix pipeline must produce a proper softmax-weighted
// value average: internal exponent weights normalize to 1 and the per-head
// context equals the weighted sum over cached values.
#![cfg(not(feature = "cuda"))]

mod common;

use anyhow::Result;
use common::{dense_config, TinyModel};
use warp_llm::{ForwardFlags, KvType, WeightType};

#[test]
fn mix_is_softmax_weighted_value_average() -> Result<()> {
    let cfg = dense_config();
    let m = TinyModel::new(cfg.clone(), WeightType::F16);
    let mut t = m.prepare(KvType::F16)?;

    let tokens = [2u32, 7, 1, 4];
    for (pos, &tok) in tokens.iter().enumerate() {
        t.forward(tok, pos as u32, ForwardFlags::NONE)?;
    }

    // buffers hold the last layer's state after the final forward
    let kv_len = tokens.len();
    let last = cfg.n_layers - 1;
    let dh = cfg.head_dim;
    let kv_mul = cfg.kv_mul();
    let att = t.att();
    let ctx = t.q();

    for h in 0..cfg.n_heads {
        let a = &att[h * cfg.seq_len..h * cfg.seq_len + kv_len];
        let sum: f32 = a.iter().sum();
        assert!(sum > 0.0);
        let probs: Vec<f32> = a.iter().map(|v| v / sum).collect();
        assert!(
            (probs.iter().sum::<f32>() - 1.0).abs() < 1e-6,
            "head {h}: probabilities must sum to 1"
        );
        // the exponentiated scores are not normalized in place
        assert!((a.iter().cloned().fold(f32::MIN, f32::max) - 1.0).abs() < 1e-6);

        let hk = h / kv_mul;
        for i in 0..dh {
            let expect: f32 = (0..kv_len)
                .map(|tpos| probs[tpos] * t.kv().read_value(last, tpos, hk * dh + i))
                .sum();
            let got = ctx[h * dh + i];
            assert!(
                (got - expect).abs() < 1e-5,
                "head {h} elem {i}: got {got}, expect {expect}"
            );
        }
    }
    Ok(())
}

#[test]
fn grouped_query_heads_share_kv_heads() -> Result<()> {
    let cfg = dense_config();
    assert_eq!(cfg.kv_mul(), 2);
    let m = TinyModel::new(cfg, WeightType::F16);
    let mut t = m.prepare(KvType::F16)?;
    for pos in 0..3u32 {
        t.forward(1, pos, ForwardFlags::NONE)?;
    }
    // contexts differ across kv groups in general
    let dh = m.config.head_dim;
    let ctx = t.q();
    let group0 = &ctx[0..dh];
    let group1 = &ctx[2 * dh..3 * dh];
    assert_ne!(group0, group1);
    Ok(())
}
