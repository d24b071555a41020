// tests/common/mod.rs
#![allow(dead_code)]

use anyhow::Result;
use warp_llm::quant::encode_tensor;
use warp_llm::{
    Arch, HostExpert, HostLayer, HostTensor, HostWeights, KvType, ModelConfig, Transformer,
    WeightType,
};

/// Deterministic weight pattern; small enough to keep activations tame.
pub fn pattern(n: usize, k: f32) -> Vec<f32> {
    (0..n).map(|i| ((i as f32) * k).sin() * 0.1).collect()
}

/// Norm weights hover around 1.
pub fn norm_pattern(n: usize, k: f32) -> Vec<f32> {
    (0..n).map(|i| 1.0 + ((i as f32) * k).sin() * 0.05).collect()
}

/// Tiny dense LlamaLike model matching the reference scenario:
/// D=64, H=128, L=2, Hq=4, Hkv=2, Dh=16, V=32, Smax=8.
pub fn dense_config() -> ModelConfig {
    ModelConfig {
        arch: Arch::LlamaLike,
        dim: 64,
        hidden_dim: 128,
        head_dim: 16,
        n_layers: 2,
        n_heads: 4,
        n_kv_heads: 2,
        vocab_size: 32,
        seq_len: 8,
        rope_theta: 10000.0,
        rotary_dim: 16,
        n_experts: 0,
        n_experts_active: 0,
        norm_eps: 1e-5,
        embed_scale: 1.0,
    }
}

pub fn arch_config(arch: Arch) -> ModelConfig {
    let mut c = dense_config();
    c.arch = arch;
    if arch == Arch::Mixtral {
        c.n_experts = 8;
        c.n_experts_active = 2;
    }
    if arch == Arch::Gemma {
        c.embed_scale = (c.dim as f32).sqrt();
    }
    c
}

struct TinyLayer {
    norm_att: Option<Vec<f32>>,
    norm_ffn: Option<Vec<f32>>,
    wq: Vec<u8>,
    wk: Vec<u8>,
    wv: Vec<u8>,
    wo: Vec<u8>,
    bq: Option<Vec<f32>>,
    bk: Option<Vec<f32>>,
    bv: Option<Vec<f32>>,
    w1: Option<Vec<u8>>,
    w2: Option<Vec<u8>>,
    w3: Option<Vec<u8>>,
    b1: Option<Vec<f32>>,
    b2: Option<Vec<f32>>,
    moe_gate: Option<Vec<u8>>,
    experts: Vec<(Vec<u8>, Vec<u8>, Vec<u8>)>,
}

/// Owns the backing storage for a deterministic toy model; `weights()` hands
/// the borrowed table `prepare` expects.
pub struct TinyModel {
    pub config: ModelConfig,
    pub ty: WeightType,
    emb: Vec<u8>,
    final_norm: Vec<f32>,
    wcls: Vec<u8>,
    bcls: Option<Vec<f32>>,
    layers: Vec<TinyLayer>,
}

impl TinyModel {
    pub fn new(config: ModelConfig, ty: WeightType) -> Self {
        let dim = config.dim;
        let hidden = config.hidden_dim;
        let q_dim = config.q_dim();
        let kv_dim = config.kv_dim();
        let k = std::cell::Cell::new(0.011f32);
        let next = |n: usize| {
            k.set(k.get() + 0.0071);
            encode_tensor(&pattern(n, k.get()), ty)
        };
        let next_f32 = |n: usize, scale: f32| {
            k.set(k.get() + 0.0053);
            pattern(n, k.get()).iter().map(|v| v * scale).collect::<Vec<f32>>()
        };

        let emb = next(config.vocab_size * dim);
        let mut layers = Vec::new();
        for l in 0..config.n_layers {
            let parallel = config.arch.parallel_branches();
            let bias = config.arch.qkv_bias();
            let moe = config.n_experts > 0;
            let mut layer = TinyLayer {
                norm_att: Some(norm_pattern(dim, 0.3 + l as f32 * 0.01)),
                norm_ffn: if parallel {
                    None
                } else {
                    Some(norm_pattern(dim, 0.4 + l as f32 * 0.01))
                },
                wq: next(q_dim * dim),
                wk: next(kv_dim * dim),
                wv: next(kv_dim * dim),
                wo: next(dim * q_dim),
                bq: bias.then(|| next_f32(q_dim, 1.0)),
                bk: bias.then(|| next_f32(kv_dim, 1.0)),
                bv: bias.then(|| next_f32(kv_dim, 1.0)),
                w1: None,
                w2: None,
                w3: None,
                b1: None,
                b2: None,
                moe_gate: None,
                experts: Vec::new(),
            };
            if moe {
                layer.moe_gate = Some(next(config.n_experts * dim));
                for _ in 0..config.n_experts {
                    layer
                        .experts
                        .push((next(hidden * dim), next(dim * hidden), next(hidden * dim)));
                }
            } else {
                layer.w1 = Some(next(hidden * dim));
                layer.w2 = Some(next(dim * hidden));
                if config.arch.ungated_ffn() {
                    layer.b1 = Some(next_f32(hidden, 1.0));
                    layer.b2 = Some(next_f32(dim, 1.0));
                } else {
                    layer.w3 = Some(next(hidden * dim));
                }
            }
            layers.push(layer);
        }

        Self {
            emb,
            final_norm: norm_pattern(dim, 0.9),
            wcls: next(config.vocab_size * dim),
            bcls: config
                .arch
                .parallel_branches()
                .then(|| next_f32(config.vocab_size, 1.0)),
            layers,
            config,
            ty,
        }
    }

    pub fn weights(&self) -> HostWeights<'_> {
        fn ht(data: &[u8], ty: WeightType) -> HostTensor<'_> {
            HostTensor { data, ty }
        }
        let ty = self.ty;
        HostWeights {
            token_embedding: ht(&self.emb, ty),
            layers: self
                .layers
                .iter()
                .map(|l| HostLayer {
                    norm_att: l.norm_att.as_deref(),
                    norm_ffn: l.norm_ffn.as_deref(),
                    wq: ht(&l.wq, ty),
                    wk: ht(&l.wk, ty),
                    wv: ht(&l.wv, ty),
                    wo: ht(&l.wo, ty),
                    bq: l.bq.as_deref(),
                    bk: l.bk.as_deref(),
                    bv: l.bv.as_deref(),
                    w1: l.w1.as_deref().map(|d| ht(d, ty)),
                    w2: l.w2.as_deref().map(|d| ht(d, ty)),
                    w3: l.w3.as_deref().map(|d| ht(d, ty)),
                    b1: l.b1.as_deref(),
                    b2: l.b2.as_deref(),
                    moe_gate: l.moe_gate.as_deref().map(|d| ht(d, ty)),
                    experts: l
                        .experts
                        .iter()
                        .map(|(w1, w2, w3)| HostExpert {
                            w1: ht(w1, ty),
                            w2: ht(w2, ty),
                            w3: ht(w3, ty),
                        })
                        .collect(),
                })
                .collect(),
            final_norm: Some(&self.final_norm),
            wcls: ht(&self.wcls, ty),
            bcls: self.bcls.as_deref(),
        }
    }

    pub fn prepare(&self, kv: KvType) -> Result<Transformer> {
        Transformer::prepare(self.config.clone(), &self.weights(), kv)
    }

    /// Dequantized f32 view of a stored tensor, for independent references.
    pub fn dequant(&self, data: &[u8], n: usize) -> Vec<f32> {
        (0..n)
            .map(|i| warp_llm::quant::decode_at(data, self.ty, i))
            .collect()
    }

    pub fn emb_f32(&self) -> Vec<f32> {
        self.dequant(&self.emb, self.config.vocab_size * self.config.dim)
    }

    pub fn wcls_f32(&self) -> Vec<f32> {
        self.dequant(&self.wcls, self.config.vocab_size * self.config.dim)
    }

    pub fn final_norm_f32(&self) -> &[f32] {
        &self.final_norm
    }

    pub fn layer_tensor_f32(&self, l: usize, which: &str) -> Vec<f32> {
        let cfg = &self.config;
        let layer = &self.layers[l];
        let (data, n): (&[u8], usize) = match which {
            "wq" => (&layer.wq, cfg.q_dim() * cfg.dim),
            "wk" => (&layer.wk, cfg.kv_dim() * cfg.dim),
            "wv" => (&layer.wv, cfg.kv_dim() * cfg.dim),
            "wo" => (&layer.wo, cfg.dim * cfg.q_dim()),
            "w1" => (layer.w1.as_ref().unwrap(), cfg.hidden_dim * cfg.dim),
            "w2" => (layer.w2.as_ref().unwrap(), cfg.dim * cfg.hidden_dim),
            "w3" => (layer.w3.as_ref().unwrap(), cfg.hidden_dim * cfg.dim),
            other => panic!("unknown tensor {other}"),
        };
        self.dequant(data, n)
    }

    pub fn layer_vec_f32(&self, l: usize, which: &str) -> Option<&[f32]> {
        let layer = &self.layers[l];
        match which {
            "norm_att" => layer.norm_att.as_deref(),
            "norm_ffn" => layer.norm_ffn.as_deref(),
            "bq" => layer.bq.as_deref(),
            "bk" => layer.bk.as_deref(),
            "bv" => layer.bv.as_deref(),
            "b1" => layer.b1.as_deref(),
            "b2" => layer.b2.as_deref(),
            other => panic!("unknown vector {other}"),
        }
    }

    pub fn bcls_f32(&self) -> Option<&[f32]> {
        self.bcls.as_deref()
    }
}

pub fn assert_close(got: &[f32], expect: &[f32], tol: f32, what: &str) {
    assert_eq!(got.len(), expect.len(), "{what}: length mismatch");
    for (i, (g, e)) in got.iter().zip(expect).enumerate() {
        assert!(
            (g - e).abs() <= tol,
            "{what}: mismatch at {i}: got {g}, expect {e} (tol {tol})"
        );
    }
}
