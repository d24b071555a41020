// src/config.rs
//! Model configuration: architecture tag, dimensions, numeric format tags.
//!
//! The config is produced by an external model parser and is immutable after
//! `Transformer::prepare`. `validate` enforces every structural invariant the
//! kernels rely on; violations are reported with the offending field named.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Warp width all kernel dimensioning assumes.
pub const WARP_SIZE: usize = 32;
pub const MAX_LAYERS: usize = 128;
pub const MAX_EXPERTS: usize = 64;

/// Number of always-retained initial positions in the rolling KV cache.
pub const KV_SINKS: u32 = 2;

/// Supported model families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Arch {
    LlamaLike,
    Qwen,
    Phi,
    Mixtral,
    Olmo,
    Gemma,
}

impl Arch {
    /// LayerNorm-based families; everything else is RMSNorm.
    pub fn uses_layernorm(self) -> bool {
        matches!(self, Arch::Phi | Arch::Olmo)
    }

    /// Attention and MLP read the same normalized input and write to
    /// separate accumulators (single shared norm per layer).
    pub fn parallel_branches(self) -> bool {
        matches!(self, Arch::Phi)
    }

    /// Single-branch FFN with biases instead of the gated w1/w3 pair.
    pub fn ungated_ffn(self) -> bool {
        matches!(self, Arch::Phi)
    }

    /// GELU activation in the FFN; the rest use SiLU.
    pub fn gelu_ffn(self) -> bool {
        matches!(self, Arch::Phi | Arch::Gemma)
    }

    pub fn qkv_bias(self) -> bool {
        matches!(self, Arch::Qwen | Arch::Phi)
    }

    /// Families the single persistent grid-synchronous kernel can run.
    pub fn supports_fused(self) -> bool {
        matches!(self, Arch::LlamaLike | Arch::Mixtral | Arch::Gemma)
    }
}

/// On-device weight element format (`dbits` tag).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WeightType {
    /// Group-quantized 4-bit: 8 values per 32-bit word with a shared fp8 scale.
    Gf4,
    /// fp8 E5M2 (high byte of the f16 encoding).
    F8e5m2,
    F16,
}

impl WeightType {
    pub fn from_dbits(dbits: u32) -> Result<Self> {
        Ok(match dbits {
            4 => WeightType::Gf4,
            8 => WeightType::F8e5m2,
            16 => WeightType::F16,
            other => bail!("unsupported dbits {} (expected 4, 8 or 16)", other),
        })
    }

    pub fn dbits(self) -> u32 {
        match self {
            WeightType::Gf4 => 4,
            WeightType::F8e5m2 => 8,
            WeightType::F16 => 16,
        }
    }

    /// Bytes a tensor of `elems` elements occupies in this format.
    pub fn bytes_for(self, elems: usize) -> usize {
        match self {
            WeightType::Gf4 => elems / 8 * 4,
            WeightType::F8e5m2 => elems,
            WeightType::F16 => elems * 2,
        }
    }
}

/// KV-cache element format (`kvbits` tag).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvType {
    F8e5m2,
    F16,
}

impl KvType {
    pub fn from_kvbits(kvbits: u32) -> Result<Self> {
        Ok(match kvbits {
            8 => KvType::F8e5m2,
            16 => KvType::F16,
            other => bail!("unsupported kvbits {} (expected 8 or 16)", other),
        })
    }

    pub fn kvbits(self) -> u32 {
        match self {
            KvType::F8e5m2 => 8,
            KvType::F16 => 16,
        }
    }

    pub fn bytes_for(self, elems: usize) -> usize {
        match self {
            KvType::F8e5m2 => elems,
            KvType::F16 => elems * 2,
        }
    }
}

/// Hyperparameters of the loaded model. Immutable after prepare.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub arch: Arch,
    /// Transformer dimension D.
    pub dim: usize,
    /// FFN hidden dimension H.
    pub hidden_dim: usize,
    /// Per-head dimension Dh.
    pub head_dim: usize,
    pub n_layers: usize,
    /// Query head count Hq.
    pub n_heads: usize,
    /// Key/value head count Hkv (< n_heads for grouped-query attention).
    pub n_kv_heads: usize,
    pub vocab_size: usize,
    /// Max sequence length Smax; the KV cache wraps past this.
    pub seq_len: usize,
    pub rope_theta: f32,
    /// Rotary dimension Dr; head elements past this are not rotated.
    pub rotary_dim: usize,
    /// MoE expert count E (zero for dense models).
    pub n_experts: usize,
    /// Active experts per token Ea (zero for dense models).
    pub n_experts_active: usize,
    pub norm_eps: f32,
    /// Scale applied to embedding rows at gather time (√D for Gemma).
    pub embed_scale: f32,
}

impl ModelConfig {
    /// Query projection width `Hq·Dh`.
    pub fn q_dim(&self) -> usize {
        self.n_heads * self.head_dim
    }

    /// Key/value projection width `Hkv·Dh`.
    pub fn kv_dim(&self) -> usize {
        self.n_kv_heads * self.head_dim
    }

    /// Query heads per KV head.
    pub fn kv_mul(&self) -> usize {
        self.n_heads / self.n_kv_heads
    }

    pub fn is_moe(&self) -> bool {
        self.n_experts > 0
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_layers == 0 || self.n_layers > MAX_LAYERS {
            bail!("n_layers {} out of range [1, {}]", self.n_layers, MAX_LAYERS);
        }
        if self.head_dim == 0 || self.n_heads == 0 || self.n_kv_heads == 0 {
            bail!(
                "head_dim/n_heads/n_kv_heads must be non-zero (got {}/{}/{})",
                self.head_dim,
                self.n_heads,
                self.n_kv_heads
            );
        }
        for (name, v) in [
            ("dim", self.dim),
            ("hidden_dim", self.hidden_dim),
            ("kv_dim", self.kv_dim()),
            ("vocab_size", self.vocab_size),
        ] {
            if v == 0 || v % WARP_SIZE != 0 {
                bail!("{} {} is not a positive multiple of {}", name, v, WARP_SIZE);
            }
        }
        if self.n_heads % self.n_kv_heads != 0 {
            bail!(
                "n_heads {} not divisible by n_kv_heads {}",
                self.n_heads,
                self.n_kv_heads
            );
        }
        if self.rotary_dim % 2 != 0 || self.rotary_dim > self.head_dim {
            bail!(
                "rotary_dim {} must be even and <= head_dim {}",
                self.rotary_dim,
                self.head_dim
            );
        }
        if self.seq_len <= KV_SINKS as usize {
            bail!("seq_len {} must exceed the {} sink positions", self.seq_len, KV_SINKS);
        }
        if !(self.rope_theta.is_finite() && self.rope_theta > 0.0) {
            bail!("rope_theta {} must be finite and > 0", self.rope_theta);
        }
        if !(self.norm_eps.is_finite() && self.norm_eps > 0.0) {
            bail!("norm_eps {} must be finite and > 0", self.norm_eps);
        }
        if !self.embed_scale.is_finite() {
            bail!("embed_scale {} must be finite", self.embed_scale);
        }
        if self.n_experts > MAX_EXPERTS {
            bail!("n_experts {} exceeds {}", self.n_experts, MAX_EXPERTS);
        }
        if self.n_experts > 0 {
            if self.n_experts_active == 0 || self.n_experts_active > self.n_experts {
                bail!(
                    "n_experts_active {} out of range [1, {}]",
                    self.n_experts_active,
                    self.n_experts
                );
            }
            if self.arch != Arch::Mixtral {
                bail!("n_experts > 0 requires the Mixtral architecture, got {:?}", self.arch);
            }
        } else if self.n_experts_active != 0 {
            bail!("n_experts_active {} requires n_experts > 0", self.n_experts_active);
        }
        Ok(())
    }
}

/// Bit flags for [`crate::forward::Transformer::forward`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardFlags(pub u32);

impl ForwardFlags {
    pub const NONE: ForwardFlags = ForwardFlags(0);
    /// Only write this token's K/V into the cache; skip logits (prompt pre-fill).
    pub const UPDATE_KV_ONLY: ForwardFlags = ForwardFlags(1 << 0);

    pub fn update_kv_only(self) -> bool {
        self.0 & Self::UPDATE_KV_ONLY.0 != 0
    }

    pub fn validate(self) -> Result<()> {
        let known = Self::UPDATE_KV_ONLY.0;
        if self.0 & !known != 0 {
            bail!("unknown forward flags: {:#x}", self.0 & !known);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny() -> ModelConfig {
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

    #[test]
    fn tiny_config_is_valid() {
        tiny().validate().unwrap();
    }

    #[test]
    fn rejects_non_warp_multiple_dim() {
        let mut c = tiny();
        c.dim = 100;
        let err = c.validate().unwrap_err().to_string();
        assert!(err.contains("dim 100"), "unexpected error: {err}");
    }

    #[test]
    fn rejects_head_mismatch() {
        let mut c = tiny();
        c.n_kv_heads = 3;
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_odd_rotary_dim() {
        let mut c = tiny();
        c.rotary_dim = 15;
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_moe_on_dense_arch() {
        let mut c = tiny();
        c.n_experts = 8;
        c.n_experts_active = 2;
        assert!(c.validate().is_err());
        c.arch = Arch::Mixtral;
        c.validate().unwrap();
    }

    #[test]
    fn dtype_tags_round_trip() {
        for bits in [4u32, 8, 16] {
            assert_eq!(WeightType::from_dbits(bits).unwrap().dbits(), bits);
        }
        assert!(WeightType::from_dbits(2).is_err());
        for bits in [8u32, 16] {
            assert_eq!(KvType::from_kvbits(bits).unwrap().kvbits(), bits);
        }
        assert!(KvType::from_kvbits(4).is_err());
    }

    #[test]
    fn unknown_flags_rejected() {
        assert!(ForwardFlags(0x2).validate().is_err());
        ForwardFlags::UPDATE_KV_ONLY.validate().unwrap();
    }
}
