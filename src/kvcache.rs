// src/kvcache.rs
//! Rolling key/value cache with attention sinks.
//!
//! Two device blocks of `n_layers * seq_len * kv_dim` elements each, in fp8
//! E5M2 or fp16. The layouts are transposed for coalesced reads along the
//! position axis:
//!
//! - keys: position pairs interleaved within each head element pair. Element
//!   `j` of position `t` lives at `seq_len * (j & !1) + 2*t + (j & 1)`, so two
//!   consecutive positions of one rotary pair occupy four contiguous elements.
//! - values: positions contiguous per head element, `seq_len * j + t`.
//!
//! Once `pos` reaches `seq_len`, writes wrap into `[KV_SINKS, seq_len)` while
//! the first `KV_SINKS` positions stay resident ("attention sinks"); their
//! cached keys are re-rotated by one position of rotary frequency per forward
//! call to stay aligned with the sliding window.

use crate::config::{KvType, ModelConfig, KV_SINKS};
use crate::cuda::{CudaContext, DeviceBytes};
use anyhow::Result;

#[cfg(not(feature = "cuda"))]
use crate::kernels::rope_freq;
#[cfg(not(feature = "cuda"))]
use crate::quant::{kv_read, kv_write};

/// Resolve `(kv_sink, kv_pos, kv_len)` for an absolute position.
///
/// Before the window fills: no sinks, the physical slot equals `pos`.
/// After: the first `KV_SINKS` slots are sticky and the remainder is a ring.
pub fn kv_positions(pos: u32, seq_len: u32) -> (u32, u32, u32) {
    if pos < seq_len {
        (0, pos, pos + 1)
    } else {
        let sink = KV_SINKS;
        let kv_pos = sink + (pos - sink) % (seq_len - sink);
        (sink, kv_pos, seq_len)
    }
}

#[derive(Debug)]
pub struct KvCache {
    ty: KvType,
    n_layers: usize,
    seq_len: usize,
    kv_dim: usize,
    head_dim: usize,
    rotary_dim: usize,
    rope_theta: f32,
    key: DeviceBytes,
    value: DeviceBytes,
}

impl KvCache {
    pub fn new(ctx: &CudaContext, config: &ModelConfig, ty: KvType) -> Result<Self> {
        let elems = config.n_layers * config.seq_len * config.kv_dim();
        let bytes = ty.bytes_for(elems);
        Ok(Self {
            ty,
            n_layers: config.n_layers,
            seq_len: config.seq_len,
            kv_dim: config.kv_dim(),
            head_dim: config.head_dim,
            rotary_dim: config.rotary_dim,
            rope_theta: config.rope_theta,
            key: ctx.alloc_bytes(bytes)?,
            value: ctx.alloc_bytes(bytes)?,
        })
    }

    #[inline]
    pub fn ty(&self) -> KvType {
        self.ty
    }

    #[inline]
    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    /// Element offset of one layer's slab in either cache.
    #[inline]
    pub fn layer_offset(&self, layer: usize) -> usize {
        layer * self.seq_len * self.kv_dim
    }

    /// Element index of key element `j` for position `t` within a layer slab.
    #[inline]
    pub fn key_offset(&self, t: usize, j: usize) -> usize {
        self.seq_len * (j & !1) + 2 * t + (j & 1)
    }

    /// Element index of value element `j` for position `t` within a layer slab.
    #[inline]
    pub fn value_offset(&self, t: usize, j: usize) -> usize {
        self.seq_len * j + t
    }

    #[cfg(feature = "cuda")]
    #[inline]
    pub fn key_ptr(&self) -> *mut std::ffi::c_void {
        self.key.ptr()
    }

    #[cfg(feature = "cuda")]
    #[inline]
    pub fn value_ptr(&self) -> *mut std::ffi::c_void {
        self.value.ptr()
    }
}

#[cfg(not(feature = "cuda"))]
impl KvCache {
    pub fn write_key(&mut self, layer: usize, t: usize, j: usize, v: f32) {
        let idx = self.layer_offset(layer) + self.key_offset(t, j);
        kv_write(self.key.as_mut_slice(), self.ty, idx, v);
    }

    pub fn read_key(&self, layer: usize, t: usize, j: usize) -> f32 {
        let idx = self.layer_offset(layer) + self.key_offset(t, j);
        kv_read(self.key.as_slice(), self.ty, idx)
    }

    pub fn write_value(&mut self, layer: usize, t: usize, j: usize, v: f32) {
        let idx = self.layer_offset(layer) + self.value_offset(t, j);
        kv_write(self.value.as_mut_slice(), self.ty, idx, v);
    }

    pub fn read_value(&self, layer: usize, t: usize, j: usize) -> f32 {
        let idx = self.layer_offset(layer) + self.value_offset(t, j);
        kv_read(self.value.as_slice(), self.ty, idx)
    }

    /// Advance every cached sink key by one position of rotary frequency so
    /// sinks stay phase-aligned with the ring as the window slides.
    pub fn rotate_sinks(&mut self, kv_sink: u32) {
        for layer in 0..self.n_layers {
            for t in 0..kv_sink as usize {
                for j in (0..self.kv_dim).step_by(2) {
                    let freq = rope_freq(j % self.head_dim, self.rotary_dim, self.rope_theta);
                    if freq == 0.0 {
                        continue;
                    }
                    let (sin, cos) = freq.sin_cos();
                    let k0 = self.read_key(layer, t, j);
                    let k1 = self.read_key(layer, t, j + 1);
                    self.write_key(layer, t, j, k0 * cos - k1 * sin);
                    self.write_key(layer, t, j + 1, k0 * sin + k1 * cos);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_before_wrap_are_identity() {
        for pos in 0..8 {
            assert_eq!(kv_positions(pos, 8), (0, pos, pos + 1));
        }
    }

    #[test]
    fn positions_wrap_past_sinks() {
        // seq_len 8: ring covers slots [2, 8)
        assert_eq!(kv_positions(8, 8), (2, 2, 8));
        assert_eq!(kv_positions(9, 8), (2, 3, 8));
        assert_eq!(kv_positions(13, 8), (2, 7, 8));
        assert_eq!(kv_positions(14, 8), (2, 2, 8));
    }

    #[test]
    fn sink_slots_never_reused() {
        for pos in 8..1000 {
            let (_, kv_pos, _) = kv_positions(pos, 8);
            assert!(kv_pos >= 2 && kv_pos < 8, "pos {pos} mapped to {kv_pos}");
        }
    }
}
