// src/cuda.rs
//! Device context and device memory.
//!
//! With the `cuda` feature, `CudaContext` wraps an FFI context implemented in
//! `cuda/kernels.cu` (primary + secondary stream, kernel launchers) and device
//! buffers are raw device allocations. Without it, "device" buffers are host
//! vectors and the reference kernels in [`crate::kernels`] execute the forward
//! pass; the same layout and dispatch logic runs on both paths.
//!
//! Weights and run-state buffers live for the process lifetime; device
//! allocations are never freed individually.

use anyhow::Result;

#[cfg(feature = "cuda")]
use anyhow::bail;
#[cfg(feature = "cuda")]
use std::ffi::c_void;

#[cfg(feature = "cuda")]
pub mod ffi {
    use std::ffi::c_void;

    #[repr(C)]
    pub struct WarpLlmContext {
        _private: [u8; 0],
    }

    /// Per-layer weight pointer bundle, uploaded once for the cooperative
    /// kernel's device-resident layer table.
    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct LayerBundle {
        pub rms_att: *const c_void,
        pub rms_ffn: *const c_void,
        pub wq: *const c_void,
        pub wk: *const c_void,
        pub wv: *const c_void,
        pub wo: *const c_void,
        pub bq: *const c_void,
        pub bk: *const c_void,
        pub bv: *const c_void,
        pub w1: *const c_void,
        pub w2: *const c_void,
        pub w3: *const c_void,
        pub b1: *const c_void,
        pub b2: *const c_void,
        pub moe_gate: *const c_void,
        /// Device arrays of `n_experts` weight pointers.
        pub moe_w1: *const c_void,
        pub moe_w2: *const c_void,
        pub moe_w3: *const c_void,
    }

    /// Argument block for the cooperative fused forward kernel.
    #[repr(C)]
    pub struct FusedArgs {
        pub arch: i32,
        pub dbits: i32,
        pub kvbits: i32,
        pub dim: i32,
        pub hidden_dim: i32,
        pub head_dim: i32,
        pub n_layers: i32,
        pub n_heads: i32,
        pub n_kv_heads: i32,
        pub vocab_size: i32,
        pub max_seq: i32,
        pub rotary_dim: i32,
        pub n_experts: i32,
        pub n_experts_active: i32,
        pub rope_theta: f32,
        pub norm_eps: f32,
        pub embed_scale: f32,
        pub token: i32,
        pub pos: i32,
        pub kv_sink: i32,
        pub kv_pos: i32,
        pub kv_len: i32,
        pub update_kv_only: i32,
        pub x: *mut c_void,
        pub xb: *mut c_void,
        pub hb: *mut c_void,
        pub he: *mut c_void,
        pub q: *mut c_void,
        pub att: *mut c_void,
        pub exp: *mut c_void,
        pub logits: *mut c_void,
        pub key_cache: *mut c_void,
        pub value_cache: *mut c_void,
        pub token_embedding: *const c_void,
        pub rms_final: *const c_void,
        pub wcls: *const c_void,
        pub bcls: *const c_void,
    }

    pub const WARPLLM_OK: i32 = 0;

    extern "C" {
        pub fn warpllm_create_context(device_id: i32) -> *mut WarpLlmContext;
        pub fn warpllm_destroy_context(ctx: *mut WarpLlmContext);

        pub fn warpllm_device_malloc(
            ctx: *mut WarpLlmContext,
            bytes: usize,
            out_ptr: *mut *mut c_void,
        ) -> i32;
        pub fn warpllm_memcpy_h2d(
            ctx: *mut WarpLlmContext,
            dst: *mut c_void,
            src: *const c_void,
            bytes: usize,
        ) -> i32;
        pub fn warpllm_memcpy_d2h(
            ctx: *mut WarpLlmContext,
            dst: *mut c_void,
            src: *const c_void,
            bytes: usize,
        ) -> i32;
        pub fn warpllm_memset_zero(ctx: *mut WarpLlmContext, ptr: *mut c_void, bytes: usize) -> i32;
        pub fn warpllm_synchronize(ctx: *mut WarpLlmContext) -> i32;

        pub fn warpllm_embed(
            ctx: *mut WarpLlmContext,
            out: *mut c_void,
            table: *const c_void,
            token: i32,
            dim: i32,
            dbits: i32,
            scale: f32,
        ) -> i32;
        pub fn warpllm_rmsnorm(
            ctx: *mut WarpLlmContext,
            out: *mut c_void,
            x: *const c_void,
            w: *const c_void,
            dim: i32,
            eps: f32,
        ) -> i32;
        pub fn warpllm_layernorm(
            ctx: *mut WarpLlmContext,
            out: *mut c_void,
            x: *mut c_void,
            acc: *const c_void,
            w: *const c_void,
            dim: i32,
            eps: f32,
        ) -> i32;
        #[allow(clippy::too_many_arguments)]
        pub fn warpllm_matvec(
            ctx: *mut WarpLlmContext,
            out: *mut c_void,
            w: *const c_void,
            x: *const c_void,
            n_in: i32,
            n_out: i32,
            dbits: i32,
            bias: *const c_void,
            accumulate: i32,
            scale: f32,
            stream: i32,
        ) -> i32;
        #[allow(clippy::too_many_arguments)]
        pub fn warpllm_qkv_rope(
            ctx: *mut WarpLlmContext,
            q: *mut c_void,
            key_cache: *mut c_void,
            value_cache: *mut c_void,
            x: *const c_void,
            wq: *const c_void,
            wk: *const c_void,
            wv: *const c_void,
            bq: *const c_void,
            bk: *const c_void,
            bv: *const c_void,
            dbits: i32,
            kvbits: i32,
            dim: i32,
            q_dim: i32,
            kv_dim: i32,
            head_dim: i32,
            rotary_dim: i32,
            rope_theta: f32,
            pos: i32,
            kv_pos: i32,
            max_seq: i32,
        ) -> i32;
        #[allow(clippy::too_many_arguments)]
        pub fn warpllm_sink_rotate(
            ctx: *mut WarpLlmContext,
            key_cache: *mut c_void,
            kvbits: i32,
            n_layers: i32,
            kv_sink: i32,
            kv_dim: i32,
            head_dim: i32,
            rotary_dim: i32,
            rope_theta: f32,
            max_seq: i32,
        ) -> i32;
        #[allow(clippy::too_many_arguments)]
        pub fn warpllm_attn_score(
            ctx: *mut WarpLlmContext,
            att: *mut c_void,
            q: *const c_void,
            key_cache: *const c_void,
            kvbits: i32,
            n_heads: i32,
            head_dim: i32,
            kv_mul: i32,
            kv_len: i32,
            max_seq: i32,
        ) -> i32;
        pub fn warpllm_attn_softmax(
            ctx: *mut WarpLlmContext,
            att: *mut c_void,
            n_heads: i32,
            kv_len: i32,
            max_seq: i32,
        ) -> i32;
        #[allow(clippy::too_many_arguments)]
        pub fn warpllm_attn_mix(
            ctx: *mut WarpLlmContext,
            out: *mut c_void,
            att: *const c_void,
            value_cache: *const c_void,
            kvbits: i32,
            n_heads: i32,
            head_dim: i32,
            kv_mul: i32,
            kv_len: i32,
            max_seq: i32,
        ) -> i32;
        #[allow(clippy::too_many_arguments)]
        pub fn warpllm_ffn_gated(
            ctx: *mut WarpLlmContext,
            hb: *mut c_void,
            xb: *const c_void,
            w1: *const c_void,
            w3: *const c_void,
            b1: *const c_void,
            dbits: i32,
            dim: i32,
            hidden_dim: i32,
            gelu: i32,
            stream: i32,
        ) -> i32;
        pub fn warpllm_moe_gate(
            ctx: *mut WarpLlmContext,
            exp: *mut c_void,
            xb: *const c_void,
            gate: *const c_void,
            dbits: i32,
            dim: i32,
            n_experts: i32,
            n_active: i32,
        ) -> i32;
        #[allow(clippy::too_many_arguments)]
        pub fn warpllm_moe_ffn(
            ctx: *mut WarpLlmContext,
            he: *mut c_void,
            xb: *const c_void,
            w1_ptrs: *const c_void,
            w3_ptrs: *const c_void,
            exp: *const c_void,
            slot: i32,
            dbits: i32,
            dim: i32,
            hidden_dim: i32,
            n_experts: i32,
        ) -> i32;
        #[allow(clippy::too_many_arguments)]
        pub fn warpllm_moe_down(
            ctx: *mut WarpLlmContext,
            x: *mut c_void,
            he: *const c_void,
            w2_ptrs: *const c_void,
            exp: *const c_void,
            slot: i32,
            dbits: i32,
            hidden_dim: i32,
            dim: i32,
            n_experts: i32,
        ) -> i32;
        pub fn warpllm_stream_fork(ctx: *mut WarpLlmContext) -> i32;
        pub fn warpllm_stream_join(ctx: *mut WarpLlmContext) -> i32;
        pub fn warpllm_upload_layer_table(
            ctx: *mut WarpLlmContext,
            table: *const LayerBundle,
            n_layers: i32,
        ) -> i32;
        pub fn warpllm_fused_forward(ctx: *mut WarpLlmContext, args: *const FusedArgs) -> i32;
    }
}

/// Handle to the accelerator device. Owns the primary and secondary streams.
#[derive(Debug)]
pub struct CudaContext {
    #[cfg(feature = "cuda")]
    raw: *mut ffi::WarpLlmContext,
}

#[cfg(feature = "cuda")]
unsafe impl Send for CudaContext {}
#[cfg(feature = "cuda")]
unsafe impl Sync for CudaContext {}

/// Contiguous device allocation of raw bytes (weights, KV cache).
#[derive(Debug)]
pub struct DeviceBytes {
    len: usize,
    #[cfg(feature = "cuda")]
    ptr: *mut c_void,
    #[cfg(not(feature = "cuda"))]
    data: Vec<u8>,
}

impl DeviceBytes {
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[cfg(feature = "cuda")]
    #[inline]
    pub fn ptr(&self) -> *mut c_void {
        self.ptr
    }

    #[cfg(not(feature = "cuda"))]
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    #[cfg(not(feature = "cuda"))]
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Contiguous device allocation of f32 (activations, norm weights, biases).
#[derive(Debug)]
pub struct DeviceF32 {
    len: usize,
    #[cfg(feature = "cuda")]
    ptr: *mut c_void,
    #[cfg(not(feature = "cuda"))]
    data: Vec<f32>,
}

impl DeviceF32 {
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[cfg(feature = "cuda")]
    #[inline]
    pub fn ptr(&self) -> *mut c_void {
        self.ptr
    }

    #[cfg(not(feature = "cuda"))]
    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    #[cfg(not(feature = "cuda"))]
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }
}

impl CudaContext {
    /// Open device `device_id` (-1 selects the default device).
    pub fn new(device_id: i32) -> Result<Self> {
        #[cfg(feature = "cuda")]
        {
            let raw = unsafe { ffi::warpllm_create_context(device_id) };
            if raw.is_null() {
                bail!("failed to create device context (device {})", device_id);
            }
            Ok(Self { raw })
        }
        #[cfg(not(feature = "cuda"))]
        {
            let _ = device_id;
            Ok(Self {})
        }
    }

    #[cfg(feature = "cuda")]
    #[inline]
    pub(crate) fn raw(&self) -> *mut ffi::WarpLlmContext {
        self.raw
    }

    #[cfg(feature = "cuda")]
    pub(crate) fn check(rc: i32, what: &str) -> Result<()> {
        if rc != ffi::WARPLLM_OK {
            bail!("{} failed: rc={}", what, rc);
        }
        Ok(())
    }

    /// Stage a block of host bytes into device memory.
    pub fn upload_bytes(&self, data: &[u8]) -> Result<DeviceBytes> {
        #[cfg(feature = "cuda")]
        {
            let mut ptr: *mut c_void = std::ptr::null_mut();
            let rc = unsafe { ffi::warpllm_device_malloc(self.raw, data.len().max(1), &mut ptr) };
            Self::check(rc, "device_malloc")?;
            let rc = unsafe {
                ffi::warpllm_memcpy_h2d(self.raw, ptr, data.as_ptr() as *const c_void, data.len())
            };
            Self::check(rc, "memcpy_h2d")?;
            Ok(DeviceBytes { len: data.len(), ptr })
        }
        #[cfg(not(feature = "cuda"))]
        {
            Ok(DeviceBytes {
                len: data.len(),
                data: data.to_vec(),
            })
        }
    }

    /// Allocate a zero-filled device byte buffer.
    pub fn alloc_bytes(&self, len: usize) -> Result<DeviceBytes> {
        #[cfg(feature = "cuda")]
        {
            let mut ptr: *mut c_void = std::ptr::null_mut();
            let rc = unsafe { ffi::warpllm_device_malloc(self.raw, len.max(1), &mut ptr) };
            Self::check(rc, "device_malloc")?;
            let rc = unsafe { ffi::warpllm_memset_zero(self.raw, ptr, len) };
            Self::check(rc, "memset_zero")?;
            Ok(DeviceBytes { len, ptr })
        }
        #[cfg(not(feature = "cuda"))]
        {
            Ok(DeviceBytes {
                len,
                data: vec![0u8; len],
            })
        }
    }

    pub fn upload_f32(&self, data: &[f32]) -> Result<DeviceF32> {
        #[cfg(feature = "cuda")]
        {
            let bytes = std::mem::size_of_val(data);
            let mut ptr: *mut c_void = std::ptr::null_mut();
            let rc = unsafe { ffi::warpllm_device_malloc(self.raw, bytes.max(4), &mut ptr) };
            Self::check(rc, "device_malloc")?;
            let rc = unsafe {
                ffi::warpllm_memcpy_h2d(self.raw, ptr, data.as_ptr() as *const c_void, bytes)
            };
            Self::check(rc, "memcpy_h2d")?;
            Ok(DeviceF32 { len: data.len(), ptr })
        }
        #[cfg(not(feature = "cuda"))]
        {
            Ok(DeviceF32 {
                len: data.len(),
                data: data.to_vec(),
            })
        }
    }

    /// Allocate a zero-filled device f32 buffer.
    pub fn alloc_f32(&self, len: usize) -> Result<DeviceF32> {
        #[cfg(feature = "cuda")]
        {
            let bytes = len * std::mem::size_of::<f32>();
            let mut ptr: *mut c_void = std::ptr::null_mut();
            let rc = unsafe { ffi::warpllm_device_malloc(self.raw, bytes.max(4), &mut ptr) };
            Self::check(rc, "device_malloc")?;
            let rc = unsafe { ffi::warpllm_memset_zero(self.raw, ptr, bytes) };
            Self::check(rc, "memset_zero")?;
            Ok(DeviceF32 { len, ptr })
        }
        #[cfg(not(feature = "cuda"))]
        {
            Ok(DeviceF32 {
                len,
                data: vec![0.0; len],
            })
        }
    }

    /// Copy a device f32 buffer back into host memory.
    #[cfg(feature = "cuda")]
    pub fn download_f32(&self, src: &DeviceF32, dst: &mut [f32]) -> Result<()> {
        let bytes = dst.len().min(src.len()) * std::mem::size_of::<f32>();
        let rc = unsafe {
            ffi::warpllm_memcpy_d2h(self.raw, dst.as_mut_ptr() as *mut c_void, src.ptr, bytes)
        };
        Self::check(rc, "memcpy_d2h")
    }

    /// Block until all work on the primary stream has completed.
    pub fn synchronize(&self) -> Result<()> {
        #[cfg(feature = "cuda")]
        {
            let rc = unsafe { ffi::warpllm_synchronize(self.raw) };
            Self::check(rc, "synchronize")?;
        }
        Ok(())
    }
}

impl Drop for CudaContext {
    fn drop(&mut self) {
        #[cfg(feature = "cuda")]
        unsafe {
            ffi::warpllm_destroy_context(self.raw)
        };
    }
}
