//! GPU inference core for decoder-only transformer language models: one
//! forward pass per token against persistent device-resident weights, with a
//! rolling attention-sink KV cache and quantized weight/KV formats.
//!
//! The external model parser populates [`config::ModelConfig`] and
//! [`weights::HostWeights`]; [`forward::Transformer::prepare`] uploads them
//! and [`forward::Transformer::forward`] produces next-token logits.

pub mod config;
mod coop;
pub mod cuda;
pub mod forward;
pub mod kernels;
pub mod kvcache;
pub mod quant;
pub mod weights;

pub use config::{Arch, ForwardFlags, KvType, ModelConfig, WeightType};
pub use forward::Transformer;
pub use weights::{HostExpert, HostLayer, HostTensor, HostWeights};
