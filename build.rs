use std::env;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=cuda/kernels.cu");
    println!("cargo:rerun-if-changed=cuda/stub.c");

    // Always declare this cfg so we can gate tests without warnings
    println!("cargo::rustc-check-cfg=cfg(has_nvcc)");

    // Is the crate built with the `cuda` feature?
    let cuda_feature_enabled = env::var("CARGO_FEATURE_CUDA").is_ok();
    if !cuda_feature_enabled {
        return;
    }

    // Check if nvcc is available
    let nvcc_available = Command::new("which")
        .arg("nvcc")
        .status()
        .map(|status| status.success())
        .unwrap_or(false);

    if nvcc_available {
        // Expose cfg so tests can detect real CUDA
        println!("cargo:rustc-cfg=has_nvcc");

        cc::Build::new()
            .cuda(true)
            .file("cuda/kernels.cu")
            .flag("-std=c++17")
            .flag("-O3")
            .flag("-Xcompiler")
            .flag("-fPIC")
            // Cooperative launch needs compute 7.0+; cover Volta through Hopper.
            .flag("-gencode=arch=compute_70,code=sm_70")
            .flag("-gencode=arch=compute_80,code=sm_80")
            .flag("-gencode=arch=compute_90,code=sm_90")
            .compile("warpllm_kernels");

        println!("cargo:rustc-link-lib=cudart");
    } else {
        // Build stub library that defines all required symbols so linking succeeds
        cc::Build::new()
            .file("cuda/stub.c")
            .compile("warpllm_kernels");
    }
}
