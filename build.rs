//! Build script for accel-mem.
//!
//! cudarc loads the driver library at runtime, so nothing is compiled or
//! linked here. With the `cuda` feature enabled the script only checks that a
//! CUDA toolkit can be found and warns otherwise.

use std::path::Path;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=CUDA_PATH");

    if std::env::var_os("CARGO_FEATURE_CUDA").is_none() {
        return;
    }

    let cuda_path = std::env::var("CUDA_PATH").unwrap_or_else(|_| "/usr/local/cuda".to_string());
    if !Path::new(&cuda_path).join("include").exists() {
        println!(
            "cargo:warning=CUDA feature enabled but no toolkit found at {cuda_path}; set CUDA_PATH"
        );
    }
}
