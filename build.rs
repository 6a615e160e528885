//! Build script for trialsim.
//! Captures build environment for output provenance.

fn main() {
    println!("cargo:rerun-if-changed=Cargo.toml");

    // Toolchain version for provenance records.
    if let Ok(output) = std::process::Command::new(
        std::env::var("RUSTC").unwrap_or_else(|_| "rustc".to_string()),
    )
    .arg("--version")
    .output()
    {
        if let Ok(version) = String::from_utf8(output.stdout) {
            println!("cargo:rustc-env=TRIALSIM_RUSTC_VERSION={}", version.trim());
        }
    }

    // Git hash, when building from a checkout.
    if let Ok(output) = std::process::Command::new("git")
        .args(["rev-parse", "HEAD"])
        .output()
    {
        if let Ok(hash) = String::from_utf8(output.stdout) {
            if !hash.trim().is_empty() {
                println!("cargo:rustc-env=TRIALSIM_GIT_HASH={}", hash.trim());
            }
        }
    }
}
