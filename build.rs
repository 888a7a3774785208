// build.rs — platform detection for sparse cache files.
//
// Emits `cargo:rustc-cfg=has_sparse_files` on Unix targets. The mmap block
// cache relies on `ftruncate` producing a sparse backing file; on platforms
// without native sparse-file support the cache zero-fills the file instead.
fn main() {
    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let unix_targets = [
        "linux", "macos", "freebsd", "netbsd", "openbsd", "dragonfly", "solaris", "illumos",
        "android",
    ];
    if unix_targets.contains(&target_os.as_str()) || std::env::var("CARGO_CFG_UNIX").is_ok() {
        println!("cargo:rustc-cfg=has_sparse_files");
    }
}
