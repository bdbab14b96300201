//! Platform-specific directories and host identification.

pub mod paths;

/// Host identifier folded into toolchain identity (e.g., "x86_64-linux").
pub fn host_triple() -> String {
  format!("{}-{}", std::env::consts::ARCH, std::env::consts::OS)
}
