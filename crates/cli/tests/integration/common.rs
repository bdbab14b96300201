//! Shared test helpers for CLI integration tests.

use std::path::PathBuf;

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use tempfile::TempDir;

/// Copies each unit into its output directory.
pub const COPY_MANIFEST: &str = r#"
[project]
name = "demo"
toolchain = "cp"

[build]
command = "cp {source} {out}/"
parallelism = 2
"#;

/// A three-unit chain: `top.cpp` imports `mid`, which imports `leaf`.
pub const CHAIN: &[(&str, &str)] = &[
  ("src/leaf.cppm", "export module leaf;\n"),
  ("src/mid.cppm", "export module mid;\nimport leaf;\n"),
  ("src/top.cpp", "import mid;\n\nint main() { return 0; }\n"),
];

/// Isolated project directory with its own cache.
pub struct TestEnv {
  pub temp: TempDir,
}

impl TestEnv {
  pub fn empty() -> Self {
    Self {
      temp: TempDir::new().unwrap(),
    }
  }

  pub fn project(manifest: &str, files: &[(&str, &str)]) -> Self {
    let env = Self::empty();
    env.write_file("modbuild.toml", manifest);
    for (path, content) in files {
      env.write_file(path, content);
    }
    env
  }

  /// Write a file relative to the temp directory.
  pub fn write_file(&self, relative_path: &str, content: &str) {
    let path = self.temp.path().join(relative_path);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
  }

  /// Cache path (hidden, so source discovery never sees cached copies).
  pub fn cache_path(&self) -> PathBuf {
    self.temp.path().join(".cache")
  }

  /// A Command for the modbuild binary running inside the project.
  ///
  /// `MODBUILD_CACHE` points at the isolated cache and `NO_COLOR` keeps output plain.
  pub fn modbuild_cmd(&self) -> Command {
    let mut cmd: Command = cargo_bin_cmd!("modbuild");
    cmd.current_dir(self.temp.path());
    cmd.env("MODBUILD_CACHE", self.cache_path());
    cmd.env("NO_COLOR", "1");
    cmd.env_remove("RUST_LOG");
    cmd
  }
}
