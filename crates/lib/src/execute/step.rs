//! The external build step.
//!
//! The orchestrator treats compilation as a fallible black box behind [`BuildStep`].
//! [`CommandStep`] is the shipped implementation: it expands a command template and
//! runs it through the platform shell.

use std::future::Future;
use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{debug, info};

use crate::types::UnitId;
use crate::util::hash::ObjectHash;
use crate::variant::{ConfigVariant, InstanceId};

/// A completed dependency handed to the build step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyArtifact {
  pub instance: InstanceId,
  pub artifact: Option<String>,
  /// Committed artifact directory in the cache.
  pub path: PathBuf,
}

/// Everything a build step needs to build one instance.
#[derive(Debug, Clone)]
pub struct BuildRequest {
  pub instance: InstanceId,
  pub unit: UnitId,
  pub source: PathBuf,
  pub artifact: Option<String>,
  pub options: ConfigVariant,
  /// In declaration order.
  pub dependencies: Vec<DependencyArtifact>,
  /// Staging directory the step must write its artifact into.
  pub out_dir: PathBuf,
  pub key: ObjectHash,
}

/// What a build step reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutput {
  pub success: bool,
  /// Carried verbatim into the cache entry and the report.
  pub diagnostic: String,
}

impl StepOutput {
  pub fn success(diagnostic: impl Into<String>) -> Self {
    Self {
      success: true,
      diagnostic: diagnostic.into(),
    }
  }

  pub fn failure(diagnostic: impl Into<String>) -> Self {
    Self {
      success: false,
      diagnostic: diagnostic.into(),
    }
  }
}

/// Builds one instance. Implementations are shared across workers.
pub trait BuildStep: Send + Sync + 'static {
  fn build(&self, request: &BuildRequest) -> impl Future<Output = StepOutput> + Send;
}

/// Runs a shell command template per instance.
///
/// Placeholders: `{source}`, `{out}`, `{stem}`, `{unit}`, `{artifact}`, `{defines}`
/// (`-DK=V` per option) and `{deps}` (dependency artifact directories). Paths are
/// shell-quoted. The command's exit status decides the outcome; stdout and stderr
/// together are the diagnostic.
#[derive(Debug, Clone)]
pub struct CommandStep {
  template: String,
  working_dir: PathBuf,
  shell: Option<String>,
}

impl CommandStep {
  pub fn new(template: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
    Self {
      template: template.into(),
      working_dir: working_dir.into(),
      shell: None,
    }
  }

  /// Use a specific shell instead of the platform default.
  pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
    self.shell = Some(shell.into());
    self
  }

  pub fn template(&self) -> &str {
    &self.template
  }

  /// Expand the template for one request.
  pub fn expand(&self, request: &BuildRequest) -> String {
    let defines: Vec<String> = request
      .options
      .iter()
      .map(|(k, v)| quote(&format!("-D{k}={v}")))
      .collect();
    let deps: Vec<String> = request.dependencies.iter().map(|d| quote_path(&d.path)).collect();
    let stem = request.unit.stem();

    self
      .template
      .replace("{source}", &quote_path(&request.source))
      .replace("{out}", &quote_path(&request.out_dir))
      .replace("{stem}", stem)
      .replace("{unit}", &quote(request.unit.as_str()))
      .replace("{artifact}", request.artifact.as_deref().unwrap_or(stem))
      .replace("{defines}", &defines.join(" "))
      .replace("{deps}", &deps.join(" "))
  }
}

impl BuildStep for CommandStep {
  async fn build(&self, request: &BuildRequest) -> StepOutput {
    let cmd = self.expand(request);
    info!(instance = %request.instance, "running build command");
    debug!(cmd = %cmd, "expanded build command");

    let (shell, args) = get_shell(self.shell.as_deref());
    let mut command = Command::new(&shell);
    command
      .args(&args)
      .arg(&cmd)
      .current_dir(&self.working_dir)
      .env("out", &request.out_dir)
      .env("MODBUILD_UNIT", request.unit.as_str())
      .env("MODBUILD_SOURCE", &request.source)
      .env("MODBUILD_KEY", &request.key.0)
      .env("MODBUILD_ARTIFACT", request.artifact.as_deref().unwrap_or(""));

    let output = match command.output().await {
      Ok(output) => output,
      Err(e) => return StepOutput::failure(format!("failed to run `{shell}`: {e}")),
    };

    let mut diagnostic = String::from_utf8_lossy(&output.stdout).into_owned();
    diagnostic.push_str(&String::from_utf8_lossy(&output.stderr));

    if output.status.success() {
      StepOutput::success(diagnostic)
    } else {
      debug!(code = ?output.status.code(), "build command failed");
      if diagnostic.is_empty() {
        diagnostic = format!("command exited with {}", output.status);
      }
      StepOutput::failure(diagnostic)
    }
  }
}

#[cfg(unix)]
fn quote(text: &str) -> String {
  if !text.is_empty()
    && text
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-' | '=' | ':' | ','))
  {
    return text.to_string();
  }
  format!("'{}'", text.replace('\'', r"'\''"))
}

#[cfg(windows)]
fn quote(text: &str) -> String {
  format!("'{}'", text.replace('\'', "''"))
}

fn quote_path(path: &Path) -> String {
  quote(&path.to_string_lossy())
}

/// Shell binary and the arguments preceding the command string.
///
/// Defaults to `/bin/sh` (Unix) or `powershell.exe` (Windows) rather than `$SHELL`,
/// which may source user profiles.
fn get_shell(override_shell: Option<&str>) -> (String, Vec<String>) {
  if let Some(shell) = override_shell {
    let args = if shell.contains("powershell") || shell.contains("pwsh") {
      vec!["-NoProfile".to_string(), "-Command".to_string()]
    } else if shell.contains("cmd") {
      vec!["/C".to_string()]
    } else {
      vec!["-c".to_string()]
    };
    return (shell.to_string(), args);
  }

  #[cfg(unix)]
  {
    ("/bin/sh".to_string(), vec!["-c".to_string()])
  }

  #[cfg(windows)]
  {
    (
      "powershell.exe".to_string(),
      vec![
        "-NoProfile".to_string(),
        "-ExecutionPolicy".to_string(),
        "Bypass".to_string(),
        "-Command".to_string(),
      ],
    )
  }
}
