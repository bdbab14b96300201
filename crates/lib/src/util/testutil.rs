//! Test utilities for modbuild-lib.
//!
//! [`FakeStep`] stands in for a compiler: it writes a small artifact per instance and
//! can be told to fail, panic or stall for specific units.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::execute::{BuildRequest, BuildStep, StepOutput};

#[derive(Debug, Default)]
pub struct FakeStep {
  failing: HashSet<String>,
  panicking: HashSet<String>,
  delays: HashMap<String, Duration>,
  calls: Mutex<Vec<String>>,
  finished: Mutex<Vec<String>>,
  running: AtomicUsize,
  max_running: AtomicUsize,
  missing: AtomicUsize,
}

impl FakeStep {
  pub fn new() -> Self {
    Self::default()
  }

  /// Fail every instance of `unit`.
  pub fn failing(mut self, unit: &str) -> Self {
    self.failing.insert(unit.to_string());
    self
  }

  pub fn panicking(mut self, unit: &str) -> Self {
    self.panicking.insert(unit.to_string());
    self
  }

  /// Sleep `millis` before finishing any instance of `unit`.
  pub fn delay(mut self, unit: &str, millis: u64) -> Self {
    self.delays.insert(unit.to_string(), Duration::from_millis(millis));
    self
  }

  /// Instances built so far, in the order their steps started.
  pub fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap().clone()
  }

  /// Instances whose steps returned, in completion order.
  pub fn finished(&self) -> Vec<String> {
    self.finished.lock().unwrap().clone()
  }

  pub fn max_concurrency(&self) -> usize {
    self.max_running.load(Ordering::SeqCst)
  }

  /// Dependency artifact directories that did not exist when a step ran.
  pub fn missing_dependencies(&self) -> usize {
    self.missing.load(Ordering::SeqCst)
  }
}

impl BuildStep for FakeStep {
  async fn build(&self, request: &BuildRequest) -> StepOutput {
    let unit = request.unit.as_str().to_string();
    self.calls.lock().unwrap().push(request.instance.to_string());

    let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
    self.max_running.fetch_max(running, Ordering::SeqCst);

    if let Some(delay) = self.delays.get(&unit) {
      tokio::time::sleep(*delay).await;
    }
    self.running.fetch_sub(1, Ordering::SeqCst);
    self.finished.lock().unwrap().push(request.instance.to_string());

    if self.panicking.contains(&unit) {
      panic!("fake step panicked on {unit}");
    }

    let missing: Vec<_> = request.dependencies.iter().filter(|d| !d.path.is_dir()).collect();
    if !missing.is_empty() {
      self.missing.fetch_add(missing.len(), Ordering::SeqCst);
      return StepOutput::failure(format!("{unit}: missing dependency artifacts"));
    }

    if self.failing.contains(&unit) {
      return StepOutput::failure(format!("{unit}:1: error: fake failure"));
    }

    let artifact = request.out_dir.join(format!("{}.bmi", request.unit.stem()));
    let content = format!("{}\n{}\n", request.instance, request.options);
    match std::fs::write(&artifact, content) {
      Ok(()) => StepOutput::success(format!("compiled {}", request.instance)),
      Err(e) => StepOutput::failure(format!("{unit}: {e}")),
    }
  }
}
