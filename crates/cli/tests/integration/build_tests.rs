use predicates::prelude::*;

use super::common::{CHAIN, COPY_MANIFEST, TestEnv};

#[cfg(unix)]
#[test]
fn build_copies_units_into_the_cache() {
  let env = TestEnv::project(COPY_MANIFEST, CHAIN);

  env
    .modbuild_cmd()
    .arg("build")
    .assert()
    .success()
    .stdout(predicate::str::contains("Build complete!"))
    .stdout(predicate::str::contains("Built: 3"));

  let objects = env.cache_path().join("objects");
  let copies = walk_count(&objects, "leaf.cppm");
  assert_eq!(copies, 1);
}

#[cfg(unix)]
#[test]
fn second_build_is_all_cache_hits() {
  let env = TestEnv::project(COPY_MANIFEST, CHAIN);
  env.modbuild_cmd().arg("build").assert().success();

  env
    .modbuild_cmd()
    .arg("build")
    .assert()
    .success()
    .stdout(predicate::str::contains("Built: 0"))
    .stdout(predicate::str::contains("Cache hits: 3"));
}

#[cfg(unix)]
#[test]
fn failing_command_exits_nonzero_and_skips_consumers() {
  let manifest = r#"
[build]
command = "test {stem} != leaf && cp {source} {out}/"
"#;
  let env = TestEnv::project(manifest, CHAIN);

  env
    .modbuild_cmd()
    .arg("build")
    .assert()
    .failure()
    .stderr(predicate::str::contains("src/leaf.cppm"))
    .stderr(predicate::str::contains("skipped src/mid.cppm"));
}

#[cfg(unix)]
#[test]
fn build_json_report_has_summary() {
  let env = TestEnv::project(COPY_MANIFEST, CHAIN);

  let output = env
    .modbuild_cmd()
    .args(["build", "-o", "json"])
    .output()
    .unwrap();
  assert!(output.status.success());

  let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  assert_eq!(report["summary"]["built"], 3);
  assert_eq!(report["dispatch_order"].as_array().unwrap().len(), 3);
}

#[cfg(unix)]
#[test]
fn plan_after_change_shows_must_build() {
  let env = TestEnv::project(COPY_MANIFEST, CHAIN);
  env.modbuild_cmd().arg("build").assert().success();

  env.write_file("src/mid.cppm", "export module mid;\nimport leaf;\nexport int f();\n");

  env
    .modbuild_cmd()
    .arg("plan")
    .assert()
    .success()
    .stdout(predicate::str::contains("src/leaf.cppm → cache-hit"))
    .stdout(predicate::str::contains("To build: 2"));
}

#[test]
fn build_without_command_fails() {
  let env = TestEnv::project("[project]\nname = \"demo\"\n", CHAIN);

  env
    .modbuild_cmd()
    .arg("build")
    .assert()
    .failure()
    .stderr(predicate::str::contains("no [build] command"));
}

#[test]
fn cycle_is_reported_by_graph() {
  let env = TestEnv::project(
    "",
    &[
      ("a.cppm", "export module a;\nimport b;\n"),
      ("b.cppm", "export module b;\nimport a;\n"),
    ],
  );

  env
    .modbuild_cmd()
    .arg("graph")
    .assert()
    .failure()
    .stderr(predicate::str::contains("cyclic dependency"));
}

#[test]
fn graph_json_lists_edges() {
  let env = TestEnv::project("", CHAIN);

  let output = env
    .modbuild_cmd()
    .args(["graph", "-o", "json"])
    .output()
    .unwrap();
  assert!(output.status.success());

  let graph: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  let units = graph["units"].as_array().unwrap();
  assert_eq!(units.len(), 3);
  let top = units.iter().find(|u| u["unit"] == "src/top.cpp").unwrap();
  assert_eq!(top["edges"][0]["producer"], "src/mid.cppm");
  assert_eq!(top["edges"][0]["kind"], "import");
}

fn walk_count(dir: &std::path::Path, file_name: &str) -> usize {
  let mut count = 0;
  for entry in std::fs::read_dir(dir).unwrap() {
    let path = entry.unwrap().path();
    if path.is_dir() {
      count += walk_count(&path, file_name);
    } else if path.file_name().is_some_and(|n| n == file_name) {
      count += 1;
    }
  }
  count
}
