use predicates::prelude::*;

use super::common::{CHAIN, COPY_MANIFEST, TestEnv};

#[test]
fn gc_without_a_build_record_fails() {
  let env = TestEnv::project(COPY_MANIFEST, CHAIN);

  env
    .modbuild_cmd()
    .arg("gc")
    .assert()
    .failure()
    .stderr(predicate::str::contains("run a build before collecting garbage"));
}

#[cfg(unix)]
#[test]
fn gc_keeps_entries_of_the_last_build() {
  let env = TestEnv::project(COPY_MANIFEST, CHAIN);
  env.modbuild_cmd().arg("build").assert().success();

  env
    .modbuild_cmd()
    .arg("gc")
    .assert()
    .success()
    .stdout(predicate::str::contains("Garbage collection complete!"))
    .stdout(predicate::str::contains("Artifacts removed: 0"));

  env
    .modbuild_cmd()
    .arg("build")
    .assert()
    .success()
    .stdout(predicate::str::contains("Cache hits: 3"));
}

#[cfg(unix)]
#[test]
fn gc_dry_run_reports_stale_entries_without_deleting() {
  let env = TestEnv::project(COPY_MANIFEST, CHAIN);
  env.modbuild_cmd().arg("build").assert().success();

  env.write_file("src/leaf.cppm", "export module leaf;\nexport int g();\n");
  env.modbuild_cmd().arg("build").assert().success();

  env
    .modbuild_cmd()
    .args(["gc", "--dry-run", "-o", "json"])
    .assert()
    .success()
    .stdout(predicate::str::contains("\"dry_run\": true"))
    .stdout(predicate::str::contains("\"objects_deleted\": 3"));

  env
    .modbuild_cmd()
    .args(["gc"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Artifacts removed: 3"));
}
