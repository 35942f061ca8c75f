use assert_fs::prelude::*;
use assert_fs::TempDir;
use kiln_module::{flags, MethodDef, ModuleImage, TypeDef};
use predicates::prelude::*;

use crate::support::{kiln, plugins_tree};

#[test]
fn help_mentions_core_commands() {
    kiln().arg("--help").assert().success().stdout(
        predicate::str::contains("build")
            .and(predicate::str::contains("analyze"))
            .and(predicate::str::contains("inspect")),
    );
}

#[test]
fn analyze_reports_requirements_as_json() {
    let temp = plugins_tree();
    let output = kiln()
        .arg("--root")
        .arg(temp.path())
        .args(["analyze", "Alpha", "Beta", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{output:?}");

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["units"][0]["unit"], "Alpha");
    assert_eq!(report["units"][0]["requires"], serde_json::json!(["Beta"]));
    assert_eq!(report["units"][1]["requires"], serde_json::json!([]));
    assert!(report["units"][0].get("error").is_none());
}

#[test]
fn analyze_flags_name_mismatch() {
    let temp = plugins_tree();
    kiln()
        .arg("--root")
        .arg(temp.path())
        .args(["analyze", "Wrong"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains(
            "Plugin filename Wrong.cs must match the main class Right (should be Right.cs)",
        ));
}

#[test]
fn build_without_worker_fails_every_unit() {
    let temp = plugins_tree();
    kiln()
        .arg("--root")
        .arg(temp.path())
        .args(["build", "Beta"])
        .assert()
        .code(1)
        .stdout(
            predicate::str::contains("Beta: error: worker unavailable")
                .and(predicate::str::contains("no worker executable configured"))
                .and(predicate::str::contains("summary: 0 compiled, 1 failed")),
        );
}

#[test]
fn build_reports_missing_dependency_before_compiling() {
    let temp = plugins_tree();
    let output = kiln()
        .arg("--root")
        .arg(temp.path())
        .args(["build", "Lonely", "--json"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1), "{output:?}");

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["failed"], 1);
    assert_eq!(report["units"][0]["unit"], "Lonely");
    assert_eq!(report["units"][0]["error"], "Missing dependency: Ghost");
}

#[test]
fn inspect_prints_module_types() {
    let temp = TempDir::new().unwrap();
    let mut module = ModuleImage::new("Alpha1.dll");
    module.references.push("System".into());
    let mut ty = TypeDef::new("Oxide.Plugins", "Alpha", flags::PUBLIC);
    ty.methods.push(MethodDef::new("OnServerInitialized", flags::PRIVATE));
    module.types.push(ty);
    let file = temp.child("Alpha1.dll");
    file.write_binary(&module.to_bytes().unwrap()).unwrap();

    kiln()
        .args(["inspect"])
        .arg(file.path())
        .assert()
        .success()
        .stdout(
            predicate::str::contains("module: Alpha1.dll")
                .and(predicate::str::contains("public type Oxide.Plugins.Alpha"))
                .and(predicate::str::contains("private method void OnServerInitialized()")),
        );

    let output = kiln().arg("inspect").arg(file.path()).arg("--json").output().unwrap();
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["types"][0]["name"], "Oxide.Plugins.Alpha");
    assert_eq!(report["references"], serde_json::json!(["System"]));
}

#[test]
fn inspect_rejects_garbage() {
    let temp = TempDir::new().unwrap();
    let file = temp.child("junk.dll");
    file.write_binary(b"not a module").unwrap();

    kiln()
        .arg("inspect")
        .arg(file.path())
        .assert()
        .code(2)
        .stderr(predicate::str::contains("is not a module image"));
}
