//! Integration tests: the checked-in test-group manifest.

use std::path::{Path, PathBuf};

use fwimage_harness::manifest::{SCHEMA_VERSION, TestManifest, load_groups};
use fwimage_harness::suite::{GroupKind, TestBody};

fn workspace_root() -> PathBuf {
    let manifest = env!("CARGO_MANIFEST_DIR");
    Path::new(manifest)
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .to_path_buf()
}

fn manifest_path() -> PathBuf {
    workspace_root().join("tests/harness/test_groups.v1.json")
}

#[test]
fn workspace_manifest_parses() {
    let manifest = TestManifest::from_file(&manifest_path()).expect("manifest should load");
    assert_eq!(manifest.schema_version, SCHEMA_VERSION);
    for name in manifest.groups.keys() {
        assert!(
            GroupKind::from_str_loose(name).is_some(),
            "unknown group {name}"
        );
    }
}

#[test]
fn workspace_manifest_fills_every_group() {
    let groups = load_groups(&manifest_path()).expect("groups should load");
    let kinds: Vec<_> = groups.iter().map(|group| group.kind()).collect();
    assert_eq!(kinds, GroupKind::ALL);
    for group in &groups {
        assert!(!group.cases().is_empty(), "{} has no tests", group.kind());
        for case in group.cases() {
            let TestBody::Command(spec) = case.body() else {
                panic!("manifest cases are commands");
            };
            assert!(!spec.argv.is_empty());
            if let Some(cwd) = &spec.cwd {
                assert!(cwd.is_absolute(), "cwd should be rebased: {}", cwd.display());
            }
        }
    }
}

#[test]
fn every_test_name_is_unique_across_groups() {
    let groups = load_groups(&manifest_path()).expect("groups should load");
    let mut seen = std::collections::BTreeSet::new();
    for group in &groups {
        for case in group.cases() {
            assert!(seen.insert(case.name().to_string()), "{} repeats", case.name());
        }
    }
}
