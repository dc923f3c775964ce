//! Conformance tests that run YAML fixtures against celfilter
//!
//! Run with: cargo test -p celfilter-test --test conformance --features celfilter-test/fixtures
//!
//! Note: This test file requires the `fixtures` feature to be enabled.

#![cfg(feature = "fixtures")]

use celfilter::FilterEngine;
use celfilter_test::fixture::Fixture;
use std::fs;
use std::path::{Path, PathBuf};

/// The fixtures directory beside this crate's manifest
fn fixtures_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("fixtures")
}

/// Load and run one fixture file
fn run_fixture_file(name: &str) {
    let path = fixtures_dir().join(name);
    let yaml = fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("Failed to read {}: {e}", path.display()));

    // Parse potentially multiple fixtures (separated by ---)
    let fixtures = Fixture::from_yaml_multi(&yaml).unwrap_or_else(|e| {
        panic!("Failed to parse {}: {}", path.display(), e);
    });
    assert!(!fixtures.is_empty(), "{} has no fixtures", path.display());

    let engine = FilterEngine::new().expect("standard environment");
    for fixture in fixtures {
        println!("  Running: {}", fixture.name);
        fixture.run_and_assert(&engine);
    }
}

#[test]
fn test_semantics() {
    run_fixture_file("01_semantics.yaml");
}

#[test]
fn test_anchoring() {
    run_fixture_file("02_anchoring.yaml");
}

#[test]
fn test_state() {
    run_fixture_file("03_state.yaml");
}

#[test]
fn test_errors() {
    run_fixture_file("04_errors.yaml");
}

#[test]
fn test_extensions() {
    run_fixture_file("05_extensions.yaml");
}

#[test]
fn every_fixture_file_is_run() {
    let mut files: Vec<String> = fs::read_dir(fixtures_dir())
        .expect("read fixtures dir")
        .filter_map(|entry| {
            let path = entry.ok()?.path();
            let is_yaml = path.extension().is_some_and(|e| e == "yaml" || e == "yml");
            is_yaml.then(|| path.file_name()?.to_str().map(String::from))?
        })
        .collect();
    files.sort();
    assert_eq!(
        files,
        [
            "01_semantics.yaml",
            "02_anchoring.yaml",
            "03_state.yaml",
            "04_errors.yaml",
            "05_extensions.yaml"
        ]
    );
}
