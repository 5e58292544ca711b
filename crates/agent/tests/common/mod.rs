//! Mock images shared by the agent integration tests: a framework image
//! and test binaries whose manifests reproduce the reference counts.
#![allow(dead_code)]

use std::path::{Path, PathBuf};

use agent::{CaseOutcome, TestCase, TestManifest, TestSuite};
use inspector::{IMAGE_EXTENSION, ImageMetadata, ImageVersion, write_image};

pub const FRAMEWORK_REFERENCE: &str = "nunit.framework";

pub fn write_framework_image(dir: &Path) -> PathBuf {
    write_framework_image_with_version(dir, ImageVersion::new(3, 14, 0))
}

pub fn write_framework_image_with_version(dir: &Path, version: ImageVersion) -> PathBuf {
    let path = dir.join(format!("{FRAMEWORK_REFERENCE}.{IMAGE_EXTENSION}"));
    let mut metadata = ImageMetadata::new(FRAMEWORK_REFERENCE, ".NETStandard,Version=v2.0");
    metadata.version = version;
    metadata.controller_type = Some("NUnit.Framework.Api.FrameworkController".to_owned());
    write_image(&path, &metadata, b"").expect("framework image should write");
    path
}

fn cases(prefix: &str, count: usize, outcome: CaseOutcome) -> Vec<TestCase> {
    (1..=count)
        .map(|index| {
            TestCase::new(
                format!("{prefix}{index}"),
                format!("Mock.Tests.{prefix}{index}"),
                outcome,
            )
        })
        .collect()
}

/// The net-4.5 reference mock: 31 cases — 18 passed, 5 failed,
/// 1 inconclusive, 7 skipped.
pub fn net45_mock_manifest() -> TestManifest {
    let mut suite = TestSuite::new("MockAssembly");
    let mut tests = TestSuite::new("Tests");
    tests.cases.extend(cases("Passes", 18, CaseOutcome::Passed));
    tests.cases.extend(cases("Fails", 5, CaseOutcome::Failed));
    tests
        .cases
        .extend(cases("Undecided", 1, CaseOutcome::Inconclusive));
    tests.cases.extend(cases("Ignored", 7, CaseOutcome::Skipped));
    suite.suites.push(tests);
    TestManifest { suite }
}

/// The netcore-2.1 reference mock: 36 counted cases — 23 passed,
/// 5 failed, 1 warning, 1 inconclusive, 6 skipped — plus one explicit
/// case that only shows up in the skip counter.
pub fn netcore21_mock_manifest() -> TestManifest {
    let mut suite = TestSuite::new("MockAssembly");
    let mut tests = TestSuite::new("Tests");
    tests.cases.extend(cases("Passes", 23, CaseOutcome::Passed));
    tests.cases.extend(cases("Fails", 5, CaseOutcome::Failed));
    tests.cases.extend(cases("Warns", 1, CaseOutcome::Warning));
    tests
        .cases
        .extend(cases("Undecided", 1, CaseOutcome::Inconclusive));
    tests.cases.extend(cases("Ignored", 6, CaseOutcome::Skipped));
    let mut explicit = TestCase::new("Manual1", "Mock.Tests.Manual1", CaseOutcome::Passed);
    explicit.explicit = true;
    tests.cases.push(explicit);
    suite.suites.push(tests);
    TestManifest { suite }
}

pub fn write_mock_binary(
    dir: &Path,
    file_stem: &str,
    target_framework: &str,
    manifest: &TestManifest,
) -> PathBuf {
    let path = dir.join(format!("{file_stem}.{IMAGE_EXTENSION}"));
    let mut metadata = ImageMetadata::new(file_stem, target_framework);
    metadata.references = vec!["System.Runtime".to_owned(), FRAMEWORK_REFERENCE.to_owned()];
    let body = manifest.to_bytes().expect("manifest should serialize");
    write_image(&path, &metadata, &body).expect("mock binary should write");
    path
}

/// A binary that references no test framework at all.
pub fn write_plain_binary(dir: &Path, file_stem: &str) -> PathBuf {
    let path = dir.join(format!("{file_stem}.{IMAGE_EXTENSION}"));
    let mut metadata = ImageMetadata::new(file_stem, ".NETCoreApp,Version=v3.1");
    metadata.references = vec!["System.Runtime".to_owned()];
    write_image(&path, &metadata, b"").expect("plain binary should write");
    path
}
