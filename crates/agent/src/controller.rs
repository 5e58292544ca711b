use thiserror::Error;

use crate::filter::{FilterError, TestFilter, xml_escape};
use crate::manifest::{CaseOutcome, TestCase, TestManifest, TestSuite};

/// Well-known type name of the framework controller; a framework image
/// declaring anything else is incompatible.
pub const CONTROLLER_TYPE_NAME: &str = "NUnit.Framework.Api.FrameworkController";

/// The controller surface is late-bound: the framework binary is unknown
/// at build time, so operations dispatch by name. This is the one place
/// the method names live.
pub const METHOD_LOAD_TESTS: &str = "LoadTests";
pub const METHOD_COUNT_TESTS: &str = "CountTests";
pub const METHOD_EXPLORE_TESTS: &str = "ExploreTests";
pub const METHOD_RUN_TESTS: &str = "RunTests";
pub const METHOD_STOP_RUN: &str = "StopRun";

/// Counters a run accumulates, mirroring the result document attributes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Tally {
    total: u32,
    passed: u32,
    failed: u32,
    warnings: u32,
    inconclusive: u32,
    skipped: u32,
    duration_ms: u64,
}

impl Tally {
    fn record(&mut self, case: &TestCase) {
        self.total += 1;
        self.duration_ms += case.duration_ms;
        match case.outcome {
            CaseOutcome::Passed => self.passed += 1,
            CaseOutcome::Failed => self.failed += 1,
            CaseOutcome::Warning => self.warnings += 1,
            CaseOutcome::Inconclusive => self.inconclusive += 1,
            CaseOutcome::Skipped => self.skipped += 1,
        }
    }

    /// An explicit case left out of the run: reported as skipped without
    /// entering the total.
    fn record_excluded(&mut self) {
        self.skipped += 1;
    }

    fn result_label(&self) -> &'static str {
        if self.failed > 0 { "Failed" } else { "Passed" }
    }
}

/// The in-worker handle to a loaded test binary: walks the embedded
/// manifest to answer the controller surface.
pub struct FrameworkController {
    binary_name: String,
    binary_path: String,
    manifest: TestManifest,
    stop_requested: bool,
}

impl FrameworkController {
    pub fn new(
        binary_name: impl Into<String>,
        binary_path: impl Into<String>,
        manifest: TestManifest,
    ) -> Self {
        Self {
            binary_name: binary_name.into(),
            binary_path: binary_path.into(),
            manifest,
            stop_requested: false,
        }
    }

    /// Name-indexed dispatch into the controller surface. `filter` is
    /// required by every method except `LoadTests` and `StopRun`;
    /// `emit` receives progress reports during `RunTests`.
    pub fn invoke(
        &mut self,
        method: &str,
        filter: Option<&str>,
        emit: &mut dyn FnMut(String),
    ) -> Result<String, ControllerError> {
        match method {
            METHOD_LOAD_TESTS => Ok(self.load_tests()),
            METHOD_COUNT_TESTS => self.count_tests(required_filter(method, filter)?),
            METHOD_EXPLORE_TESTS => self.explore_tests(required_filter(method, filter)?),
            METHOD_RUN_TESTS => self.run_tests(required_filter(method, filter)?, emit),
            METHOD_STOP_RUN => {
                self.stop_requested = true;
                Ok(String::new())
            }
            other => Err(ControllerError::UnknownMethod {
                method: other.to_owned(),
            }),
        }
    }

    fn load_tests(&self) -> String {
        format!(
            "<test-suite type=\"Assembly\" name=\"{}\" fullname=\"{}\" testcasecount=\"{}\" \
             runstate=\"Runnable\"/>",
            xml_escape(&self.binary_name),
            xml_escape(&self.binary_path),
            self.manifest.suite.case_count(),
        )
    }

    fn count_tests(&self, filter_text: &str) -> Result<String, ControllerError> {
        let filter = TestFilter::parse(filter_text)?;
        let count = self
            .manifest
            .suite
            .all_cases()
            .into_iter()
            .filter(|case| self.is_runnable(case, &filter))
            .count();
        Ok(count.to_string())
    }

    fn explore_tests(&self, filter_text: &str) -> Result<String, ControllerError> {
        let filter = TestFilter::parse(filter_text)?;
        Ok(render_suite(&self.manifest.suite, &filter))
    }

    fn run_tests(
        &mut self,
        filter_text: &str,
        emit: &mut dyn FnMut(String),
    ) -> Result<String, ControllerError> {
        let filter = TestFilter::parse(filter_text)?;
        let cases = self.manifest.suite.all_cases();

        let planned = cases
            .iter()
            .filter(|case| self.is_runnable(case, &filter))
            .count();
        emit(format!("<start-run count=\"{planned}\"/>"));

        let mut tally = Tally::default();
        let mut case_reports = String::new();
        for case in cases {
            if case.explicit && !filter.selects_explicitly(&case.full_name) {
                if filter.matches(&case.full_name) {
                    tally.record_excluded();
                    case_reports.push_str(&format!(
                        "<test-case name=\"{}\" fullname=\"{}\" result=\"Skipped\" \
                         label=\"Explicit\"/>",
                        xml_escape(&case.name),
                        xml_escape(&case.full_name),
                    ));
                }
                continue;
            }
            if !filter.matches(&case.full_name) {
                continue;
            }
            if self.stop_requested {
                // Cooperative stop: observed at a case boundary, the rest
                // of the run is abandoned.
                break;
            }
            emit(format!(
                "<start-test fullname=\"{}\"/>",
                xml_escape(&case.full_name)
            ));
            tally.record(case);
            let report = render_case_result(case);
            emit(report.clone());
            case_reports.push_str(&report);
        }

        Ok(format!(
            "<test-suite type=\"Assembly\" name=\"{}\" fullname=\"{}\" total=\"{}\" \
             passed=\"{}\" failed=\"{}\" warnings=\"{}\" inconclusive=\"{}\" skipped=\"{}\" \
             result=\"{}\" duration=\"{:.3}\">{}</test-suite>",
            xml_escape(&self.binary_name),
            xml_escape(&self.binary_path),
            tally.total,
            tally.passed,
            tally.failed,
            tally.warnings,
            tally.inconclusive,
            tally.skipped,
            tally.result_label(),
            tally.duration_ms as f64 / 1000.0,
            case_reports,
        ))
    }

    /// A case takes part in a run when the filter matches it, except that
    /// explicit cases require an explicit selection.
    fn is_runnable(&self, case: &TestCase, filter: &TestFilter) -> bool {
        if case.explicit {
            filter.selects_explicitly(&case.full_name)
        } else {
            filter.matches(&case.full_name)
        }
    }
}

fn required_filter<'a>(method: &str, filter: Option<&'a str>) -> Result<&'a str, ControllerError> {
    filter.ok_or_else(|| ControllerError::MissingArgument {
        method: method.to_owned(),
    })
}

fn render_case_result(case: &TestCase) -> String {
    let message = case
        .message
        .as_deref()
        .map(|message| format!(" message=\"{}\"", xml_escape(message)))
        .unwrap_or_default();
    format!(
        "<test-case name=\"{}\" fullname=\"{}\" result=\"{}\"{}/>",
        xml_escape(&case.name),
        xml_escape(&case.full_name),
        case.outcome.result_label(),
        message,
    )
}

fn render_suite(suite: &TestSuite, filter: &TestFilter) -> String {
    let mut children = String::new();
    for child in &suite.suites {
        let rendered = render_suite(child, filter);
        if !rendered.is_empty() {
            children.push_str(&rendered);
        }
    }
    let mut case_count = 0;
    for case in &suite.cases {
        if filter.matches(&case.full_name) {
            case_count += 1;
            children.push_str(&format!(
                "<test-case name=\"{}\" fullname=\"{}\"/>",
                xml_escape(&case.name),
                xml_escape(&case.full_name),
            ));
        }
    }
    if children.is_empty() {
        return String::new();
    }
    format!(
        "<test-suite type=\"TestSuite\" name=\"{}\" testcasecount=\"{}\">{}</test-suite>",
        xml_escape(&suite.name),
        case_count,
        children,
    )
}

/// Result document for a binary whose tests never ran, used by the
/// skipped-assembly driver and the filter-excludes shortcut.
pub fn skipped_suite_xml(name: &str, full_name: &str, label: &str) -> String {
    format!(
        "<test-suite type=\"Assembly\" name=\"{}\" fullname=\"{}\" total=\"0\" passed=\"0\" \
         failed=\"0\" warnings=\"0\" inconclusive=\"0\" skipped=\"0\" result=\"Skipped\" \
         label=\"{}\"/>",
        xml_escape(name),
        xml_escape(full_name),
        xml_escape(label),
    )
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("framework controller has no method `{method}`")]
    UnknownMethod { method: String },
    #[error("controller method `{method}` requires a filter argument")]
    MissingArgument { method: String },
    #[error(transparent)]
    Filter(#[from] FilterError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> FrameworkController {
        let mut suite = TestSuite::new("Mock");
        suite.cases.push(TestCase::new(
            "Passes",
            "Mock.Passes",
            CaseOutcome::Passed,
        ));
        suite.cases.push(TestCase::new(
            "Fails",
            "Mock.Fails",
            CaseOutcome::Failed,
        ));
        let mut explicit = TestCase::new("Manual", "Mock.Manual", CaseOutcome::Passed);
        explicit.explicit = true;
        suite.cases.push(explicit);
        FrameworkController::new(
            "mock",
            "/work/mock.gimg",
            TestManifest { suite },
        )
    }

    fn no_events() -> impl FnMut(String) {
        |_report| {}
    }

    #[test]
    fn load_tests_reports_the_assembly_node() {
        let mut controller = controller();
        let xml = controller
            .invoke(METHOD_LOAD_TESTS, None, &mut no_events())
            .expect("load should succeed");
        assert!(xml.contains("type=\"Assembly\""));
        assert!(xml.contains("testcasecount=\"3\""));
    }

    #[test]
    fn count_tests_excludes_unselected_explicit_cases() {
        let mut controller = controller();
        let count = controller
            .invoke(METHOD_COUNT_TESTS, Some("<filter/>"), &mut no_events())
            .expect("count should succeed");
        assert_eq!(count, "2");
    }

    #[test]
    fn explicit_case_runs_when_named_directly() {
        let mut controller = controller();
        let count = controller
            .invoke(
                METHOD_COUNT_TESTS,
                Some("<filter><test>Mock.Manual</test></filter>"),
                &mut no_events(),
            )
            .expect("count should succeed");
        assert_eq!(count, "1");
    }

    #[test]
    fn run_tests_tallies_and_streams_events() {
        let mut controller = controller();
        let mut events = Vec::new();
        let xml = controller
            .invoke(METHOD_RUN_TESTS, Some("<filter/>"), &mut |report| {
                events.push(report);
            })
            .expect("run should succeed");

        assert!(xml.contains("total=\"2\""));
        assert!(xml.contains("passed=\"1\""));
        assert!(xml.contains("failed=\"1\""));
        // Unselected explicit case shows up only in the skip counter.
        assert!(xml.contains("skipped=\"1\""));
        assert!(xml.contains("result=\"Failed\""));

        assert_eq!(events[0], "<start-run count=\"2\"/>");
        assert!(events[1].starts_with("<start-test"));
        assert!(events[2].contains("result=\"Passed\""));
    }

    #[test]
    fn unknown_method_is_refused() {
        let mut controller = controller();
        let error = controller
            .invoke("ReloadTests", None, &mut no_events())
            .expect_err("method is unknown");
        assert!(matches!(
            error,
            ControllerError::UnknownMethod { method } if method == "ReloadTests"
        ));
    }

    #[test]
    fn stop_run_abandons_later_cases() {
        let mut controller = controller();
        controller
            .invoke(METHOD_STOP_RUN, None, &mut no_events())
            .expect("stop should succeed");
        let xml = controller
            .invoke(METHOD_RUN_TESTS, Some("<filter/>"), &mut no_events())
            .expect("run should still answer");
        assert!(xml.contains("total=\"0\""));
    }
}
