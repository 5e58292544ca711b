use serde::{Deserialize, Serialize};

/// Scripted outcome of one test case, as declared in the binary's
/// embedded manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseOutcome {
    Passed,
    Failed,
    Warning,
    Inconclusive,
    Skipped,
}

impl CaseOutcome {
    pub fn result_label(&self) -> &'static str {
        match self {
            CaseOutcome::Passed => "Passed",
            CaseOutcome::Failed => "Failed",
            CaseOutcome::Warning => "Warning",
            CaseOutcome::Inconclusive => "Inconclusive",
            CaseOutcome::Skipped => "Skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub name: String,
    pub full_name: String,
    pub outcome: CaseOutcome,
    /// Explicit cases run only when the filter names them; otherwise they
    /// are reported as skipped without entering the total.
    #[serde(default)]
    pub explicit: bool,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TestCase {
    pub fn new(name: impl Into<String>, full_name: impl Into<String>, outcome: CaseOutcome) -> Self {
        Self {
            name: name.into(),
            full_name: full_name.into(),
            outcome,
            explicit: false,
            duration_ms: 0,
            message: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TestSuite {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suites: Vec<TestSuite>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cases: Vec<TestCase>,
}

impl TestSuite {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            suites: Vec::new(),
            cases: Vec::new(),
        }
    }

    /// All cases of this suite and its descendants, in declaration order.
    pub fn all_cases(&self) -> Vec<&TestCase> {
        let mut cases: Vec<&TestCase> = self.cases.iter().collect();
        for suite in &self.suites {
            cases.extend(suite.all_cases());
        }
        cases
    }

    pub fn case_count(&self) -> usize {
        self.all_cases().len()
    }
}

/// The body of a test binary: the tree of suites and scripted cases the
/// framework controller walks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestManifest {
    pub suite: TestSuite,
}

impl TestManifest {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
