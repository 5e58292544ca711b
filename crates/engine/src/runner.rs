use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::info;
use types::{TestPackage, settings};

use crate::EngineError;
use crate::agency::TestAgency;
use crate::proxy::{TestAgent, TestEventListener};

/// Counters of one run, read from the result document's attributes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub warnings: u32,
    pub inconclusive: u32,
    pub skipped: u32,
}

impl RunSummary {
    /// Reads the counter attributes of the first element carrying a
    /// `total` attribute. Missing attributes count as zero.
    pub fn from_xml(xml: &str) -> Self {
        Self {
            total: attr_u32(xml, "total"),
            passed: attr_u32(xml, "passed"),
            failed: attr_u32(xml, "failed"),
            warnings: attr_u32(xml, "warnings"),
            inconclusive: attr_u32(xml, "inconclusive"),
            skipped: attr_u32(xml, "skipped"),
        }
    }

    pub fn accumulate(&mut self, other: RunSummary) {
        self.total += other.total;
        self.passed += other.passed;
        self.failed += other.failed;
        self.warnings += other.warnings;
        self.inconclusive += other.inconclusive;
        self.skipped += other.skipped;
    }

    pub fn result_label(&self) -> &'static str {
        if self.failed > 0 { "Failed" } else { "Passed" }
    }
}

/// Value of `name="..."` in the first tag of `xml` that carries it.
pub fn xml_attr<'a>(xml: &'a str, name: &str) -> Option<&'a str> {
    let marker = format!(" {name}=\"");
    let start = xml.find(&marker)? + marker.len();
    let rest = &xml[start..];
    let end = rest.find('"')?;
    Some(&rest[..end])
}

fn attr_u32(xml: &str, name: &str) -> u32 {
    xml_attr(xml, name)
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}

/// Controller-side runner for one package tree: inspects binaries, leases
/// agents, and forwards driver commands, aggregating per-binary results.
pub struct TestRunner {
    agency: Arc<TestAgency>,
    package: TestPackage,
    prepared: bool,
    agents: HashMap<String, TestAgent>,
    loaded: HashSet<String>,
    trees: HashMap<String, String>,
}

impl TestRunner {
    pub fn new(agency: Arc<TestAgency>, package: TestPackage) -> Self {
        Self {
            agency,
            package,
            prepared: false,
            agents: HashMap::new(),
            loaded: HashSet::new(),
            trees: HashMap::new(),
        }
    }

    pub fn package(&self) -> &TestPackage {
        &self.package
    }

    /// Inspects every leaf binary once and fills in the image-derived
    /// settings, including the target runtime when the caller left it
    /// unset.
    fn ensure_prepared(&mut self) -> Result<(), EngineError> {
        if self.prepared {
            return Ok(());
        }
        for leaf in self.package.leaves_mut() {
            let Some(path) = leaf.full_name().map(std::path::Path::to_path_buf) else {
                continue;
            };
            let report = inspector::inspect(&path)?;
            leaf.add_setting(
                settings::IMAGE_TARGET_FRAMEWORK_NAME,
                report.target_framework.to_string(),
            );
            if report.requires_x86 {
                leaf.add_setting(settings::IMAGE_REQUIRES_X86, true);
                leaf.add_setting(settings::RUN_AS_X86, true);
            }
            if let Some(reference) = &report.test_framework_reference {
                leaf.add_setting(settings::IMAGE_TEST_FRAMEWORK_REFERENCE, reference.clone());
            }
            if leaf.setting_str(settings::TARGET_RUNTIME_FRAMEWORK).is_none() {
                leaf.add_setting(
                    settings::TARGET_RUNTIME_FRAMEWORK,
                    report.target_runtime.to_string(),
                );
            }
            info!(
                binary = %path.display(),
                runtime = %report.target_runtime,
                "package prepared"
            );
        }
        self.prepared = true;
        Ok(())
    }

    async fn ensure_agent_loaded(&mut self, leaf: &TestPackage) -> Result<(), EngineError> {
        let leaf_id = leaf.id().to_owned();
        if !self.agents.contains_key(&leaf_id) {
            let agent = self.agency.get_agent(leaf).await?;
            self.agents.insert(leaf_id.clone(), agent);
        }
        if !self.loaded.contains(&leaf_id) {
            let Some(path) = leaf.full_name() else {
                return Ok(());
            };
            let settings_json = serde_json::to_string(leaf.settings())
                .unwrap_or_else(|_| "{}".to_owned());
            let agent = self
                .agents
                .get_mut(&leaf_id)
                .ok_or_else(|| EngineError::MissingAgent {
                    package_id: leaf_id.clone(),
                })?;
            let tree = agent.load(path, &settings_json).await?;
            self.trees.insert(leaf_id.clone(), tree);
            self.loaded.insert(leaf_id);
        }
        Ok(())
    }

    fn leaf_packages(&self) -> Vec<TestPackage> {
        self.package.leaves().into_iter().cloned().collect()
    }

    fn agent_for(&mut self, leaf_id: &str) -> Result<&mut TestAgent, EngineError> {
        self.agents
            .get_mut(leaf_id)
            .ok_or_else(|| EngineError::MissingAgent {
                package_id: leaf_id.to_owned(),
            })
    }

    /// Loads every leaf binary and returns the combined XML test tree.
    pub async fn load(&mut self) -> Result<String, EngineError> {
        self.ensure_prepared()?;
        let mut sections = Vec::new();
        for leaf in self.leaf_packages() {
            self.ensure_agent_loaded(&leaf).await?;
            if let Some(tree) = self.trees.get(leaf.id()) {
                sections.push(tree.clone());
            }
        }
        Ok(format!("<test-run>{}</test-run>", sections.concat()))
    }

    pub async fn count_test_cases(&mut self, filter: &str) -> Result<u32, EngineError> {
        self.ensure_prepared()?;
        let mut count = 0;
        for leaf in self.leaf_packages() {
            self.ensure_agent_loaded(&leaf).await?;
            count += self.agent_for(leaf.id())?.count_test_cases(filter).await?;
        }
        Ok(count)
    }

    pub async fn explore(&mut self, filter: &str) -> Result<String, EngineError> {
        self.ensure_prepared()?;
        let mut sections = Vec::new();
        for leaf in self.leaf_packages() {
            self.ensure_agent_loaded(&leaf).await?;
            sections.push(self.agent_for(leaf.id())?.explore(filter).await?);
        }
        Ok(format!("<test-run>{}</test-run>", sections.concat()))
    }

    /// Runs every leaf binary in package order, streaming events to
    /// `listener`, and returns the aggregated result document.
    pub async fn run(
        &mut self,
        listener: &mut dyn TestEventListener,
        filter: &str,
    ) -> Result<String, EngineError> {
        self.ensure_prepared()?;
        let mut sections = Vec::new();
        let mut summary = RunSummary::default();
        for leaf in self.leaf_packages() {
            self.ensure_agent_loaded(&leaf).await?;
            let section = self.agent_for(leaf.id())?.run(filter, listener).await?;
            summary.accumulate(RunSummary::from_xml(&section));
            sections.push(section);
        }
        Ok(format!(
            "<test-run total=\"{}\" passed=\"{}\" failed=\"{}\" warnings=\"{}\" \
             inconclusive=\"{}\" skipped=\"{}\" result=\"{}\">{}</test-run>",
            summary.total,
            summary.passed,
            summary.failed,
            summary.warnings,
            summary.inconclusive,
            summary.skipped,
            summary.result_label(),
            sections.concat(),
        ))
    }

    /// Cooperative stop (`force == false`) asks each driver to wind down;
    /// forced stop terminates the worker processes outright.
    pub async fn stop_run(&mut self, force: bool) -> Result<(), EngineError> {
        if force {
            for agent in self.agents.values() {
                self.agency.terminate_agent(agent).await;
            }
            self.agents.clear();
            self.loaded.clear();
            return Ok(());
        }
        for agent in self.agents.values_mut() {
            agent.stop_run(false).await?;
        }
        Ok(())
    }

    /// Releases every leased agent.
    pub async fn close(&mut self) -> Result<(), EngineError> {
        for (_, agent) in self.agents.drain() {
            self.agency.release_agent(agent).await?;
        }
        self.loaded.clear();
        Ok(())
    }
}
