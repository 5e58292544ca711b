use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};
use types::SettingValue;

use crate::controller::{
    CONTROLLER_TYPE_NAME, ControllerError, FrameworkController, METHOD_COUNT_TESTS,
    METHOD_EXPLORE_TESTS, METHOD_LOAD_TESTS, METHOD_RUN_TESTS, METHOD_STOP_RUN, skipped_suite_xml,
};
use crate::filter::TestFilter;
use crate::manifest::TestManifest;

/// Lifecycle of a driver within its worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Unloaded,
    Loaded,
    Running,
    Stopped,
}

/// The contract every framework driver fulfils inside the worker.
pub trait Driver: Send {
    fn state(&self) -> DriverState;
    fn load(
        &mut self,
        package_settings: &BTreeMap<String, SettingValue>,
    ) -> Result<String, DriverError>;
    fn count_test_cases(&mut self, filter: &str) -> Result<u32, DriverError>;
    fn explore(&mut self, filter: &str) -> Result<String, DriverError>;
    fn run(
        &mut self,
        emit: &mut dyn FnMut(String),
        filter: &str,
    ) -> Result<String, DriverError>;
    fn stop_run(&mut self, force: bool) -> Result<(), DriverError>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("no test binary is loaded")]
    NotLoaded,
    #[error("forced stop is not supported inside the driver")]
    ForceStopNotSupported,
    #[error("bad binary `{path}`: {reason}")]
    BadBinary { path: PathBuf, reason: String },
    #[error("test framework `{reference}` not found; attempted paths: {attempted:?}")]
    FrameworkNotFound {
        reference: String,
        attempted: Vec<PathBuf>,
    },
    #[error("test framework `{name}` is incompatible: {reason}")]
    IncompatibleFramework { name: String, reason: String },
    #[error("driver fault: {cause}")]
    Fault { cause: String },
}

impl DriverError {
    /// Stable kind tag carried in wire error envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            DriverError::NotLoaded => "NotLoaded",
            DriverError::ForceStopNotSupported => "ForceStopNotSupported",
            DriverError::BadBinary { .. } => "BadBinary",
            DriverError::FrameworkNotFound { .. } => "FrameworkNotFound",
            DriverError::IncompatibleFramework { .. } => "IncompatibleFramework",
            DriverError::Fault { .. } => "DriverError",
        }
    }
}

impl From<ControllerError> for DriverError {
    fn from(source: ControllerError) -> Self {
        // Framework-side failures wrap at the driver boundary, keeping the
        // original cause.
        DriverError::Fault {
            cause: source.to_string(),
        }
    }
}

/// Picks the driver for a test binary. Inspection and framework
/// resolution happen here, at load time; failures produce a driver that
/// replays the error on every operation, so the worker always has exactly
/// one driver.
pub struct DriverService;

impl DriverService {
    pub fn get_driver(binary_path: &Path, skip_non_test: bool) -> Box<dyn Driver> {
        match Self::resolve(binary_path) {
            Ok(Resolution::Framework { framework_path }) => {
                debug!(
                    binary = %binary_path.display(),
                    framework = %framework_path.display(),
                    "selected in-process driver"
                );
                Box::new(InProcessDriver::new(
                    binary_path.to_path_buf(),
                    framework_path,
                ))
            }
            Ok(Resolution::NotATestAssembly) if skip_non_test => {
                info!(binary = %binary_path.display(), "skipping non-test assembly");
                Box::new(SkippedAssemblyDriver::new(binary_path.to_path_buf()))
            }
            Ok(Resolution::NotATestAssembly) => Box::new(InvalidBinaryDriver::new(
                DriverError::FrameworkNotFound {
                    reference: "<none>".to_owned(),
                    attempted: Vec::new(),
                },
            )),
            Err(error) => Box::new(InvalidBinaryDriver::new(error)),
        }
    }

    fn resolve(binary_path: &Path) -> Result<Resolution, DriverError> {
        let report = inspector::inspect(binary_path).map_err(|source| DriverError::BadBinary {
            path: binary_path.to_path_buf(),
            reason: source.to_string(),
        })?;
        let Some(reference) = report.test_framework_reference else {
            return Ok(Resolution::NotATestAssembly);
        };
        let framework_path = resolve_framework_image(binary_path, &reference)?;
        verify_framework(&framework_path, &reference)?;
        Ok(Resolution::Framework { framework_path })
    }
}

enum Resolution {
    Framework { framework_path: PathBuf },
    NotATestAssembly,
}

/// Looks for the framework image next to the test binary, trying the
/// reference's name verbatim and lower-cased with the image extension
/// appended. Anything beyond that is deliberately not guessed at; the
/// error carries every path that was tried.
fn resolve_framework_image(binary_path: &Path, reference: &str) -> Result<PathBuf, DriverError> {
    let directory = binary_path.parent().unwrap_or_else(|| Path::new("."));
    let candidates = [
        directory.join(format!("{reference}.{}", inspector::IMAGE_EXTENSION)),
        directory.join(format!(
            "{}.{}",
            reference.to_lowercase(),
            inspector::IMAGE_EXTENSION
        )),
    ];
    let mut attempted = Vec::new();
    for candidate in candidates {
        if candidate.is_file() {
            return Ok(candidate);
        }
        if !attempted.contains(&candidate) {
            attempted.push(candidate);
        }
    }
    Err(DriverError::FrameworkNotFound {
        reference: reference.to_owned(),
        attempted,
    })
}

/// The framework image must declare the well-known controller type and a
/// supported major version.
fn verify_framework(framework_path: &Path, reference: &str) -> Result<(), DriverError> {
    let metadata = inspector::ImageMetadata::read_from(framework_path).map_err(|source| {
        DriverError::IncompatibleFramework {
            name: reference.to_owned(),
            reason: source.to_string(),
        }
    })?;
    match metadata.controller_type.as_deref() {
        Some(CONTROLLER_TYPE_NAME) => {}
        Some(other) => {
            return Err(DriverError::IncompatibleFramework {
                name: reference.to_owned(),
                reason: format!("unexpected controller type `{other}`"),
            });
        }
        None => {
            return Err(DriverError::IncompatibleFramework {
                name: reference.to_owned(),
                reason: "image declares no controller type".to_owned(),
            });
        }
    }
    if metadata.version.major != 3 {
        return Err(DriverError::IncompatibleFramework {
            name: reference.to_owned(),
            reason: format!("framework version {} is out of range", metadata.version),
        });
    }
    Ok(())
}

/// Drives a loaded binary through the framework controller.
pub struct InProcessDriver {
    binary_path: PathBuf,
    framework_path: PathBuf,
    state: DriverState,
    controller: Option<FrameworkController>,
}

impl InProcessDriver {
    fn new(binary_path: PathBuf, framework_path: PathBuf) -> Self {
        Self {
            binary_path,
            framework_path,
            state: DriverState::Unloaded,
            controller: None,
        }
    }

    fn controller(&mut self) -> Result<&mut FrameworkController, DriverError> {
        if self.state == DriverState::Unloaded {
            return Err(DriverError::NotLoaded);
        }
        self.controller.as_mut().ok_or(DriverError::NotLoaded)
    }
}

impl Driver for InProcessDriver {
    fn state(&self) -> DriverState {
        self.state
    }

    fn load(
        &mut self,
        _package_settings: &BTreeMap<String, SettingValue>,
    ) -> Result<String, DriverError> {
        if self.state != DriverState::Unloaded {
            return Err(DriverError::Fault {
                cause: "a test binary is already loaded in this worker".to_owned(),
            });
        }
        let body =
            inspector::read_image_body(&self.binary_path).map_err(|source| {
                DriverError::BadBinary {
                    path: self.binary_path.clone(),
                    reason: source.to_string(),
                }
            })?;
        let manifest =
            TestManifest::from_bytes(&body).map_err(|source| DriverError::BadBinary {
                path: self.binary_path.clone(),
                reason: format!("malformed test manifest: {source}"),
            })?;
        let binary_name = self
            .binary_path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("assembly")
            .to_owned();
        let mut controller = FrameworkController::new(
            binary_name,
            self.binary_path.display().to_string(),
            manifest,
        );

        let mut sink = |_report: String| {};
        let tree = controller.invoke(METHOD_LOAD_TESTS, None, &mut sink)?;
        self.controller = Some(controller);
        self.state = DriverState::Loaded;
        info!(
            binary = %self.binary_path.display(),
            framework = %self.framework_path.display(),
            "test binary loaded"
        );
        Ok(tree)
    }

    fn count_test_cases(&mut self, filter: &str) -> Result<u32, DriverError> {
        let controller = self.controller()?;
        let mut sink = |_report: String| {};
        let count = controller.invoke(METHOD_COUNT_TESTS, Some(filter), &mut sink)?;
        count.parse().map_err(|_| DriverError::Fault {
            cause: format!("controller returned non-numeric count `{count}`"),
        })
    }

    fn explore(&mut self, filter: &str) -> Result<String, DriverError> {
        let controller = self.controller()?;
        let mut sink = |_report: String| {};
        Ok(controller.invoke(METHOD_EXPLORE_TESTS, Some(filter), &mut sink)?)
    }

    fn run(
        &mut self,
        emit: &mut dyn FnMut(String),
        filter: &str,
    ) -> Result<String, DriverError> {
        if self.state == DriverState::Stopped {
            return Err(DriverError::Fault {
                cause: "the driver has been stopped".to_owned(),
            });
        }
        // Shortcut: a filter that excludes the whole binary produces a
        // synthetic skipped suite without invoking the framework.
        let selected = self.count_test_cases(filter)?;
        let parsed = TestFilter::parse(filter).map_err(|source| DriverError::Fault {
            cause: source.to_string(),
        })?;
        if selected == 0 && !parsed.is_empty() {
            let name = self
                .binary_path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or("assembly")
                .to_owned();
            return Ok(skipped_suite_xml(
                &name,
                &self.binary_path.display().to_string(),
                "ExcludedByFilter",
            ));
        }

        self.state = DriverState::Running;
        let controller = self.controller()?;
        let result = controller.invoke(METHOD_RUN_TESTS, Some(filter), emit);
        self.state = DriverState::Loaded;
        Ok(result?)
    }

    fn stop_run(&mut self, force: bool) -> Result<(), DriverError> {
        if force {
            // Force is a process-level concern; the agency terminates the
            // worker instead.
            return Err(DriverError::ForceStopNotSupported);
        }
        let controller = self.controller()?;
        let mut sink = |_report: String| {};
        controller.invoke(METHOD_STOP_RUN, None, &mut sink)?;
        self.state = DriverState::Stopped;
        Ok(())
    }
}

/// Driver for a binary that failed inspection or framework resolution;
/// every operation replays the original failure.
pub struct InvalidBinaryDriver {
    error: DriverError,
}

impl InvalidBinaryDriver {
    pub fn new(error: DriverError) -> Self {
        Self { error }
    }
}

impl Driver for InvalidBinaryDriver {
    fn state(&self) -> DriverState {
        DriverState::Unloaded
    }

    fn load(
        &mut self,
        _package_settings: &BTreeMap<String, SettingValue>,
    ) -> Result<String, DriverError> {
        Err(self.error.clone())
    }

    fn count_test_cases(&mut self, _filter: &str) -> Result<u32, DriverError> {
        Err(self.error.clone())
    }

    fn explore(&mut self, _filter: &str) -> Result<String, DriverError> {
        Err(self.error.clone())
    }

    fn run(
        &mut self,
        _emit: &mut dyn FnMut(String),
        _filter: &str,
    ) -> Result<String, DriverError> {
        Err(self.error.clone())
    }

    fn stop_run(&mut self, force: bool) -> Result<(), DriverError> {
        if force {
            return Err(DriverError::ForceStopNotSupported);
        }
        Err(self.error.clone())
    }
}

/// Driver for a non-test assembly under `SkipNonTestAssemblies`: loads to
/// an empty, skipped suite.
pub struct SkippedAssemblyDriver {
    binary_path: PathBuf,
    state: DriverState,
}

impl SkippedAssemblyDriver {
    pub fn new(binary_path: PathBuf) -> Self {
        Self {
            binary_path,
            state: DriverState::Unloaded,
        }
    }

    fn suite_xml(&self) -> String {
        let name = self
            .binary_path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("assembly");
        skipped_suite_xml(
            name,
            &self.binary_path.display().to_string(),
            "NonTestAssembly",
        )
    }
}

impl Driver for SkippedAssemblyDriver {
    fn state(&self) -> DriverState {
        self.state
    }

    fn load(
        &mut self,
        _package_settings: &BTreeMap<String, SettingValue>,
    ) -> Result<String, DriverError> {
        self.state = DriverState::Loaded;
        Ok(self.suite_xml())
    }

    fn count_test_cases(&mut self, _filter: &str) -> Result<u32, DriverError> {
        if self.state == DriverState::Unloaded {
            return Err(DriverError::NotLoaded);
        }
        Ok(0)
    }

    fn explore(&mut self, _filter: &str) -> Result<String, DriverError> {
        if self.state == DriverState::Unloaded {
            return Err(DriverError::NotLoaded);
        }
        Ok(self.suite_xml())
    }

    fn run(
        &mut self,
        _emit: &mut dyn FnMut(String),
        _filter: &str,
    ) -> Result<String, DriverError> {
        if self.state == DriverState::Unloaded {
            return Err(DriverError::NotLoaded);
        }
        Ok(self.suite_xml())
    }

    fn stop_run(&mut self, force: bool) -> Result<(), DriverError> {
        if force {
            return Err(DriverError::ForceStopNotSupported);
        }
        if self.state == DriverState::Unloaded {
            return Err(DriverError::NotLoaded);
        }
        self.state = DriverState::Stopped;
        Ok(())
    }
}
