use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use engine::{
    EngineConfig, EngineError, RunSummary, TestEngine, TestEventListener, TestFilterBuilder,
    load_engine_config,
};
use types::{TestPackage, init_tracing_with, settings};

/// Runs compiled test binaries in isolated worker processes.
#[derive(Debug, Parser)]
#[command(name = "gantry", about = "Gantry test execution engine")]
struct Args {
    /// Test binaries to execute, in order.
    #[arg(required = true)]
    binaries: Vec<PathBuf>,
    /// Engine configuration file (TOML).
    #[arg(short = 'c', long = "config")]
    config_path: Option<PathBuf>,
    /// Target runtime override, e.g. `net-4.5` or `netcore-3.1`.
    #[arg(long = "runtime")]
    runtime: Option<String>,
    /// Select a fully-qualified test by name; repeatable.
    #[arg(long = "filter-test")]
    filter_tests: Vec<String>,
    /// Working directory forwarded to the workers.
    #[arg(long = "work-dir")]
    work_dir: Option<PathBuf>,
    /// Internal trace level for engine and workers.
    #[arg(long = "trace")]
    trace: Option<String>,
    /// Force 32-bit workers.
    #[arg(long = "x86")]
    run_as_x86: bool,
    /// Count matching test cases instead of running them.
    #[arg(long = "count-only")]
    count_only: bool,
}

/// Prints each progress report to stdout as it arrives.
struct ConsoleListener;

impl TestEventListener for ConsoleListener {
    fn on_test_event(&mut self, report: &str) {
        println!("{report}");
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing_with(args.trace.as_deref());

    match run(args) {
        Ok(failed) => {
            // Legacy convention: the exit code is the failed-test count.
            ExitCode::from(failed.min(u8::MAX as u32) as u8)
        }
        Err(error) => {
            eprintln!("gantry error: {error}");
            ExitCode::from(u8::MAX)
        }
    }
}

fn run(args: Args) -> Result<u32, EngineError> {
    let config = match &args.config_path {
        Some(path) => load_engine_config(path)?,
        None => EngineConfig::default(),
    };
    let engine = TestEngine::new(config)?;

    let mut package = if let [only] = args.binaries.as_slice() {
        TestPackage::new(only.clone())
    } else {
        TestPackage::aggregate(args.binaries.iter().cloned())
    };
    if let Some(runtime) = &args.runtime {
        package.add_setting(settings::TARGET_RUNTIME_FRAMEWORK, runtime.as_str());
    }
    if let Some(work_dir) = &args.work_dir {
        package.add_setting(settings::WORK_DIRECTORY, work_dir.display().to_string());
    }
    if let Some(trace) = &args.trace {
        package.add_setting(settings::INTERNAL_TRACE_LEVEL, trace.as_str());
    }
    if args.run_as_x86 {
        package.add_setting(settings::RUN_AS_X86, true);
    }

    let mut filter_builder = TestFilterBuilder::new();
    for test_name in &args.filter_tests {
        filter_builder.add_test(test_name.as_str());
    }
    let filter = filter_builder.build();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|source| EngineError::Agency(engine::AgencyError::AgentLaunchFailed {
            cause: format!("async runtime init failed: {source}"),
        }))?;

    runtime.block_on(async {
        let mut runner = engine.runner(package);
        if args.count_only {
            let count = runner.count_test_cases(&filter).await?;
            println!("test_cases={count}");
            runner.close().await?;
            return Ok(0);
        }

        let mut listener = ConsoleListener;
        let result = runner.run(&mut listener, &filter).await?;
        runner.close().await?;

        let summary = RunSummary::from_xml(&result);
        println!("result={}", summary.result_label());
        println!(
            "total={} passed={} failed={} warnings={} inconclusive={} skipped={}",
            summary.total,
            summary.passed,
            summary.failed,
            summary.warnings,
            summary.inconclusive,
            summary.skipped
        );
        Ok(summary.failed)
    })
}
