use std::path::PathBuf;

use agent::{AgentOptions, EXIT_INTERNAL_ERROR, EXIT_TRANSPORT_FAILURE, run_agent};
use clap::Parser;
use types::init_tracing_with;

/// Worker process hosting one test driver for the gantry engine.
#[derive(Debug, Parser)]
#[command(name = "gantry-agent", about = "Gantry test agent")]
struct Args {
    /// Agent id assigned by the agency (textual 128-bit identifier).
    agent_id: String,
    /// Agency callback endpoint, `unix://<socket-path>`.
    agency_url: String,
    /// Process id of the controlling engine.
    #[arg(long = "pid")]
    pid: Option<u32>,
    /// Internal trace level.
    #[arg(long = "trace")]
    trace: Option<String>,
    /// Pause-friendly logging for debugging the agent itself.
    #[arg(long = "debug-agent")]
    debug_agent: bool,
    /// Working directory for the hosted driver.
    #[arg(long = "work")]
    work: Option<PathBuf>,
}

fn main() {
    let args = Args::parse();
    init_tracing_with(args.trace.as_deref());
    if args.debug_agent {
        tracing::info!(
            pid = std::process::id(),
            "debug requested; attach to this process before issuing commands"
        );
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("gantry-agent: async runtime init failed: {error}");
            std::process::exit(EXIT_INTERNAL_ERROR);
        }
    };

    let options = AgentOptions {
        agent_id: args.agent_id,
        agency_url: args.agency_url,
        controller_pid: args.pid,
        work_dir: args.work,
    };
    let code = match runtime.block_on(run_agent(options)) {
        Ok(code) => code,
        Err(error) => {
            eprintln!("gantry-agent: {error}");
            EXIT_TRANSPORT_FAILURE
        }
    };
    std::process::exit(code);
}
