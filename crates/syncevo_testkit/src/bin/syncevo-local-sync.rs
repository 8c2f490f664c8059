//! Local sync helper
//!
//! Started by `LocalTransportAgent` in the parent. Runs the scripted
//! nested session of the testkit and reports back over the inherited
//! connection.

use std::process::ExitCode;
use std::rc::Rc;

use clap::Parser;
use syncevo_local_transport::{log_channel, run_child};
use syncevo_testkit::ScriptedFactory;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Enables stderr logging in addition to forwarding logs to the parent.
const DEBUG_ENV: &str = "SYNCEVOLUTION_DEBUG";

/// Helper process of a local sync.
#[derive(Parser)]
#[command(name = "syncevo-local-sync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Also log to stderr
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let debug = cli.verbose || std::env::var_os(DEBUG_ENV).is_some();

    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    let stderr = debug.then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));
    let (forward, logs) = log_channel();
    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(forward)
        .init();

    let code = run_child(Rc::new(ScriptedFactory::new()), Some(logs));
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
