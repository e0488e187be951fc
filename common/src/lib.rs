//! Shared building blocks for the fscp tools
//!
//! This crate holds the pieces that do not depend on any transport:
//!
//! - [`pathtree`]: rebuilds a virtual directory hierarchy from a flat listing of keys
//! - [`path`]: helpers for `/`-separated storage paths (prefix stores have no real directories)
//! - [`rm`]: recursive removal used by the local filesystem backend
//! - [`config`]: runtime, output and stream configuration shared by the binaries
//! - [`run`]: builds the tokio runtime, sets up logging and reports the outcome of an operation

pub mod config;
pub mod path;
pub mod pathtree;
pub mod rm;
pub mod testutils;

pub use config::{OutputConfig, RuntimeConfig, StreamConfig};

fn get_tracing_level(verbose: u8) -> tracing::Level {
    match verbose {
        0 => tracing::Level::ERROR,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    }
}

fn init_tracing(output: &OutputConfig) {
    let level = get_tracing_level(output.verbose);
    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing_subscriber::filter::LevelFilter::from_level(level).into())
        .from_env_lossy();
    // a subscriber may already be installed, e.g. when running under a test harness
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Runs `func` on a freshly built tokio runtime and reports its outcome.
///
/// Returns `None` if the runtime could not be created or the operation failed. Errors are logged
/// unless `output.quiet` is set; the summary is printed when requested or when running verbose.
pub fn run<Fut, Summary>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Fut: std::future::Future<Output = anyhow::Result<Summary>>,
    Summary: std::fmt::Display,
{
    init_tracing(&output);
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let runtime = match builder.build() {
        Ok(runtime) => runtime,
        Err(error) => {
            if !output.quiet {
                eprintln!("failed to start tokio runtime: {error:#}");
            }
            return None;
        }
    };
    match runtime.block_on(func()) {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{summary}");
            }
            Some(summary)
        }
        Err(error) => {
            if !output.quiet {
                tracing::error!("{:#}", error);
                eprintln!("{error:#}");
            }
            None
        }
    }
}
