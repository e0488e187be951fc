use anyhow::{Context, Result};
use clap::Parser;
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "fscp",
    version,
    about = "Copy or move files between storage backends",
    long_about = "`fscp` copies or moves files and directory trees. Copies between different backends are \
streamed as tar archives through a flow-controlled stream, one file at a time.

Paths are plain local paths or URIs of the form scheme://host/path.

EXAMPLE:
    # Copy a directory into /backup, creating /backup/photos
    fscp -r /data/photos /backup/ --summary

    # Copy only the contents of a directory
    fscp -r /data/photos/ /backup/photos-2024"
)]
struct Args {
    // Copy options
    /// Copy directories recursively
    #[arg(short = 'r', long, help_heading = "Copy options")]
    recursive: bool,

    /// Delete a conflicting destination before copying
    #[arg(short = 'o', long, help_heading = "Copy options")]
    overwrite: bool,

    /// Copy a directory into an existing directory of the same name
    #[arg(
        short = 'm',
        long,
        conflicts_with = "overwrite",
        help_heading = "Copy options"
    )]
    merge: bool,

    /// Remove the source after it was copied
    #[arg(long = "move", help_heading = "Copy options")]
    move_source: bool,

    /// Give up on a streaming copy after this long
    ///
    /// Accepts a human readable duration, e.g. "30s", "5min" etc.
    #[arg(long, value_name = "DURATION", help_heading = "Copy options")]
    timeout: Option<humantime::Duration>,

    // Streaming
    /// Stream through a tar archive even when source and destination share a backend
    #[arg(long, help_heading = "Streaming")]
    stream: bool,

    /// Bytes in flight per stream before the sender waits for acknowledgements
    ///
    /// Accepts byte sizes like "64KiB", "1MiB", or plain numbers in bytes.
    #[arg(
        long,
        default_value = "256KiB",
        value_name = "SIZE",
        help_heading = "Streaming"
    )]
    window: bytesize::ByteSize,

    // Progress & output
    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    // ARGUMENTS
    /// Source path
    #[arg()]
    src: String,

    /// Destination path
    #[arg()]
    dst: String,
}

// Bare relative paths are taken relative to the working directory.
fn parse_location(location: &str) -> Result<fscp::Connection> {
    let conn = fscp::Connection::parse(location)?;
    if location.contains("://") || location.starts_with('/') {
        return Ok(conn);
    }
    let cwd = std::env::current_dir().context("failed reading the current directory")?;
    Ok(conn.with_path(&format!("{}/{}", cwd.display(), conn.path)))
}

#[instrument]
async fn async_main(args: Args) -> Result<fscp::Summary> {
    let src = parse_location(&args.src)?;
    let dst = parse_location(&args.dst)?;
    let stream = common::StreamConfig {
        window: args.window.0,
        force_stream: args.stream,
    };
    let broker = remote::broker::Broker::loopback();
    let mut engine = fscp::Engine::new(broker, stream);
    engine.register(std::sync::Arc::new(fscp::localfs::LocalFs::new("/")));
    let opts = fscp::FileCopyOpts {
        recursive: args.recursive,
        overwrite: args.overwrite,
        merge: args.merge,
        timeout: args.timeout.map(Into::into),
    };
    let result = if args.move_source {
        engine.move_path(&src, &dst, &opts).await
    } else {
        engine.copy(&src, &dst, &opts).await
    };
    match result {
        Ok(summary) => Ok(summary),
        Err(error) => {
            if args.summary {
                return Err(anyhow::anyhow!("{}\n\n{}", error, &error.summary));
            }
            Err(anyhow::anyhow!("{}", error))
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    if common::run(output, runtime, func).is_none() {
        std::process::exit(1);
    }
    Ok(())
}
