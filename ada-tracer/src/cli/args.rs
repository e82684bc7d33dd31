//! CLI argument definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "ada-tracer",
    about = "Low-overhead function-call tracer core",
    version,
    after_help = "\
EXAMPLES:
    ada-tracer record --out ./trace                     Synthetic 4-thread run
    ada-tracer record --threads 16 --events 50000       Heavier run with defaults
    ada-tracer drain --session 4242 --out ./trace       Drain a session from another process
    ada-tracer inspect ./trace --json                   Summarize a trace directory"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a synthetic workload through an in-process session and drain it
    Record(RecordArgs),
    /// Attach to a running session and drain it until shutdown or Ctrl+C
    Drain(DrainArgs),
    /// Read a trace directory and verify its links
    Inspect(InspectArgs),
}

#[derive(clap::Args)]
pub struct RecordArgs {
    /// JSON session config (missing fields take defaults)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Output directory for index.atf, detail.atf and session.json
    #[arg(short, long, value_name = "DIR")]
    pub out: Option<PathBuf>,

    /// Session name used in segment names (defaults to the process id)
    #[arg(long)]
    pub session: Option<String>,

    /// Directory backing shared-memory segments
    #[arg(long, value_name = "DIR")]
    pub shm_root: Option<PathBuf>,

    /// Number of producer threads
    #[arg(short, long, default_value = "4")]
    pub threads: u32,

    /// Occurrences per thread
    #[arg(short, long, default_value = "10000")]
    pub events: u32,

    /// Attach a detail payload to every Nth occurrence (0 = never)
    #[arg(long, default_value = "16")]
    pub detail_every: u32,

    /// Detail payload size in bytes
    #[arg(long, default_value = "128")]
    pub payload: usize,

    /// Maximum call depth of the synthetic call trees
    #[arg(long, default_value = "8")]
    pub max_depth: u32,

    /// Print the drain report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(clap::Args)]
pub struct DrainArgs {
    /// Name of the session to attach to
    #[arg(short, long)]
    pub session: String,

    /// JSON session config (drain and output settings)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Output directory for index.atf, detail.atf and session.json
    #[arg(short, long, value_name = "DIR")]
    pub out: Option<PathBuf>,

    /// Directory backing shared-memory segments
    #[arg(long, value_name = "DIR")]
    pub shm_root: Option<PathBuf>,

    /// Stop after N seconds (0 = until shutdown or Ctrl+C)
    #[arg(long, default_value = "0")]
    pub duration: u64,

    /// Print the drain report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(clap::Args)]
pub struct InspectArgs {
    /// Trace directory containing index.atf
    #[arg(value_name = "DIR")]
    pub dir: PathBuf,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,

    /// Also print the first N index events
    #[arg(long, default_value = "0")]
    pub events: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_args_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_record_defaults() {
        let args = Args::parse_from(["ada-tracer", "record"]);
        let Command::Record(record) = args.command else {
            panic!("expected record");
        };
        assert_eq!(record.threads, 4);
        assert_eq!(record.events, 10_000);
        assert_eq!(record.detail_every, 16);
        assert!(record.out.is_none());
    }

    #[test]
    fn test_drain_requires_session() {
        assert!(Args::try_parse_from(["ada-tracer", "drain"]).is_err());
        let args = Args::parse_from(["ada-tracer", "drain", "--session", "s1", "--duration", "5"]);
        let Command::Drain(drain) = args.command else {
            panic!("expected drain");
        };
        assert_eq!(drain.session, "s1");
        assert_eq!(drain.duration, 5);
    }

    #[test]
    fn test_inspect_takes_dir() {
        let args = Args::parse_from(["ada-tracer", "inspect", "/tmp/trace", "--json"]);
        let Command::Inspect(inspect) = args.command else {
            panic!("expected inspect");
        };
        assert_eq!(inspect.dir, PathBuf::from("/tmp/trace"));
        assert!(inspect.json);
    }
}
