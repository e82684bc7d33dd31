//! # ada-tracer - Main Entry Point
//!
//! Three subcommands:
//! - **record**: in-process session fed by the synthetic workload, drained on
//!   a background thread
//! - **drain**: attach to a session created by another process and drain it
//!   until its shutdown flag, `--duration` or Ctrl+C
//! - **inspect**: read a trace directory back and verify its links

// Report printing converts counters to floats and reads long
#![allow(clippy::too_many_lines, clippy::cast_precision_loss)]

use ada_tracer::atf::{LinkReport, RecoveryStatus, TraceReader};
use ada_tracer::cli::{Args, Command, DrainArgs, InspectArgs, RecordArgs};
use ada_tracer::clock;
use ada_tracer::config::SessionConfig;
use ada_tracer::domain::{EventKind, FunctionId, SetupError, ThreadId};
use ada_tracer::drain::{DrainReport, DrainThread, DrainWorker};
use ada_tracer::workload::{SyntheticWorkload, WorkloadReport};
use ada_tracer::{Session, Tracer};
use ada_tracer_common::NO_DETAIL_SEQ;
use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

/// Configuration mistakes are usage errors; everything else is a runtime failure
fn exit_code_for(err: &anyhow::Error) -> i32 {
    let usage = err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<SetupError>(),
            Some(SetupError::InvalidConfig(_) | SetupError::InvalidCapacity(_) | SetupError::Json(_))
        )
    });
    if usage {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();
    match args.command {
        Command::Record(record_args) => record(&record_args),
        Command::Drain(drain_args) => drain(&drain_args).await,
        Command::Inspect(inspect_args) => inspect(&inspect_args),
    }
}

fn load_config(path: Option<&Path>) -> Result<SessionConfig> {
    match path {
        Some(path) => {
            SessionConfig::from_file(path).with_context(|| format!("Failed to load config {}", path.display()))
        }
        None => Ok(SessionConfig::default()),
    }
}

fn record(args: &RecordArgs) -> Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(out) = &args.out {
        config.output_dir.clone_from(out);
    }
    if let Some(root) = &args.shm_root {
        config.shm_root.clone_from(root);
    }
    if args.session.is_some() {
        config.name.clone_from(&args.session);
    }
    if args.threads > config.registry.max_threads {
        warn!(
            "{} threads requested but the registry holds {}; the rest fall back to untraced",
            args.threads, config.registry.max_threads
        );
    }

    let session = Arc::new(Session::create(config).context("Failed to create session")?);
    session.start();
    let drain = DrainThread::spawn(DrainWorker::new(Arc::clone(&session)).context("Failed to open trace files")?)
        .context("Failed to start drain thread")?;

    let workload = SyntheticWorkload {
        threads: args.threads,
        events_per_thread: args.events,
        max_depth: args.max_depth,
        detail_every: args.detail_every,
        payload_len: args.payload,
        ..SyntheticWorkload::default()
    };
    let tracer = Tracer::new(Arc::clone(&session));
    let started = Instant::now();
    let produced = workload.run(&tracer);
    for i in 0..workload.threads {
        tracer.thread_exit(ThreadId(workload.first_thread_id.wrapping_add(i)));
    }
    let elapsed = started.elapsed();
    info!("workload finished in {elapsed:?}: {} of {} occurrences captured", produced.captured, produced.attempted);

    session.stop();
    let report = drain.stop().context("Drain failed")?;

    if args.json {
        let value = serde_json::json!({ "workload": produced, "drain": report });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        print_workload(&produced, elapsed);
        print_drain_report(&report);
    }
    Ok(())
}

async fn drain(args: &DrainArgs) -> Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    config.name = Some(args.session.clone());
    if let Some(out) = &args.out {
        config.output_dir.clone_from(out);
    }
    if let Some(root) = &args.shm_root {
        config.shm_root.clone_from(root);
    }

    let session = Arc::new(
        Session::attach(config).with_context(|| format!("Failed to attach to session {}", args.session))?,
    );
    let mut worker = DrainWorker::new(Arc::clone(&session)).context("Failed to open trace files")?;
    let poll = Duration::from_millis(session.config().drain.poll_interval_ms);
    let limit = (args.duration > 0).then(|| Duration::from_secs(args.duration));
    println!(
        "draining session {} ({}) into {}",
        session.name(),
        session.session_id(),
        session.config().output_dir.display()
    );

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let started = Instant::now();

    loop {
        worker.run_pass(clock::now_ns()).context("Drain pass failed")?;

        if session.control().shutdown_requested() {
            info!("session {} requested shutdown", session.name());
            break;
        }
        if limit.is_some_and(|limit| started.elapsed() >= limit) {
            info!("duration limit reached");
            break;
        }

        tokio::select! {
            () = tokio::time::sleep(poll) => {}
            _ = &mut ctrl_c => {
                info!("interrupted, finalizing");
                break;
            }
        }
    }

    let report = worker.finalize(clock::now_ns()).context("Failed to finalize trace")?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_drain_report(&report);
    }
    Ok(())
}

fn inspect(args: &InspectArgs) -> Result<()> {
    let reader =
        TraceReader::open(&args.dir).with_context(|| format!("Failed to read trace in {}", args.dir.display()))?;
    let links = reader.verify_links();

    if args.json {
        let events: Vec<_> = reader
            .events
            .iter()
            .take(args.events)
            .map(|e| {
                serde_json::json!({
                    "timestamp_ns": e.timestamp_ns,
                    "function_id": e.function_id,
                    "thread_id": e.thread_id,
                    "kind": EventKind::from_raw(e.event_kind).map(|k| k.to_string()),
                    "call_depth": e.call_depth,
                    "detail_seq": (e.detail_seq != NO_DETAIL_SEQ).then_some(e.detail_seq),
                })
            })
            .collect();
        let value = serde_json::json!({
            "index": reader,
            "index_events": reader.events.len(),
            "detail_events": reader.detail_events().len(),
            "links": links,
            "events": events,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        print_inspection(&reader, &links, args.events);
    }

    if !links.is_consistent() {
        anyhow::bail!(
            "Link verification failed: {} broken forward, {} broken backward",
            links.broken_forward.len(),
            links.broken_backward.len()
        );
    }
    Ok(())
}

fn status_label(status: RecoveryStatus) -> &'static str {
    match status {
        RecoveryStatus::Clean => "clean",
        RecoveryStatus::Recovered => "recovered by scan",
    }
}

fn print_workload(report: &WorkloadReport, elapsed: Duration) {
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    println!("\nworkload:");
    println!("  occurrences   {}", report.attempted);
    println!("  captured      {} ({:.0}/s)", report.captured, report.captured as f64 / secs);
    println!("  with detail   {}", report.with_detail);
}

fn print_drain_report(report: &DrainReport) {
    let summary = &report.summary;
    let span_ms = summary.time_end_ns.saturating_sub(summary.time_start_ns) as f64 / 1e6;
    println!("\ntrace:");
    println!("  index events  {}", summary.index_events);
    println!("  detail events {} ({} linked)", summary.detail_events, summary.linked_events);
    println!("  bytes         {} index / {} detail", summary.index_bytes, summary.detail_bytes);
    println!("  time range    {span_ms:.3} ms");

    let stats = &report.stats;
    println!("\ndrain:");
    println!("  passes        {}", stats.passes);
    println!("  global lane   {} written, {} mirrored discarded", stats.global_events_written, stats.mirrored_discarded);
    println!(
        "  unpaired      {} orphan, {} missing, {} filtered",
        stats.orphan_details, stats.missing_details, stats.filtered_details
    );
    if stats.rings_shed > 0 {
        println!("  shed          {} rings / {} events", stats.rings_shed, stats.shed_events);
    }
    println!("  mode changes  {} ({} stalls)", stats.mode_changes, stats.stalls_detected);

    let metrics = &report.metrics;
    println!("\nproducers:");
    println!(
        "  threads       {} registered, {} registration failures",
        metrics.registered_threads, metrics.registration_failures
    );
    println!(
        "  events        {} written, {} dropped ({:.2}%)",
        metrics.total_events_written, metrics.total_events_dropped, metrics.drop_rate_percent
    );
    println!("  swaps         {}", metrics.total_swaps);
    if let Some(path) = &report.manifest_path {
        println!("\nmanifest: {}", path.display());
    }
}

fn print_inspection(reader: &TraceReader, links: &LinkReport, show_events: usize) {
    let header = &reader.header;
    println!("index:  {} ({})", reader.events.len(), status_label(reader.status));
    println!("  arch {} / os {} / clock {}", header.arch, header.os, header.clock_type);
    if let Some(footer) = &reader.footer {
        println!("  footer: {} events, crc32 {:#010x}", footer.event_count, footer.checksum);
        println!("  time:   {} .. {} ns", footer.time_start_ns, footer.time_end_ns);
    }
    match &reader.detail {
        Some(detail) => {
            println!("detail: {} ({})", detail.events.len(), status_label(detail.status));
            println!(
                "  index range: {} .. {}",
                detail.header.index_seq_start, detail.header.index_seq_end
            );
            if let Some(footer) = &detail.footer {
                println!("  footer: {} events, crc32 {:#010x}", footer.event_count, footer.checksum);
            }
        }
        None => println!("detail: none"),
    }
    println!(
        "links:  {} linked, {} unlinked, {} broken forward, {} broken backward",
        links.linked,
        links.unlinked,
        links.broken_forward.len(),
        links.broken_backward.len()
    );

    if show_events > 0 {
        println!();
        for (pos, event) in reader.events.iter().take(show_events).enumerate() {
            let kind = EventKind::from_raw(event.event_kind).map_or_else(|| "?".to_string(), |k| k.to_string());
            let link = if event.detail_seq == NO_DETAIL_SEQ { String::new() } else { format!(" -> d{}", event.detail_seq) };
            println!(
                "{pos:>8} {:>16} t{:<6} {}{kind:<9} {}{link}",
                event.timestamp_ns,
                event.thread_id,
                "  ".repeat(event.call_depth.min(16) as usize),
                FunctionId(event.function_id),
            );
        }
    }
}
