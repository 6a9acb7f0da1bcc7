//! Ballot Node
//!
//! Runs competing candidates and one observer against an in-memory store,
//! then checks the observed leadership history.

use ballot_core::{
    Context, Election, LeadershipHistory, MemoryStore, MemoryStoreConfig, Session, SessionConfig,
};
use clap::Parser;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Id the observer's snapshots are recorded under
const OBSERVER_ID: u64 = 0;

/// Revisions of store history the node keeps
const HISTORY_LIMIT: usize = 1024;

/// Leader election demo node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of competing candidates
    #[arg(short, long, default_value = "3")]
    candidates: usize,

    /// Election prefix
    #[arg(short, long, default_value = "/ballot/leader")]
    prefix: String,

    /// Session lease TTL in seconds
    #[arg(short, long, default_value = "5")]
    ttl: u64,

    /// Terms each candidate serves before stopping
    #[arg(short, long, default_value = "2")]
    rounds: usize,

    /// Base time a leader holds its term, in milliseconds
    #[arg(long, default_value = "200")]
    hold_ms: u64,

    /// Print the recorded history as JSON
    #[arg(long)]
    json: bool,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        "Ballot node starting: {} candidates on {} (ttl={}s)",
        args.candidates, args.prefix, args.ttl
    );

    let store = MemoryStore::with_config(MemoryStoreConfig {
        history_limit: HISTORY_LIMIT,
        ..MemoryStoreConfig::default()
    });
    let ttl = Duration::from_secs(args.ttl);
    let history = Arc::new(LeadershipHistory::new());

    // Observer
    let observe_ctx = Context::background().with_cancel();
    let observer_session = Arc::new(Session::new(store.clone(), SessionConfig::default().with_ttl(ttl)).await?);
    let observer = Election::new(observer_session.clone(), &args.prefix);
    let mut snapshots = observer.observe(&observe_ctx);
    let recorder = {
        let history = history.clone();
        tokio::spawn(async move {
            while let Some(kv) = snapshots.recv().await {
                info!("Node: Leader is {} ({})", kv.value_str(), kv.key);
                history.record(OBSERVER_ID, &kv);
            }
        })
    };

    // Candidates
    let mut handles = Vec::new();
    for id in 1..=args.candidates {
        let store = store.clone();
        let prefix = args.prefix.clone();
        let rounds = args.rounds;
        let hold_ms = args.hold_ms;
        handles.push(tokio::spawn(async move {
            run_candidate(store, id, prefix, ttl, rounds, hold_ms).await
        }));
    }

    let mut failures = 0;
    for handle in handles {
        match handle.await? {
            Ok(()) => {}
            Err(e) => {
                error!("Node: Candidate failed: {}", e);
                failures += 1;
            }
        }
    }

    // Let the observer drain the last resign
    tokio::time::sleep(Duration::from_millis(100)).await;
    observe_ctx.cancel();
    recorder.await?;
    observer_session.close().await?;

    let violations = history.check();
    for violation in &violations {
        warn!("Node: History violation: {}", violation);
    }
    info!(
        "Node: Observed {} snapshots across {} leaders, {} violations",
        history.len(),
        history.leaders().len(),
        violations.len()
    );

    if args.json {
        println!("{}", history.export_json());
    }

    if failures > 0 || !violations.is_empty() {
        return Err(format!("{} candidate failures, {} history violations", failures, violations.len()).into());
    }
    Ok(())
}

/// Campaign, hold, proclaim and resign for `rounds` terms, then close
async fn run_candidate(
    store: Arc<MemoryStore>,
    id: usize,
    prefix: String,
    ttl: Duration,
    rounds: usize,
    hold_ms: u64,
) -> ballot_core::Result<()> {
    let session = Arc::new(Session::new(store, SessionConfig::default().with_ttl(ttl)).await?);
    let mut election = Election::new(session.clone(), &prefix);
    let ctx = Context::background();
    let name = format!("candidate-{}", id);

    for round in 1..=rounds {
        election.campaign(&ctx, name.clone()).await?;
        info!("Node: {} elected for term {} (rev {})", name, round, election.rev());

        let hold = hold_ms + rand::thread_rng().gen_range(0..=hold_ms);
        tokio::time::sleep(Duration::from_millis(hold / 2)).await;
        election.proclaim(&ctx, format!("{}/term-{}", name, round)).await?;
        tokio::time::sleep(Duration::from_millis(hold - hold / 2)).await;

        election.resign(&ctx).await?;
        info!("Node: {} resigned after {}ms", name, hold);
    }

    session.close().await
}
