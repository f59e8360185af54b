use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use qpool::{AllocTask, CancellationToken, Inventory, PoolConfig};

mod allocator;
mod report;

use allocator::{Conn, FlakyAllocator};
use report::SoakReport;

#[derive(Debug)]
struct Args {
    size: usize,
    ttl: Duration,
    consumers: usize,
    duration: Duration,
    fail_every: u64,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let args = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("error: {msg}");
            eprintln!();
            eprintln!("Usage: qpool-soak [options]");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --size <n>           Pool size [default: 4]");
            eprintln!("  --ttl-ms <ms>        Resource time-to-live [default: 200]");
            eprintln!("  --consumers <n>      Concurrent claimants [default: 8]");
            eprintln!("  --duration-ms <ms>   How long to churn before shutdown [default: 2000]");
            eprintln!("  --fail-every <n>     Fail every n-th allocation, 0 = never [default: 7]");
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(args) {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut parsed = Args {
        size: 4,
        ttl: Duration::from_millis(200),
        consumers: 8,
        duration: Duration::from_millis(2000),
        fail_every: 7,
    };

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--help" | "-h" => return Err("".to_string()),
            "--size" | "--ttl-ms" | "--consumers" | "--duration-ms" | "--fail-every" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| format!("{flag} requires a value"))?
                    .parse::<u64>()
                    .map_err(|e| format!("invalid value for {flag}: {e}"))?;
                match flag {
                    "--size" => parsed.size = to_usize(flag, value)?,
                    "--ttl-ms" => parsed.ttl = Duration::from_millis(value),
                    "--consumers" => parsed.consumers = to_usize(flag, value)?,
                    "--duration-ms" => parsed.duration = Duration::from_millis(value),
                    _ => parsed.fail_every = value,
                }
            }
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    Ok(parsed)
}

fn to_usize(flag: &str, value: u64) -> Result<usize, String> {
    usize::try_from(value).map_err(|_| format!("value for {flag} out of range: {value}"))
}

/// RUST_LOG wins; otherwise QPOOL_LOG picks the level. LOG_FORMAT=json
/// switches to structured output.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("QPOOL_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("qpool={base_level},qpool_soak={base_level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    runtime.block_on(soak(args))
}

async fn soak(args: Args) -> anyhow::Result<()> {
    let config = PoolConfig::new(args.size).with_ttl(args.ttl);
    let allocator = Arc::new(FlakyAllocator::new(args.fail_every));
    let inventory: Inventory<Conn> = Inventory::new();
    let shutdown = CancellationToken::new();

    let started_at = chrono::Utc::now();
    let handle = AllocTask::new(config.clone(), Arc::clone(&allocator), inventory.clone())
        .context("invalid pool configuration")?
        .with_cancellation_token(shutdown.child_token())
        .spawn();

    let claims = Arc::new(AtomicU64::new(0));
    let retired = Arc::new(AtomicU64::new(0));
    let consumers: Vec<_> = (0..args.consumers)
        .map(|n| {
            let inventory = inventory.clone();
            let claims = Arc::clone(&claims);
            let retired = Arc::clone(&retired);
            tokio::spawn(async move {
                while let Some(mut slot) = inventory.claim().await {
                    claims.fetch_add(1, Ordering::Relaxed);
                    let usable = !slot.is_poisoned() && !slot.is_expired();
                    if usable && let Some(conn) = slot.resource_mut() {
                        conn.uses += 1;
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        if let Err(e) = slot.release() {
                            tracing::warn!(consumer = n, error = %e, "Release failed");
                            break;
                        }
                    } else {
                        retired.fetch_add(1, Ordering::Relaxed);
                        if let Err(e) = inventory.retire(slot) {
                            tracing::warn!(consumer = n, error = %e, "Retire failed");
                            break;
                        }
                    }
                }
                tracing::debug!(consumer = n, "Consumer observed shutdown");
            })
        })
        .collect();

    tokio::select! {
        _ = tokio::time::sleep(args.duration) => {}
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for ctrl-c")?;
            tracing::info!("Interrupted - shutting down early");
        }
    }

    shutdown.cancel();
    let completed = handle.shutdown_and_wait(Some(Duration::from_secs(30))).await;
    for consumer in consumers {
        consumer.await.context("consumer task failed")?;
    }

    let report = SoakReport {
        config,
        stats: handle.stats(),
        state: handle.state(),
        completed,
        claims: claims.load(Ordering::Relaxed),
        retired: retired.load(Ordering::Relaxed),
        leaked: allocator.live_resources(),
        started_at: started_at.to_rfc3339(),
        finished_at: chrono::Utc::now().to_rfc3339(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !completed {
        anyhow::bail!("drain did not complete in time");
    }
    Ok(())
}
