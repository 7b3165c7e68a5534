use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::task::JoinSet;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::admission::{AdmissionRequest, AdmissionStats};
use turnstile::config::{LogFormat, LoggingConfig, TurnstileConfig};
use turnstile::gateway::spawn_idle_sweeper;
use turnstile::queue::{QueueStats, TieredFallback};
use turnstile::ratelimit::LimiterSnapshot;
use turnstile::{Gateway, TurnstileError};

/// Replay JSON-lines requests from stdin through the admission layer.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long, env = "TURNSTILE_CONFIG")]
    config: Option<PathBuf>,

    /// Log output format, overriding the configuration file
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// Simulated upstream latency per admitted request
    #[arg(long, default_value_t = 5)]
    work_latency_ms: u64,

    /// Concurrent executions allowed in the degraded fallback
    #[arg(long, default_value_t = 64)]
    fallback_capacity: usize,
}

#[derive(Debug, Serialize)]
struct Outcome {
    line: usize,
    route: String,
    outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    response: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct Summary {
    admission: AdmissionStats,
    queue: QueueStats,
    limiters: Vec<LimiterSnapshot>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = TurnstileConfig::load(cli.config.as_deref())?;
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    init_tracing(&config.logging);

    info!("Starting Turnstile admission replay");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let gateway: Arc<Gateway<Value>> = Arc::new(Gateway::new(&config)?);
    let sweeper = spawn_idle_sweeper(gateway.registry().clone(), &config.registry);
    let fallback = TieredFallback::new().tier("degraded", cli.fallback_capacity, || async {
        Ok(json!({ "status": 200, "degraded": true }))
    });
    let latency = Duration::from_millis(cli.work_latency_ms);

    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    let mut inflight = JoinSet::new();
    let mut line_no = 0;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut interrupted = false;
    loop {
        let line = tokio::select! {
            line = lines.next() => line,
            _ = &mut shutdown => {
                interrupted = true;
                break;
            }
        };
        let Some(line) = line else {
            info!(requests = line_no, "Input exhausted");
            break;
        };
        let line = line?;
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }

        let request: AdmissionRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(line = line_no, error = %e, "Skipping malformed request");
                continue;
            }
        };

        let gateway = gateway.clone();
        let fallback = fallback.work_for(&request.route());
        let current = line_no;
        inflight.spawn(async move {
            let route = request.route();
            let upstream = route.clone();
            let result = gateway
                .handle(
                    &request,
                    move || async move {
                        tokio::time::sleep(latency).await;
                        Ok(json!({ "status": 200, "route": upstream }))
                    },
                    Some(fallback),
                )
                .await;
            Outcome::new(current, route, result)
        });

        while let Some(done) = inflight.try_join_next() {
            print_outcome(done?)?;
        }
    }

    drain(&gateway, &mut inflight, &mut shutdown, interrupted, print_outcome).await?;
    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }

    let summary = Summary {
        admission: gateway.admission_stats(),
        queue: gateway.queue_stats(),
        limiters: gateway.limiter_stats(None),
    };
    println!("{}", serde_json::to_string(&summary)?);

    info!("Turnstile stopped");
    Ok(())
}

/// Wait for every in-flight request, queued ones included.
///
/// Queues are only cleared once `stop` fires or `interrupted` is already set.
async fn drain<F, E>(
    gateway: &Gateway<Value>,
    inflight: &mut JoinSet<Outcome>,
    stop: F,
    mut interrupted: bool,
    mut emit: E,
) -> anyhow::Result<()>
where
    F: Future<Output = ()>,
    E: FnMut(Outcome) -> anyhow::Result<()>,
{
    tokio::pin!(stop);
    loop {
        if interrupted {
            let cleared = gateway.shutdown();
            if cleared > 0 {
                info!(cleared, "Cleared queued requests");
            }
            while let Some(done) = inflight.join_next().await {
                emit(done?)?;
            }
            return Ok(());
        }
        tokio::select! {
            done = inflight.join_next() => match done {
                Some(done) => emit(done?)?,
                None => return Ok(()),
            },
            _ = &mut stop => interrupted = true,
        }
    }
}

impl Outcome {
    fn new(line: usize, route: String, result: turnstile::Result<Value>) -> Self {
        let (outcome, response, error) = match result {
            Ok(response) => ("ok", Some(response), None),
            Err(e) => (classify_error(&e), None, Some(e.to_string())),
        };
        Self {
            line,
            route,
            outcome,
            response,
            error,
        }
    }
}

fn classify_error(err: &TurnstileError) -> &'static str {
    if err.is_rejection() {
        "rejected"
    } else if err.is_timeout() {
        "timeout"
    } else if err.is_cleared() {
        "cleared"
    } else {
        "error"
    }
}

fn print_outcome(outcome: Outcome) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(&outcome)?);
    Ok(())
}

/// Logs go to stderr; stdout carries the JSON-lines results.
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.with_thread_ids(true).init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping replay");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping replay");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use turnstile::Dimension;

    fn queued_replay() -> (Arc<Gateway<Value>>, JoinSet<Outcome>) {
        let mut config = TurnstileConfig::default();
        config.admission.order = vec![Dimension::Ip];
        config.admission.ip.qps = 1;
        config.admission.ip.burst = 0;
        config.admission.user.enabled = false;
        config.admission.url.enabled = false;
        config.admission.api_weight.enabled = false;
        let gateway: Arc<Gateway<Value>> = Arc::new(Gateway::new(&config).unwrap());

        let mut inflight = JoinSet::new();
        for line in 1..=3 {
            let gateway = gateway.clone();
            inflight.spawn(async move {
                let request = AdmissionRequest::new("10.1.0.1", "GET", "/api/replay");
                let result = gateway
                    .handle(&request, move || async move { Ok(json!({ "line": line })) }, None)
                    .await;
                Outcome::new(line, request.route(), result)
            });
        }
        (gateway, inflight)
    }

    async fn collect(
        gateway: &Gateway<Value>,
        inflight: &mut JoinSet<Outcome>,
        stop: impl Future<Output = ()>,
        interrupted: bool,
    ) -> Vec<&'static str> {
        let mut outcomes = Vec::new();
        drain(gateway, inflight, stop, interrupted, |outcome| {
            outcomes.push(outcome.outcome);
            Ok(())
        })
        .await
        .unwrap();
        outcomes
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_of_input_waits_for_queued_requests() {
        let (gateway, mut inflight) = queued_replay();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(gateway.queue_stats().total_depth, 2);

        let outcomes = collect(&gateway, &mut inflight, std::future::pending(), false).await;
        assert_eq!(outcomes, vec!["ok", "ok", "ok"]);
        assert_eq!(gateway.queue_stats().cleared, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_clears_queued_requests() {
        let (gateway, mut inflight) = queued_replay();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let mut outcomes = collect(&gateway, &mut inflight, std::future::ready(()), false).await;
        outcomes.sort();
        assert_eq!(outcomes, vec!["cleared", "cleared", "ok"]);
        assert_eq!(gateway.queue_stats().cleared, 2);
    }
}
