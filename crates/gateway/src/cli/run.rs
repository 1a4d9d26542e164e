//! One-shot commands: `ask`, `jobs`, `queue`.
//!
//! Each builds the full runtime without the periodic background loops,
//! does one thing, prints the result and exits.

use std::sync::Arc;

use tt_domain::config::Config;
use tt_domain::error::Error;

use crate::bootstrap;
use crate::runtime::TurnRequest;
use crate::state::AppState;

async fn boot(config: Arc<Config>, config_path: String) -> anyhow::Result<AppState> {
    let shutdown = Arc::new(tokio::sync::Notify::new());
    bootstrap::build_app_state(config, config_path, shutdown).await
}

/// `tether ask "message"`: one turn through the shared session.
///
/// On failure the user-facing apology is printed to stderr and the
/// process exits with status 1.
pub async fn ask(
    config: Arc<Config>,
    config_path: String,
    message: String,
    channel: String,
    no_context: bool,
    json_output: bool,
) -> anyhow::Result<()> {
    let state = boot(config, config_path).await?;
    let label = format!("cli:{channel}");

    let mut req = TurnRequest::new(&label, &channel, &message);
    if no_context {
        req = req.without_context();
    }
    let result = state.bridge.ask(req).await;

    // Give the capture one chance to reach the memory service before exit;
    // whatever is left stays in the outbox for the next `serve`.
    if result.is_ok() {
        state.processor.run_cycle().await;
    }

    match result {
        Ok(reply) => {
            if json_output {
                let json = serde_json::to_string_pretty(&reply)
                    .map_err(|e| anyhow::anyhow!("serializing reply: {e}"))?;
                println!("{json}");
            } else {
                println!("{}", reply.text);
                if reply.context_degraded {
                    eprintln!("(memory context degraded)");
                }
            }
            Ok(())
        }
        Err(Error::GarbageResponse(reason)) => {
            eprintln!("reply suppressed: {reason}");
            std::process::exit(1);
        }
        Err(e) => {
            tracing::debug!(error = %e, "ask failed");
            match e.user_apology() {
                Some(apology) => eprintln!("{apology}\nerror: {e}"),
                None => eprintln!("error: {e}"),
            }
            std::process::exit(1);
        }
    }
}

/// `tether jobs list`
pub async fn jobs_list(config: Arc<Config>, config_path: String) -> anyhow::Result<()> {
    let state = boot(config, config_path).await?;
    let jobs = state.scheduler.jobs();
    if jobs.is_empty() {
        println!("No jobs configured.");
        return Ok(());
    }

    println!("{:<24} {:<28} {:<12} {:<8} NEXT RUN", "NAME", "TRIGGER", "CHANNEL", "ENABLED");
    for job in jobs {
        let next = job
            .next_run
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".into());
        println!(
            "{:<24} {:<28} {:<12} {:<8} {}",
            job.name, job.trigger, job.channel, job.enabled, next
        );
    }
    Ok(())
}

/// `tether jobs run <name>`: trigger now and wait for the scheduler to go
/// idle (bounded by the job's timeout plus `scheduler.start_grace_secs`).
pub async fn jobs_run(config: Arc<Config>, config_path: String, name: String) -> anyhow::Result<()> {
    let job_timeout = config
        .jobs
        .iter()
        .find(|j| j.name.eq_ignore_ascii_case(&name))
        .and_then(|j| j.timeout_secs)
        .map(std::time::Duration::from_secs)
        .unwrap_or_else(|| config.scheduler.job_timeout());
    let timeout = job_timeout + config.scheduler.start_grace();
    let state = boot(config, config_path).await?;

    let dispatch = state.scheduler.trigger_by_name(&name)?;
    println!("{name}: {}", serde_json::to_string(&dispatch)?);

    if !state.scheduler.wait_idle(timeout).await {
        eprintln!("job did not finish within {}s", timeout.as_secs());
        std::process::exit(1);
    }

    let stats = state.scheduler.stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);
    if stats.failed > 0 || stats.timed_out > 0 {
        std::process::exit(1);
    }
    Ok(())
}

/// `tether queue stats`
pub async fn queue_stats(config: Arc<Config>, config_path: String) -> anyhow::Result<()> {
    let state = boot(config, config_path).await?;
    let stats = state.captures.stats()?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

/// `tether queue flush`: recover in-flight captures, then run one
/// delivery cycle.
pub async fn queue_flush(config: Arc<Config>, config_path: String) -> anyhow::Result<()> {
    let state = boot(config, config_path).await?;

    let recovered = state.processor.recover();
    if recovered > 0 {
        println!("recovered {recovered} in-flight capture(s)");
    }

    let report = state.processor.run_cycle().await;
    if report.skipped_open {
        println!("memory breaker is open, nothing attempted");
    } else {
        println!(
            "attempted {}, sent {}, retried {}, failed {}{}",
            report.attempted,
            report.sent,
            report.retried,
            report.failed,
            if report.stopped_early { " (stopped early)" } else { "" }
        );
    }

    let stats = state.captures.stats()?;
    println!("{} pending, {} failed", stats.pending_count, stats.failed_count);
    Ok(())
}
