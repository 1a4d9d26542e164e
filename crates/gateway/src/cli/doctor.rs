use tt_domain::config::{Config, ConfigSeverity};
use tt_memory::{MemoryProvider, RestMemoryClient};
use tt_scheduler::parse_trigger;
use tt_session::{SessionDriver, TmuxDriver};
use tt_store::{CaptureStore, Store};

/// Run all diagnostic checks and print a summary.
///
/// Returns `Ok(true)` when every check passes, `Ok(false)` when at least
/// one check failed.
pub async fn run(config: &Config, config_path: &str) -> anyhow::Result<bool> {
    println!("tether doctor");
    println!("=============\n");

    let mut all_passed = true;

    // 1. Config file
    check_config_file(config_path, &mut all_passed);

    // 2. Config validation
    check_config_validation(config, &mut all_passed);

    // 3. Job triggers
    check_job_triggers(config, &mut all_passed);

    // 4. Memory service connectivity
    check_memory_service(config).await;

    // 5. tmux + agent session
    check_session(config, &mut all_passed).await;

    // 6. Store
    check_store(config, &mut all_passed);

    // Summary
    println!();
    if all_passed {
        println!("All checks passed.");
    } else {
        println!("Some checks failed. Review the output above.");
    }

    Ok(all_passed)
}

// ── Individual checks ─────────────────────────────────────────────────

fn check_config_file(config_path: &str, all_passed: &mut bool) {
    let exists = std::path::Path::new(config_path).exists();
    print_check(
        "Config file exists",
        exists,
        if exists {
            config_path.to_owned()
        } else {
            format!("{config_path} not found (using defaults)")
        },
    );
    if !exists {
        *all_passed = false;
    }
}

fn check_config_validation(config: &Config, all_passed: &mut bool) {
    let issues = config.validate();
    let error_count = issues
        .iter()
        .filter(|e| e.severity == ConfigSeverity::Error)
        .count();

    if issues.is_empty() {
        print_check("Config validation", true, "no issues".into());
    } else {
        print_check(
            "Config validation",
            error_count == 0,
            format!("{} issue(s) ({} error(s))", issues.len(), error_count),
        );
        for issue in &issues {
            println!("      {issue}");
        }
        if error_count > 0 {
            *all_passed = false;
        }
    }
}

fn check_job_triggers(config: &Config, all_passed: &mut bool) {
    let bad: Vec<String> = config
        .jobs
        .iter()
        .filter_map(|job| parse_trigger(&job.trigger).err().map(|e| format!("{}: {e}", job.name)))
        .collect();
    let ok = bad.is_empty();
    print_check(
        "Job triggers",
        ok,
        if ok {
            format!("{} job(s)", config.jobs.len())
        } else {
            format!("{} invalid", bad.len())
        },
    );
    for line in &bad {
        println!("      {line}");
    }
    if !ok {
        *all_passed = false;
    }
}

async fn check_memory_service(config: &Config) {
    let url = &config.memory.base_url;
    let reachable = match RestMemoryClient::new(&config.memory) {
        Ok(client) => client.health().await.map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };

    let ok = reachable.is_ok();
    print_check(
        "Memory service reachable",
        ok,
        match reachable {
            Ok(_) => url.clone(),
            Err(e) => format!("{url} ({e})"),
        },
    );
    // Not fatal: turns fall back to cached context.
    if !ok {
        println!("      turns will use cached context until the service is back");
    }
}

async fn check_session(config: &Config, all_passed: &mut bool) {
    let tmux = TmuxDriver::new();
    let available = tmux.available().await;
    print_check(
        "tmux available",
        available,
        if available {
            "tmux -V ok".into()
        } else {
            "tmux not found on PATH".into()
        },
    );
    if !available {
        *all_passed = false;
        return;
    }

    let name = &config.session.name;
    match tmux.is_alive(name).await {
        Ok(alive) => print_check(
            "Agent session",
            true,
            if alive {
                format!("'{name}' running")
            } else {
                format!("'{name}' not running (started on first turn)")
            },
        ),
        Err(e) => {
            print_check("Agent session", false, e.to_string());
            *all_passed = false;
        }
    }
}

fn check_store(config: &Config, all_passed: &mut bool) {
    let path = &config.store.path;
    let result = Store::open(path.as_path()).and_then(|store| CaptureStore::new(store).stats());
    match result {
        Ok(stats) => print_check(
            "Store",
            true,
            format!(
                "{} ({} pending, {} failed)",
                path.display(),
                stats.pending_count,
                stats.failed_count
            ),
        ),
        Err(e) => {
            print_check("Store", false, format!("{} ({e})", path.display()));
            *all_passed = false;
        }
    }
}

// ── Formatting helper ─────────────────────────────────────────────────

fn print_check(name: &str, passed: bool, detail: String) {
    let status = if passed { "PASS" } else { "FAIL" };
    println!("  [{status}] {name}: {detail}");
}
