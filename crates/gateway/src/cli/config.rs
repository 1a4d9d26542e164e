use tt_domain::config::{Config, ConfigSeverity};
use tt_scheduler::parse_trigger;

/// Parse and validate the config, printing any issues. Job triggers are
/// compiled as well, since a bad one stops `serve` from booting.
///
/// Returns `true` when there are no errors.
pub fn validate(config: &Config, config_path: &str) -> bool {
    let issues = config.validate();
    let trigger_errors: Vec<String> = config
        .jobs
        .iter()
        .filter_map(|job| {
            parse_trigger(&job.trigger)
                .err()
                .map(|e| format!("[ERROR] jobs.{}.trigger: {e}", job.name))
        })
        .collect();

    if issues.is_empty() && trigger_errors.is_empty() {
        println!("Config OK ({config_path})");
        return true;
    }

    let error_count = issues
        .iter()
        .filter(|e| e.severity == ConfigSeverity::Error)
        .count()
        + trigger_errors.len();
    let warning_count = issues.len() + trigger_errors.len() - error_count;

    for issue in &issues {
        println!("{issue}");
    }
    for line in &trigger_errors {
        println!("{line}");
    }

    println!("\n{error_count} error(s), {warning_count} warning(s) in {config_path}");

    error_count == 0
}

/// Dump the resolved config (with all defaults filled in) as TOML.
pub fn show(config: &Config) {
    match toml::to_string_pretty(config) {
        Ok(output) => print!("{output}"),
        Err(e) => {
            eprintln!("Failed to serialize config: {e}");
            std::process::exit(1);
        }
    }
}
