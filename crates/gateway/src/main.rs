use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig as _;

use tt_domain::config::ObservabilityConfig;
use tt_gateway::cli::{self, Cli, Command, ConfigCommand, JobsCommand, QueueCommand};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    match args.command {
        None | Some(Command::Serve) => {
            let (config, config_path) = cli::load_config()?;
            let tracer_provider = init_tracing(&config.observability);
            let result = tt_gateway::server::run(Arc::new(config), config_path).await;
            // Flush pending spans before exit.
            if let Some(provider) = tracer_provider {
                if let Err(e) = provider.shutdown() {
                    tracing::warn!(error = ?e, "OpenTelemetry tracer provider shutdown failed");
                }
            }
            result
        }
        Some(Command::Doctor) => {
            let (config, config_path) = cli::load_config()?;
            if !cli::doctor::run(&config, &config_path).await? {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let (config, config_path) = cli::load_config()?;
            if !cli::config::validate(&config, &config_path) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let (config, _) = cli::load_config()?;
            cli::config::show(&config);
            Ok(())
        }
        Some(Command::Ask {
            message,
            channel,
            no_context,
            json,
        }) => {
            init_cli_tracing();
            let (config, path) = cli::load_config()?;
            cli::run::ask(Arc::new(config), path, message, channel, no_context, json).await
        }
        Some(Command::Jobs(cmd)) => {
            init_cli_tracing();
            let (config, path) = cli::load_config()?;
            let config = Arc::new(config);
            match cmd {
                JobsCommand::List => cli::run::jobs_list(config, path).await,
                JobsCommand::Run { name } => cli::run::jobs_run(config, path, name).await,
            }
        }
        Some(Command::Queue(cmd)) => {
            init_cli_tracing();
            let (config, path) = cli::load_config()?;
            let config = Arc::new(config);
            match cmd {
                QueueCommand::Stats => cli::run::queue_stats(config, path).await,
                QueueCommand::Flush => cli::run::queue_flush(config, path).await,
            }
        }
        Some(Command::Version) => {
            println!("tether {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured JSON logs for `serve`, plus an OTLP span exporter when
/// `observability.otlp_endpoint` is set. The returned provider must be
/// shut down on exit.
fn init_tracing(obs: &ObservabilityConfig) -> Option<opentelemetry_sdk::trace::SdkTracerProvider> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tt_gateway=debug"));
    let fmt_layer = tracing_subscriber::fmt::layer().json();

    let Some(endpoint) = &obs.otlp_endpoint else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();
        return None;
    };

    let exporter = match opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
    {
        Ok(e) => e,
        Err(e) => {
            eprintln!("WARNING: OTLP exporter for {endpoint} failed ({e}), continuing without it");
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .init();
            return None;
        }
    };

    let resource = opentelemetry_sdk::Resource::builder()
        .with_service_name(obs.service_name.clone())
        .build();
    let provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(opentelemetry_sdk::trace::Sampler::TraceIdRatioBased(
            obs.sample_rate,
        ))
        .with_resource(resource)
        .build();
    let otel_layer = tracing_opentelemetry::layer().with_tracer(provider.tracer("tether"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .init();

    Some(provider)
}

/// Compact stderr logging at `warn` so one-shot output on stdout stays clean.
fn init_cli_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .compact()
        .init();
}
