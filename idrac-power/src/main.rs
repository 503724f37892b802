use anyhow::{Context, Result};
use clap::Parser;
use idrac_power::cli::Cli;
use idrac_power::config::Settings;
use idrac_power::report::{render_fleet, render_target, write_report};
use idrac_power::{listen_for_signals, stop_channel, FleetMonitor, NullSink, ProgressSink, RedfishClient, SshTransport, TracingSink};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok(); // Fine when there is no .env
    let cli = Cli::parse();

    // Initialize logging (stderr, so stdout only carries the report)
    let default_filter = if cli.quiet { "idrac_power=warn" } else { "idrac_power=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match run(cli).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Returns whether at least one server produced data
async fn run(cli: Cli) -> Result<bool> {
    let settings = Settings::load(cli.config.as_deref()).await?;
    let plan = cli.resolve(&settings).await?;

    let client = RedfishClient::new(plan.verify_ssl, plan.request_timeout)
        .context("Failed to create HTTP client")?;
    let transport = SshTransport::new(plan.ssh_program.clone(), plan.connect_timeout);
    let sink: Arc<dyn ProgressSink> = if plan.quiet {
        Arc::new(NullSink)
    } else {
        Arc::new(TracingSink)
    };
    let monitor = FleetMonitor::new(client, transport).with_sink(sink);

    // SIGINT/SIGTERM stop the run; tunnels close and the partial report is printed
    let (stop_handle, stop) = stop_channel();
    listen_for_signals(stop_handle).context("Failed to install signal handlers")?;

    let fleet = monitor
        .monitor(&plan.targets, plan.mode, plan.max_workers, stop)
        .await;

    let text = match fleet.results.first() {
        Some(result) if plan.single => render_target(result, plan.format)?,
        _ => render_fleet(&fleet, plan.format)?,
    };

    if let Some(path) = &plan.output {
        let written = write_report(path, plan.format, &text).await?;
        if !plan.quiet {
            info!("Report saved to: {}", written.display());
        }
    }

    // Also print to stdout
    println!("{}", text);

    Ok(fleet.exit_success())
}
