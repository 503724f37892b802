//! Command-line surface and run-plan resolution
//!
//! Precedence for every setting: flag > `IDRAC_*` environment > settings file > default.
//! Everything is resolved here, once; the engine never reads the environment.

use crate::config::{parse_duration, Settings};
use crate::inventory::{load_servers, TunnelDefaults};
use crate::model::{Credentials, MonitorMode, TargetConfig};
use crate::report::OutputFormat;
use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Parser)]
#[command(
    name = "idrac-power",
    version,
    about = "Read power usage from Dell iDRAC controllers, once or averaged over a window"
)]
pub struct Cli {
    /// iDRAC hostname or IP address (not needed with --servers-file)
    #[arg(long, env = "IDRAC_HOST")]
    pub host: Option<String>,

    /// iDRAC username (not needed with --servers-file)
    #[arg(short, long, env = "IDRAC_USERNAME")]
    pub username: Option<String>,

    /// iDRAC password (not needed with --servers-file)
    #[arg(short, long, env = "IDRAC_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// iDRAC HTTPS port [default: 443]
    #[arg(long, env = "IDRAC_PORT")]
    pub port: Option<u16>,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text, ignore_case = true)]
    pub format: OutputFormat,

    /// Verify SSL certificates (default unless the settings file says otherwise)
    #[arg(long, overrides_with = "no_verify_ssl")]
    pub verify_ssl: bool,

    /// Skip SSL certificate verification
    #[arg(long, overrides_with = "verify_ssl")]
    pub no_verify_ssl: bool,

    /// SSH jumphost to tunnel through
    #[arg(long, env = "IDRAC_JUMPHOST")]
    pub jumphost: Option<String>,

    /// SSH username for the jumphost (defaults to the current user)
    #[arg(long, env = "IDRAC_JUMPHOST_USER")]
    pub jumphost_user: Option<String>,

    /// SSH private key for the jumphost (agent/default keys when omitted)
    #[arg(long, env = "IDRAC_JUMPHOST_SSH_KEY", value_name = "PATH")]
    pub ssh_key: Option<PathBuf>,

    /// SSH password for the jumphost (only without keys; needs sshpass)
    #[arg(long, env = "IDRAC_JUMPHOST_SSH_PASSWORD", hide_env_values = true)]
    pub ssh_password: Option<String>,

    /// Disable SSH tunnels, including per-server jumphosts
    #[arg(long)]
    pub no_tunnel: bool,

    /// Monitor and average power over a duration (e.g. 24h, 30m, 1d)
    #[arg(long, value_name = "DURATION")]
    pub monitor: Option<String>,

    /// Sample interval for monitoring (e.g. 5m, 10m, 1h) [default: 5m]
    #[arg(long, value_name = "INTERVAL")]
    pub sample_interval: Option<String>,

    /// CSV file with the server list (columns: ip,username,password[,name,port,jumphost,...])
    #[arg(long, value_name = "CSV_FILE")]
    pub servers_file: Option<PathBuf>,

    /// Max servers monitored in parallel [default: 5]
    #[arg(long, value_name = "N")]
    pub max_workers: Option<usize>,

    /// Save the report to a file (.txt or .json added when missing)
    #[arg(short, long, value_name = "FILENAME")]
    pub output: Option<PathBuf>,

    /// Suppress progress messages (errors and the final report are still shown)
    #[arg(short, long)]
    pub quiet: bool,

    /// Settings file [default: <config dir>/idrac-power/config.toml]
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

/// Everything a run needs, fully resolved
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub targets: Vec<TargetConfig>,
    pub mode: MonitorMode,
    pub max_workers: usize,
    pub format: OutputFormat,
    pub output: Option<PathBuf>,
    pub quiet: bool,
    pub verify_ssl: bool,
    pub request_timeout: Duration,
    pub ssh_program: String,
    pub connect_timeout: Duration,
    /// No servers file: render the single-server layout
    pub single: bool,
}

impl Cli {
    pub async fn resolve(&self, settings: &Settings) -> Result<RunPlan> {
        let mode = self.mode(settings)?;
        let tunnels = self.tunnel_defaults(settings);
        let port = self.port.unwrap_or(settings.defaults.port);

        let (targets, single) = match &self.servers_file {
            Some(path) => {
                let servers = load_servers(path, port).await?;
                let targets = servers.into_iter().map(|s| s.into_target(&tunnels)).collect();
                (targets, false)
            }
            None => (vec![self.single_target(port, &tunnels)?], true),
        };

        Ok(RunPlan {
            targets,
            mode,
            max_workers: self.max_workers.unwrap_or(settings.defaults.max_workers).max(1),
            format: self.format,
            output: self.output.clone(),
            quiet: self.quiet,
            verify_ssl: self.verify_ssl(settings),
            request_timeout: settings.request_timeout(),
            ssh_program: settings.ssh.program.clone(),
            connect_timeout: settings.connect_timeout(),
            single,
        })
    }

    pub fn mode(&self, settings: &Settings) -> Result<MonitorMode> {
        let Some(monitor) = &self.monitor else {
            return Ok(MonitorMode::Instant);
        };

        let duration = parse_duration(monitor).context("Invalid --monitor value")?;
        let interval_text = self
            .sample_interval
            .as_deref()
            .unwrap_or(&settings.defaults.sample_interval);
        let interval = parse_duration(interval_text).context("Invalid --sample-interval value")?;
        if interval < Duration::from_secs(1) {
            bail!("Sample interval must be at least one second");
        }

        Ok(MonitorMode::Windowed { duration, interval })
    }

    pub fn verify_ssl(&self, settings: &Settings) -> bool {
        if self.no_verify_ssl {
            false
        } else if self.verify_ssl {
            true
        } else {
            settings.defaults.verify_ssl
        }
    }

    fn tunnel_defaults(&self, settings: &Settings) -> TunnelDefaults {
        if self.no_tunnel && self.jumphost.is_some() && !self.quiet {
            warn!("--no-tunnel specified, ignoring --jumphost");
        }

        TunnelDefaults {
            jumphost: self.jumphost.clone(),
            jumphost_user: self.jumphost_user.clone(),
            ssh_key: self.ssh_key.clone(),
            ssh_password: self.ssh_password.clone(),
            jumphost_port: settings.ssh.jumphost_port,
            disabled: self.no_tunnel,
        }
    }

    fn single_target(&self, port: u16, tunnels: &TunnelDefaults) -> Result<TargetConfig> {
        let (Some(host), Some(username), Some(password)) = (&self.host, &self.username, &self.password) else {
            bail!("Either --servers-file or all of --host, --username, and --password are required");
        };

        let target = TargetConfig::new(host.clone(), host.clone(), port, Credentials::new(username, password));
        Ok(match tunnels.resolve(None, None, None, None) {
            Some(spec) => target.with_tunnel(spec),
            None => target,
        })
    }
}
