//! Servers file (CSV) loading
//!
//! Required columns: `ip`, `username`, `password`. Optional: `name`, `port`,
//! `jumphost`, `jumphost_user`, `jumphost_ssh_key`, `jumphost_ssh_password`.
//! Per-server jumphost fields override the global ones field by field.
//! Quoted fields may contain commas, doubled quotes and line breaks. Blank
//! lines are skipped; there is no comment syntax.

use crate::model::{Credentials, TargetConfig, TunnelAuth, TunnelSpec};
use anyhow::{anyhow, bail, Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const REQUIRED_COLUMNS: [&str; 3] = ["ip", "username", "password"];

/// One row of the servers file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEntry {
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub jumphost: Option<String>,
    pub jumphost_user: Option<String>,
    pub jumphost_ssh_key: Option<PathBuf>,
    pub jumphost_ssh_password: Option<String>,
}

/// Jumphost settings given on the command line, applied to every server
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelDefaults {
    pub jumphost: Option<String>,
    pub jumphost_user: Option<String>,
    pub ssh_key: Option<PathBuf>,
    pub ssh_password: Option<String>,
    pub jumphost_port: u16,
    /// `--no-tunnel`: ignore every jumphost
    pub disabled: bool,
}

impl TunnelDefaults {
    /// Tunnel for a target, merging per-server overrides over these defaults
    pub fn resolve(
        &self,
        jumphost: Option<&str>,
        user: Option<&str>,
        key: Option<&Path>,
        password: Option<&str>,
    ) -> Option<TunnelSpec> {
        let jumphost = jumphost.map(str::to_string).or_else(|| self.jumphost.clone())?;
        if self.disabled {
            return None;
        }

        let auth = TunnelAuth::select(
            key.map(Path::to_path_buf).or_else(|| self.ssh_key.clone()),
            password.map(str::to_string).or_else(|| self.ssh_password.clone()),
        );
        let mut spec = TunnelSpec::new(
            jumphost,
            user.map(str::to_string).or_else(|| self.jumphost_user.clone()),
            auth,
        );
        spec.jumphost_port = self.jumphost_port;
        Some(spec)
    }
}

impl ServerEntry {
    pub fn into_target(self, tunnels: &TunnelDefaults) -> TargetConfig {
        let tunnel = tunnels.resolve(
            self.jumphost.as_deref(),
            self.jumphost_user.as_deref(),
            self.jumphost_ssh_key.as_deref(),
            self.jumphost_ssh_password.as_deref(),
        );
        let target = TargetConfig::new(
            self.name,
            self.ip,
            self.port,
            Credentials::new(self.username, self.password),
        );
        match tunnel {
            Some(spec) => target.with_tunnel(spec),
            None => target,
        }
    }
}

/// Read and parse a servers file
pub async fn load_servers(path: &Path, default_port: u16) -> Result<Vec<ServerEntry>> {
    if !path.exists() {
        bail!("Server file not found: {}", path.display());
    }
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read server file {}", path.display()))?;
    let servers = parse_servers(&content, default_port)
        .with_context(|| format!("Invalid server file {}", path.display()))?;

    debug!("Loaded {} server(s) from {}", servers.len(), path.display());
    Ok(servers)
}

pub fn parse_servers(content: &str, default_port: u16) -> Result<Vec<ServerEntry>> {
    let mut lines = csv_records(content.trim_start_matches('\u{feff}'))
        .into_iter()
        .filter(|(_, record)| !record.trim().is_empty());

    let (_, header) = lines.next().ok_or_else(|| anyhow!("Server file is empty"))?;
    let columns: Vec<String> = split_csv_line(&header)
        .into_iter()
        .map(|c| c.trim().to_lowercase())
        .collect();

    let missing: Vec<_> = REQUIRED_COLUMNS
        .iter()
        .filter(|required| !columns.iter().any(|c| c.as_str() == **required))
        .collect();
    if !missing.is_empty() {
        bail!(
            "CSV must contain columns: {}\nFound: {}",
            REQUIRED_COLUMNS.join(", "),
            columns.join(", ")
        );
    }

    let mut servers = Vec::new();
    for (line_no, line) in lines {
        let fields = split_csv_line(&line);
        if fields.len() > columns.len() {
            warn!("line {}: {} extra field(s) ignored", line_no, fields.len() - columns.len());
        }

        let field = |name: &str| -> Option<String> {
            columns
                .iter()
                .position(|c| c == name)
                .and_then(|i| fields.get(i))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let required = |name: &str| -> Result<String> {
            field(name).ok_or_else(|| anyhow!("line {}: missing {}", line_no, name))
        };

        let ip = required("ip")?;
        let port = match field("port") {
            Some(port) => port
                .parse::<u16>()
                .map_err(|_| anyhow!("line {}: invalid port '{}'", line_no, port))?,
            None => default_port,
        };

        servers.push(ServerEntry {
            name: field("name").unwrap_or_else(|| ip.clone()),
            port,
            username: required("username")?,
            password: required("password")?,
            jumphost: field("jumphost"),
            jumphost_user: field("jumphost_user"),
            jumphost_ssh_key: field("jumphost_ssh_key").map(PathBuf::from),
            jumphost_ssh_password: field("jumphost_ssh_password"),
            ip,
        });
    }

    if servers.is_empty() {
        bail!("Server file lists no servers");
    }
    Ok(servers)
}

/// Group physical lines into records, keyed by their first line number.
///
/// A record continues while it has an odd number of quotes.
fn csv_records(content: &str) -> Vec<(usize, String)> {
    let mut records = Vec::new();
    let mut current: Option<(usize, String)> = None;

    for (i, line) in content.lines().enumerate() {
        match current.as_mut() {
            Some((_, record)) => {
                record.push('\n');
                record.push_str(line);
            }
            None => current = Some((i + 1, line.to_string())),
        }
        let closed = current
            .as_ref()
            .is_some_and(|(_, record)| record.matches('"').count() % 2 == 0);
        if closed {
            records.extend(current.take());
        }
    }
    // Unterminated quote runs to the end of the file
    records.extend(current);

    records
}

/// Split a CSV line respecting double-quote escaping.
fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                } else {
                    in_quotes = false;
                }
            } else {
                current.push(c);
            }
        } else if c == '"' {
            in_quotes = true;
        } else if c == ',' {
            fields.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    fields.push(current);

    fields
}
