//! Target description types shared by every stage of the pipeline
//!
//! A `TargetConfig` is fully resolved before it reaches the engine:
//! credentials, port and tunnel material are already decided.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Default SSH port on jumphosts
pub const DEFAULT_JUMPHOST_PORT: u16 = 22;

/// Controller login
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// How to authenticate against a jumphost.
///
/// Exactly one method is used per tunnel.
#[derive(Clone, PartialEq, Eq)]
pub enum TunnelAuth {
    KeyFile(PathBuf),
    Password(String),
    /// ssh-agent and default identities (~/.ssh/id_*)
    Agent,
}

impl TunnelAuth {
    /// Pick auth material by priority: key path, then password, then agent.
    /// A password supplied next to a key is ignored.
    pub fn select(key_path: Option<PathBuf>, password: Option<String>) -> Self {
        match (key_path, password) {
            (Some(key), _) => TunnelAuth::KeyFile(key),
            (None, Some(password)) => TunnelAuth::Password(password),
            (None, None) => TunnelAuth::Agent,
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            TunnelAuth::KeyFile(_) => "key",
            TunnelAuth::Password(_) => "password",
            TunnelAuth::Agent => "agent",
        }
    }
}

impl fmt::Debug for TunnelAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelAuth::KeyFile(path) => f.debug_tuple("KeyFile").field(path).finish(),
            TunnelAuth::Password(_) => f.write_str("Password(<redacted>)"),
            TunnelAuth::Agent => f.write_str("Agent"),
        }
    }
}

/// Jumphost hop in front of a controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    pub jumphost: String,
    pub jumphost_port: u16,
    /// None lets ssh pick the local user
    pub jumphost_user: Option<String>,
    pub auth: TunnelAuth,
}

impl TunnelSpec {
    pub fn new(jumphost: impl Into<String>, jumphost_user: Option<String>, auth: TunnelAuth) -> Self {
        Self {
            jumphost: jumphost.into(),
            jumphost_port: DEFAULT_JUMPHOST_PORT,
            jumphost_user,
            auth,
        }
    }

    /// `user@host` destination as understood by ssh
    pub fn destination(&self) -> String {
        match &self.jumphost_user {
            Some(user) => format!("{}@{}", user, self.jumphost),
            None => self.jumphost.clone(),
        }
    }
}

/// One monitored management controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub credentials: Credentials,
    pub tunnel: Option<TunnelSpec>,
}

impl TargetConfig {
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        credentials: Credentials,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            credentials,
            tunnel: None,
        }
    }

    pub fn with_tunnel(mut self, tunnel: TunnelSpec) -> Self {
        self.tunnel = Some(tunnel);
        self
    }

    /// Endpoint used when no tunnel is involved
    pub fn direct_endpoint(&self) -> Endpoint {
        Endpoint {
            host: self.host.clone(),
            port: self.port,
            host_header: None,
        }
    }
}

/// Where the telemetry client actually connects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    /// Real controller host, sent as `Host` header when connecting through a forward
    pub host_header: Option<String>,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Single reading or a sampled window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorMode {
    Instant,
    Windowed {
        duration: Duration,
        interval: Duration,
    },
}

impl MonitorMode {
    /// Number of collections the run is expected to make.
    ///
    /// Windowed runs take `ceil(duration / interval)` samples.
    pub fn expected_samples(&self) -> u32 {
        match self {
            MonitorMode::Instant => 1,
            MonitorMode::Windowed { duration, interval } => {
                let interval = interval.as_nanos().max(1);
                let count = duration.as_nanos().div_ceil(interval);
                count.clamp(1, u32::MAX as u128) as u32
            }
        }
    }

    pub fn is_windowed(&self) -> bool {
        matches!(self, MonitorMode::Windowed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_priority() {
        let key = Some(PathBuf::from("/home/ops/.ssh/id_ed25519"));
        assert_eq!(
            TunnelAuth::select(key.clone(), Some("secret".into())),
            TunnelAuth::KeyFile(PathBuf::from("/home/ops/.ssh/id_ed25519"))
        );
        assert_eq!(
            TunnelAuth::select(None, Some("secret".into())),
            TunnelAuth::Password("secret".into())
        );
        assert_eq!(TunnelAuth::select(None, None), TunnelAuth::Agent);
    }

    #[test]
    fn test_expected_samples() {
        let five_minutes = MonitorMode::Windowed {
            duration: Duration::from_secs(300),
            interval: Duration::from_secs(60),
        };
        assert_eq!(five_minutes.expected_samples(), 5);

        let uneven = MonitorMode::Windowed {
            duration: Duration::from_secs(310),
            interval: Duration::from_secs(60),
        };
        assert_eq!(uneven.expected_samples(), 6);

        let short = MonitorMode::Windowed {
            duration: Duration::from_secs(10),
            interval: Duration::from_secs(60),
        };
        assert_eq!(short.expected_samples(), 1);
        assert_eq!(MonitorMode::Instant.expected_samples(), 1);
    }

    #[test]
    fn test_secrets_not_in_debug() {
        let creds = Credentials::new("root", "calvin");
        let auth = TunnelAuth::Password("hunter2".into());
        assert!(!format!("{:?}", creds).contains("calvin"));
        assert!(!format!("{:?}", auth).contains("hunter2"));
    }

    #[test]
    fn test_destination() {
        let spec = TunnelSpec::new("bastion.example.com", Some("ops".into()), TunnelAuth::Agent);
        assert_eq!(spec.destination(), "ops@bastion.example.com");
        let anonymous = TunnelSpec::new("bastion.example.com", None, TunnelAuth::Agent);
        assert_eq!(anonymous.destination(), "bastion.example.com");
    }
}
