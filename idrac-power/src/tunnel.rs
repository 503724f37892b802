//! Tunnel manager: optional SSH local-forward in front of each controller
//!
//! Targets without a jumphost get a direct handle and never touch the
//! transport. Tunneled handles own their forward and close it on `release`
//! or when dropped, so every exit path of a pipeline tears the tunnel down.

use crate::error::TunnelError;
use crate::model::{Endpoint, TargetConfig, TunnelAuth, TunnelSpec};
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, ChildStderr, Command};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

const READY_POLL: Duration = Duration::from_millis(200);
const KEEPALIVE_SECS: u64 = 30;

/// An established forward
pub trait Forward: Send + 'static {
    fn local_addr(&self) -> SocketAddr;

    /// False once the forward has died or been closed
    fn is_alive(&mut self) -> bool;

    /// Synchronous and idempotent
    fn close(&mut self);
}

/// Opens forwards through a jumphost
pub trait TunnelTransport: Send + Sync + 'static {
    type Forward: Forward;

    fn open(
        &self,
        target: &TargetConfig,
        spec: &TunnelSpec,
    ) -> impl Future<Output = Result<Self::Forward, TunnelError>> + Send;
}

/// Forward type of handles that never tunnel
#[derive(Debug)]
pub enum DirectForward {}

impl Forward for DirectForward {
    fn local_addr(&self) -> SocketAddr {
        match *self {}
    }

    fn is_alive(&mut self) -> bool {
        match *self {}
    }

    fn close(&mut self) {
        match *self {}
    }
}

/// Per-target view of the (possibly tunneled) controller endpoint
pub struct TunnelHandle<F: Forward> {
    target: String,
    endpoint: Endpoint,
    jumphost: Option<String>,
    forward: Option<F>,
    released: bool,
}

impl<F: Forward> TunnelHandle<F> {
    /// Handle pointing straight at `host:port`
    pub fn direct(target: &TargetConfig) -> Self {
        Self {
            target: target.name.clone(),
            endpoint: target.direct_endpoint(),
            jumphost: None,
            forward: None,
            released: false,
        }
    }

    /// Handle routed through `forward`; requests keep the controller's host name
    pub fn tunneled(target: &TargetConfig, jumphost: impl Into<String>, forward: F) -> Self {
        let local = forward.local_addr();
        Self {
            target: target.name.clone(),
            endpoint: Endpoint {
                host: local.ip().to_string(),
                port: local.port(),
                host_header: Some(target.host.clone()),
            },
            jumphost: Some(jumphost.into()),
            forward: Some(forward),
            released: false,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn jumphost(&self) -> Option<&str> {
        self.jumphost.as_deref()
    }

    pub fn is_tunneled(&self) -> bool {
        self.jumphost.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.forward.as_ref().map(Forward::local_addr)
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Direct handles are alive until released
    pub fn is_alive(&mut self) -> bool {
        if self.released {
            return false;
        }
        match self.forward.as_mut() {
            Some(forward) => forward.is_alive(),
            None => true,
        }
    }

    /// Close the forward; later calls do nothing
    pub fn release(&mut self) {
        if let Some(mut forward) = self.forward.take() {
            forward.close();
            debug!("[{}] tunnel via {:?} closed", self.target, self.jumphost);
        }
        self.released = true;
    }
}

impl<F: Forward> Drop for TunnelHandle<F> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Acquires and releases per-target tunnels
pub struct TunnelManager<T> {
    transport: T,
}

impl<T: TunnelTransport> TunnelManager<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Direct handle without a jumphost; otherwise one forward, not retried
    pub async fn acquire(
        &self,
        target: &TargetConfig,
    ) -> Result<TunnelHandle<T::Forward>, TunnelError> {
        let Some(spec) = &target.tunnel else {
            return Ok(TunnelHandle::direct(target));
        };

        info!(
            "[{}] opening tunnel via {} ({} auth)",
            target.name,
            spec.destination(),
            spec.auth.method()
        );
        let forward = self.transport.open(target, spec).await?;
        Ok(TunnelHandle::tunneled(target, spec.jumphost.clone(), forward))
    }

    pub fn release(&self, handle: &mut TunnelHandle<T::Forward>) {
        handle.release();
    }
}

/// Tunnels through the system `ssh` client
#[derive(Debug, Clone)]
pub struct SshTransport {
    program: String,
    connect_timeout: Duration,
}

/// Fully resolved ssh invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Passed to `sshpass -e` through `SSHPASS`
    pub password: Option<String>,
}

impl SshTransport {
    pub fn new(program: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            program: program.into(),
            connect_timeout,
        }
    }

    pub fn command(&self, target: &TargetConfig, spec: &TunnelSpec, local_port: u16) -> SshCommand {
        let mut args: Vec<String> = vec![
            "-N".into(),
            "-L".into(),
            format!("127.0.0.1:{}:{}:{}", local_port, target.host, target.port),
            "-p".into(),
            spec.jumphost_port.to_string(),
        ];
        for option in [
            "ExitOnForwardFailure=yes".to_string(),
            format!("ServerAliveInterval={}", KEEPALIVE_SECS),
            "ServerAliveCountMax=3".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "StrictHostKeyChecking=accept-new".to_string(),
        ] {
            args.push("-o".into());
            args.push(option);
        }

        let password = match &spec.auth {
            TunnelAuth::KeyFile(key) => {
                args.push("-i".into());
                args.push(key.display().to_string());
                args.extend(["-o", "IdentitiesOnly=yes", "-o", "BatchMode=yes"].map(String::from));
                None
            }
            TunnelAuth::Password(password) => {
                args.extend(
                    [
                        "-o",
                        "PubkeyAuthentication=no",
                        "-o",
                        "PreferredAuthentications=password,keyboard-interactive",
                        "-o",
                        "NumberOfPasswordPrompts=1",
                    ]
                    .map(String::from),
                );
                Some(password.clone())
            }
            TunnelAuth::Agent => {
                args.extend(["-o", "BatchMode=yes"].map(String::from));
                None
            }
        };
        args.push(spec.destination());

        match password {
            Some(password) => {
                let mut wrapped = vec!["-e".to_string(), self.program.clone()];
                wrapped.extend(args);
                SshCommand {
                    program: "sshpass".into(),
                    args: wrapped,
                    password: Some(password),
                }
            }
            None => SshCommand {
                program: self.program.clone(),
                args,
                password: None,
            },
        }
    }
}

impl TunnelTransport for SshTransport {
    type Forward = SshForward;

    async fn open(&self, target: &TargetConfig, spec: &TunnelSpec) -> Result<SshForward, TunnelError> {
        let local_port = free_local_port().await.map_err(TunnelError::LocalPort)?;
        let ssh = self.command(target, spec, local_port);

        let mut command = Command::new(&ssh.program);
        command
            .args(&ssh.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(password) = &ssh.password {
            command.env("SSHPASS", password);
        }

        let mut child = command.spawn().map_err(|source| TunnelError::Spawn {
            jumphost: spec.jumphost.clone(),
            source,
        })?;

        let local = SocketAddr::from((Ipv4Addr::LOCALHOST, local_port));
        let deadline = Instant::now() + self.connect_timeout;

        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    let mut stderr = String::new();
                    if let Some(mut pipe) = child.stderr.take() {
                        let _ = pipe.read_to_string(&mut stderr).await;
                    }
                    let detail = if stderr.trim().is_empty() {
                        format!("ssh exited with {}", status)
                    } else {
                        stderr.trim().to_string()
                    };
                    return Err(classify_ssh_failure(&spec.jumphost, detail));
                }
                Ok(None) => {}
                Err(e) => {
                    return Err(TunnelError::Forward {
                        jumphost: spec.jumphost.clone(),
                        detail: e.to_string(),
                    })
                }
            }

            if TcpStream::connect(local).await.is_ok() {
                debug!("[{}] forward ready on {}", target.name, local);
                if let Some(stderr) = child.stderr.take() {
                    drain_stderr(target.name.clone(), stderr);
                }
                return Ok(SshForward {
                    child,
                    local,
                    closed: false,
                });
            }

            if Instant::now() >= deadline {
                let _ = child.start_kill();
                return Err(TunnelError::Forward {
                    jumphost: spec.jumphost.clone(),
                    detail: format!(
                        "local port {} not ready after {}s",
                        local_port,
                        self.connect_timeout.as_secs()
                    ),
                });
            }

            sleep(READY_POLL).await;
        }
    }
}

/// Running `ssh -N -L` child
#[derive(Debug)]
pub struct SshForward {
    child: Child,
    local: SocketAddr,
    closed: bool,
}

impl Forward for SshForward {
    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn is_alive(&mut self) -> bool {
        !self.closed && matches!(self.child.try_wait(), Ok(None))
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.child.start_kill() {
            // Already exited
            debug!("ssh forward on {} not killed: {}", self.local, e);
        }
    }
}

/// Log ssh's stderr until it closes.
///
/// ssh stops forwarding once it blocks on a full stderr pipe, and it writes a
/// line for every forwarded connection the controller refuses.
fn drain_stderr(target: String, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end();
                    if line.contains("open failed") {
                        debug!(target_name = %target, "ssh: {}", line);
                    } else if !line.is_empty() {
                        warn!(target_name = %target, "ssh: {}", line);
                    }
                }
                Err(e) => {
                    debug!(target_name = %target, "ssh stderr closed: {}", e);
                    break;
                }
            }
        }
    });
}

/// Bind port 0 and hand the port to ssh
async fn free_local_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    Ok(listener.local_addr()?.port())
}

fn classify_ssh_failure(jumphost: &str, detail: String) -> TunnelError {
    let lowered = detail.to_lowercase();
    if lowered.contains("permission denied")
        || lowered.contains("authentication")
        || lowered.contains("incorrect password")
    {
        warn!("ssh authentication to {} rejected", jumphost);
        TunnelError::Auth {
            jumphost: jumphost.to_string(),
            detail,
        }
    } else {
        TunnelError::Forward {
            jumphost: jumphost.to_string(),
            detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Credentials;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Counters {
        opened: AtomicU32,
        closed: AtomicU32,
    }

    struct FakeForward {
        local: SocketAddr,
        counters: Arc<Counters>,
        alive: bool,
    }

    impl Forward for FakeForward {
        fn local_addr(&self) -> SocketAddr {
            self.local
        }

        fn is_alive(&mut self) -> bool {
            self.alive
        }

        fn close(&mut self) {
            if self.alive {
                self.alive = false;
                self.counters.closed.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[derive(Default)]
    struct FakeTransport {
        counters: Arc<Counters>,
        reject: bool,
    }

    impl TunnelTransport for FakeTransport {
        type Forward = FakeForward;

        async fn open(&self, _target: &TargetConfig, spec: &TunnelSpec) -> Result<FakeForward, TunnelError> {
            if self.reject {
                return Err(TunnelError::Auth {
                    jumphost: spec.jumphost.clone(),
                    detail: "Permission denied (publickey)".into(),
                });
            }
            self.counters.opened.fetch_add(1, Ordering::SeqCst);
            Ok(FakeForward {
                local: SocketAddr::from((Ipv4Addr::LOCALHOST, 40022)),
                counters: self.counters.clone(),
                alive: true,
            })
        }
    }

    fn target() -> TargetConfig {
        TargetConfig::new("r740-01", "10.1.2.3", 443, Credentials::new("root", "calvin"))
    }

    fn tunneled(auth: TunnelAuth) -> TargetConfig {
        target().with_tunnel(TunnelSpec::new("bastion.example.com", Some("ops".into()), auth))
    }

    #[tokio::test]
    async fn test_direct_handle_skips_transport() {
        let manager = TunnelManager::new(FakeTransport::default());

        let mut handle = manager.acquire(&target()).await.unwrap();

        assert!(!handle.is_tunneled());
        assert_eq!(handle.endpoint(), &target().direct_endpoint());
        assert!(handle.is_alive());
        assert_eq!(manager.transport().counters.opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_tunneled_handle_points_at_forward() {
        let manager = TunnelManager::new(FakeTransport::default());

        let handle = manager.acquire(&tunneled(TunnelAuth::Agent)).await.unwrap();

        assert!(handle.is_tunneled());
        assert_eq!(handle.jumphost(), Some("bastion.example.com"));
        assert_eq!(handle.endpoint().host, "127.0.0.1");
        assert_eq!(handle.endpoint().port, 40022);
        assert_eq!(handle.endpoint().host_header.as_deref(), Some("10.1.2.3"));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let manager = TunnelManager::new(FakeTransport::default());
        let mut handle = manager.acquire(&tunneled(TunnelAuth::Agent)).await.unwrap();

        manager.release(&mut handle);
        manager.release(&mut handle);
        drop(handle);

        assert_eq!(manager.transport().counters.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drop_releases() {
        let manager = TunnelManager::new(FakeTransport::default());
        {
            let mut handle = manager.acquire(&tunneled(TunnelAuth::Agent)).await.unwrap();
            assert!(handle.is_alive());
        }
        assert_eq!(manager.transport().counters.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_acquire_failure_is_reported() {
        let manager = TunnelManager::new(FakeTransport {
            reject: true,
            ..Default::default()
        });

        let err = manager.acquire(&tunneled(TunnelAuth::Agent)).await.err().unwrap();

        assert!(matches!(err, TunnelError::Auth { .. }));
        assert_eq!(manager.transport().counters.opened.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_ssh_command_with_key() {
        let transport = SshTransport::new("ssh", Duration::from_secs(15));
        let target = tunneled(TunnelAuth::KeyFile(PathBuf::from("/keys/id_ed25519")));
        let spec = target.tunnel.clone().unwrap();

        let cmd = transport.command(&target, &spec, 40100);

        assert_eq!(cmd.program, "ssh");
        assert!(cmd.password.is_none());
        assert_eq!(cmd.args[0], "-N");
        assert!(cmd.args.contains(&"127.0.0.1:40100:10.1.2.3:443".to_string()));
        assert!(cmd.args.contains(&"/keys/id_ed25519".to_string()));
        assert!(cmd.args.contains(&"IdentitiesOnly=yes".to_string()));
        assert!(cmd.args.contains(&"ConnectTimeout=15".to_string()));
        assert_eq!(cmd.args.last().unwrap(), "ops@bastion.example.com");
    }

    #[test]
    fn test_ssh_command_with_password() {
        let transport = SshTransport::new("ssh", Duration::from_secs(15));
        let target = tunneled(TunnelAuth::Password("hunter2".into()));
        let spec = target.tunnel.clone().unwrap();

        let cmd = transport.command(&target, &spec, 40100);

        assert_eq!(cmd.program, "sshpass");
        assert_eq!(&cmd.args[..2], &["-e".to_string(), "ssh".to_string()]);
        assert_eq!(cmd.password.as_deref(), Some("hunter2"));
        assert!(!cmd.args.iter().any(|a| a.contains("hunter2")));
        assert!(cmd.args.contains(&"PubkeyAuthentication=no".to_string()));
    }

    #[test]
    fn test_ssh_command_with_agent() {
        let transport = SshTransport::new("/usr/bin/ssh", Duration::from_secs(15));
        let mut target = tunneled(TunnelAuth::Agent);
        if let Some(spec) = target.tunnel.as_mut() {
            spec.jumphost_user = None;
            spec.jumphost_port = 2222;
        }
        let spec = target.tunnel.clone().unwrap();

        let cmd = transport.command(&target, &spec, 40100);

        assert_eq!(cmd.program, "/usr/bin/ssh");
        assert!(cmd.args.contains(&"BatchMode=yes".to_string()));
        assert!(cmd.args.contains(&"2222".to_string()));
        assert!(!cmd.args.contains(&"-i".to_string()));
        assert_eq!(cmd.args.last().unwrap(), "bastion.example.com");
    }

    #[test]
    fn test_classify_ssh_failure() {
        let auth = classify_ssh_failure("bastion", "ops@bastion: Permission denied (publickey).".into());
        assert!(matches!(auth, TunnelError::Auth { .. }));

        let forward = classify_ssh_failure("bastion", "ssh: Could not resolve hostname bastion".into());
        assert!(matches!(forward, TunnelError::Forward { .. }));
    }

    #[tokio::test]
    async fn test_missing_ssh_binary() {
        let transport = SshTransport::new("/nonexistent/idrac-power-ssh", Duration::from_secs(1));
        let target = tunneled(TunnelAuth::Agent);
        let spec = target.tunnel.clone().unwrap();

        let err = transport.open(&target, &spec).await.err().unwrap();

        assert!(matches!(err, TunnelError::Spawn { .. }));
    }

    #[cfg(unix)]
    fn stub_program(dir: &std::path::Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("ssh");
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    fn has_python3() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// Stand-in for `ssh -N -L`: listens on the forwarded port, writes
    /// `lines` stderr lines, touches `marker`, then serves until killed
    /// (or exits after `exit_after` seconds).
    #[cfg(unix)]
    fn python_forward(marker: &std::path::Path, lines: u32, exit_after: Option<f64>) -> String {
        let tail = match exit_after {
            Some(secs) => format!("time.sleep({})\n", secs),
            None => "while True:\n    conn, _ = server.accept()\n    conn.close()\n".to_string(),
        };
        format!(
            "#!/usr/bin/env python3\n\
             import socket, sys, time\n\
             spec = sys.argv[sys.argv.index('-L') + 1]\n\
             port = int(spec.split(':')[1])\n\
             server = socket.socket()\n\
             server.setsockopt(socket.SOL_SOCKET, socket.SO_REUSEADDR, 1)\n\
             server.bind(('127.0.0.1', port))\n\
             server.listen(16)\n\
             line = b'channel 3: open failed: connect failed: Connection refused\\n'\n\
             for _ in range({}):\n    sys.stderr.buffer.write(line)\n\
             sys.stderr.buffer.flush()\n\
             open({:?}, 'w').close()\n\
             {}",
            lines,
            marker.display().to_string(),
            tail
        )
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ssh_forward_keeps_running_under_stderr_flood() {
        if !has_python3() {
            eprintln!("python3 not available, skipping");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("stderr-written");
        // ~230 KB, several times a pipe buffer
        let program = stub_program(dir.path(), &python_forward(&marker, 4_000, None));
        let transport = SshTransport::new(program.display().to_string(), Duration::from_secs(10));
        let target = tunneled(TunnelAuth::Agent);
        let spec = target.tunnel.clone().unwrap();

        let mut forward = transport.open(&target, &spec).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while !marker.exists() && Instant::now() < deadline {
            sleep(Duration::from_millis(100)).await;
        }
        assert!(marker.exists(), "ssh stuck writing stderr");
        assert!(forward.is_alive());

        forward.close();
        forward.close();
        assert!(!forward.is_alive());
        let status = tokio::time::timeout(Duration::from_secs(5), forward.child.wait())
            .await
            .expect("ssh still running after close")
            .unwrap();
        assert!(!status.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ssh_forward_dead_after_exit() {
        if !has_python3() {
            eprintln!("python3 not available, skipping");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("started");
        let program = stub_program(dir.path(), &python_forward(&marker, 1, Some(1.0)));
        let transport = SshTransport::new(program.display().to_string(), Duration::from_secs(10));
        let target = tunneled(TunnelAuth::Agent);
        let spec = target.tunnel.clone().unwrap();

        let mut forward = transport.open(&target, &spec).await.unwrap();
        assert!(forward.is_alive());

        sleep(Duration::from_secs(3)).await;
        assert!(!forward.is_alive());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ssh_rejected_login_through_open() {
        let dir = tempfile::tempdir().unwrap();
        let program = stub_program(
            dir.path(),
            "#!/bin/sh\necho 'ops@bastion.example.com: Permission denied (publickey).' >&2\nexit 255\n",
        );
        let transport = SshTransport::new(program.display().to_string(), Duration::from_secs(10));
        let target = tunneled(TunnelAuth::Agent);
        let spec = target.tunnel.clone().unwrap();

        let err = transport.open(&target, &spec).await.err().unwrap();

        match err {
            TunnelError::Auth { jumphost, detail } => {
                assert_eq!(jumphost, "bastion.example.com");
                assert!(detail.contains("Permission denied"));
            }
            other => panic!("expected auth failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_free_local_port() {
        assert_ne!(free_local_port().await.unwrap(), 0);
    }
}
