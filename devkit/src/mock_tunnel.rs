/*!
Mock tunnel transport for development without jumphosts

Hands out fake local forwards, can reject chosen jumphosts, and counts
opens and closes so tests can check every tunnel was released.
*/

use idrac_power::tunnel::{Forward, TunnelTransport};
use idrac_power::{TargetConfig, TunnelError, TunnelSpec};
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct TransportState {
    reject_auth: HashSet<String>,
    fail_forward: HashSet<String>,
    attempts: Vec<String>,
    forwards: Vec<Arc<AtomicBool>>,
    next_port: u16,
}

/// Mock transport standing in for `SshTransport`
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<TransportState>>,
    opened: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Logins to `jumphost` fail with an authentication error
    pub fn reject_auth(&self, jumphost: &str) -> &Self {
        self.state.lock().unwrap().reject_auth.insert(jumphost.to_string());
        self
    }

    /// Logins succeed but the forward cannot be set up
    pub fn fail_forward(&self, jumphost: &str) -> &Self {
        self.state.lock().unwrap().fail_forward.insert(jumphost.to_string());
        self
    }

    /// Simulate every open ssh process dying
    pub fn kill_all(&self) {
        for alive in &self.state.lock().unwrap().forwards {
            alive.store(false, Ordering::SeqCst);
        }
        log::info!("💥 [MOCK] all tunnels killed");
    }

    /// Target names that asked for a tunnel, in request order
    pub fn attempts(&self) -> Vec<String> {
        self.state.lock().unwrap().attempts.clone()
    }

    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Forwards opened and not yet closed
    pub fn open_now(&self) -> usize {
        self.open_count().saturating_sub(self.close_count())
    }
}

impl TunnelTransport for MockTransport {
    type Forward = MockForward;

    async fn open(&self, target: &TargetConfig, spec: &TunnelSpec) -> Result<MockForward, TunnelError> {
        let mut state = self.state.lock().unwrap();
        state.attempts.push(target.name.clone());

        if state.reject_auth.contains(&spec.jumphost) {
            log::info!("🚫 [MOCK] {} rejected login for {}", spec.jumphost, target.name);
            return Err(TunnelError::Auth {
                jumphost: spec.jumphost.clone(),
                detail: format!("{}: Permission denied (publickey,password).", spec.destination()),
            });
        }
        if state.fail_forward.contains(&spec.jumphost) {
            log::info!("⛔ [MOCK] forward through {} refused for {}", spec.jumphost, target.name);
            return Err(TunnelError::Forward {
                jumphost: spec.jumphost.clone(),
                detail: format!("channel 2: open failed: connect failed: {}:{}", target.host, target.port),
            });
        }

        state.next_port += 1;
        let alive = Arc::new(AtomicBool::new(true));
        state.forwards.push(alive.clone());
        self.opened.fetch_add(1, Ordering::SeqCst);

        let local = SocketAddr::from((Ipv4Addr::LOCALHOST, 40_000 + state.next_port));
        log::info!("🔌 [MOCK] tunnel {} -> {} for {}", local, spec.jumphost, target.name);
        Ok(MockForward {
            local,
            alive,
            closed: false,
            close_counter: self.closed.clone(),
        })
    }
}

/// Fake forward; dies when `MockTransport::kill_all` is called
pub struct MockForward {
    local: SocketAddr,
    alive: Arc<AtomicBool>,
    closed: bool,
    close_counter: Arc<AtomicUsize>,
}

impl Forward for MockForward {
    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn is_alive(&mut self) -> bool {
        !self.closed && self.alive.load(Ordering::SeqCst)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.alive.store(false, Ordering::SeqCst);
            self.close_counter.fetch_add(1, Ordering::SeqCst);
        }
    }
}
