//! Connectivity monitor
//!
//! Periodically checks the configured target and exposes a debounced
//! online/offline flag. One success is enough to go ONLINE; three consecutive
//! failures are needed to go OFFLINE, so a single dropped check never flaps
//! the state.
//!
//! Check order (first success wins):
//! 1. HTTP GET against each configured health path
//! 2. raw TCP connect to the target host/port
//!
//! Change callbacks run on the monitor task and must return quickly; heavy
//! follow-up work (like an immediate content sync) belongs on its own task.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::Utc;
use kiosk_common::config::ConnectivityConfig;
use kiosk_common::events::AgentEvent;
use kiosk_common::models::ConnectivityState;
use reqwest::Url;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{AgentError, Result};
use crate::state::SharedState;

/// Successes needed to declare ONLINE
pub const ONLINE_THRESHOLD: u32 = 1;
/// Consecutive failures needed to declare OFFLINE
pub const OFFLINE_THRESHOLD: u32 = 3;

/// Callback invoked with the new online flag on every transition
pub type ConnectivityCallback = Box<dyn Fn(bool) + Send + Sync>;

/// Asymmetric success/failure counter
#[derive(Debug, Clone)]
pub struct Hysteresis {
    online_threshold: u32,
    offline_threshold: u32,
    state: ConnectivityState,
}

impl Hysteresis {
    pub fn new(initially_online: bool) -> Self {
        Self {
            online_threshold: ONLINE_THRESHOLD,
            offline_threshold: OFFLINE_THRESHOLD,
            state: ConnectivityState {
                online: initially_online,
                ..Default::default()
            },
        }
    }

    pub fn state(&self) -> &ConnectivityState {
        &self.state
    }

    /// Record one check result; returns the new flag if it flipped
    pub fn record(&mut self, success: bool) -> Option<bool> {
        self.state.last_check_time = Some(Utc::now());
        if success {
            self.state.consecutive_successes = self.state.consecutive_successes.saturating_add(1);
            self.state.consecutive_failures = 0;
            if !self.state.online && self.state.consecutive_successes >= self.online_threshold {
                self.state.online = true;
                return Some(true);
            }
        } else {
            self.state.consecutive_failures = self.state.consecutive_failures.saturating_add(1);
            self.state.consecutive_successes = 0;
            if self.state.online && self.state.consecutive_failures >= self.offline_threshold {
                self.state.online = false;
                return Some(false);
            }
        }
        None
    }
}

/// Background connectivity monitor
pub struct ConnectivityMonitor {
    target: Url,
    health_paths: Vec<String>,
    check_timeout: Duration,
    online_interval: Duration,
    offline_interval: Duration,
    http: reqwest::Client,
    hysteresis: Mutex<Hysteresis>,
    callbacks: RwLock<Vec<ConnectivityCallback>>,
    state: Option<Arc<SharedState>>,
}

impl ConnectivityMonitor {
    /// Create a monitor for `target`; starts OFFLINE until the first success
    pub fn new(target: &str, config: &ConnectivityConfig) -> Result<Self> {
        let target = Url::parse(target)
            .map_err(|e| AgentError::Config(format!("invalid connectivity target: {}", e)))?;
        let check_timeout = Duration::from_secs(config.check_timeout_secs.max(1));
        let http = reqwest::Client::builder()
            .timeout(check_timeout)
            .connect_timeout(check_timeout)
            .build()
            .map_err(|e| AgentError::Config(e.to_string()))?;

        Ok(Self {
            target,
            health_paths: config.health_paths.clone(),
            check_timeout,
            online_interval: Duration::from_secs(config.online_interval_secs.max(1)),
            offline_interval: Duration::from_secs(config.offline_interval_secs.max(1)),
            http,
            hysteresis: Mutex::new(Hysteresis::new(false)),
            callbacks: RwLock::new(Vec::new()),
            state: None,
        })
    }

    /// Also publish transitions on the agent event channel
    pub fn with_events(mut self, state: Arc<SharedState>) -> Self {
        self.state = Some(state);
        self
    }

    pub fn on_change(&self, callback: ConnectivityCallback) {
        self.callbacks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(callback);
    }

    pub fn is_online(&self) -> bool {
        self.lock().state().online
    }

    pub fn snapshot(&self) -> ConnectivityState {
        self.lock().state().clone()
    }

    /// Shorter while offline for faster recovery detection
    pub fn current_interval(&self) -> Duration {
        if self.is_online() {
            self.online_interval
        } else {
            self.offline_interval
        }
    }

    /// Feed one check result through the hysteresis
    ///
    /// Callbacks fire only on a transition, after the lock is released. A
    /// panicking callback is logged and the remaining ones still run.
    pub fn record_result(&self, success: bool) -> Option<bool> {
        let transition = self.lock().record(success);
        if let Some(online) = transition {
            info!(online, "Connectivity changed");
            let callbacks = self
                .callbacks
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            for callback in callbacks.iter() {
                if catch_unwind(AssertUnwindSafe(|| callback(online))).is_err() {
                    error!(online, "Connectivity callback panicked");
                }
            }
            if let Some(state) = &self.state {
                state.broadcast_event(AgentEvent::ConnectivityChanged {
                    online,
                    timestamp: Utc::now(),
                });
            }
        }
        transition
    }

    /// Check once and record the result; returns the debounced flag
    pub async fn check_now(&self) -> bool {
        let success = self.check_reachable().await;
        self.record_result(success);
        self.is_online()
    }

    /// Single check: HTTP health paths, then TCP connect
    pub async fn check_reachable(&self) -> bool {
        for path in &self.health_paths {
            let Ok(url) = self.target.join(path) else {
                continue;
            };
            match self.http.get(url.clone()).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(url = %url, "HTTP check succeeded");
                    return true;
                }
                Ok(response) => {
                    debug!(url = %url, status = response.status().as_u16(), "HTTP check rejected");
                }
                Err(e) if e.is_connect() || e.is_timeout() => {
                    // Host unreachable; other paths will fail the same way
                    debug!(url = %url, error = %e, "HTTP check failed");
                    break;
                }
                Err(e) => {
                    debug!(url = %url, error = %e, "HTTP check error");
                }
            }
        }

        self.check_tcp().await
    }

    async fn check_tcp(&self) -> bool {
        let (Some(host), Some(port)) = (self.target.host_str(), self.target.port_or_known_default())
        else {
            return false;
        };
        match tokio::time::timeout(self.check_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_)) => {
                debug!(host, port, "TCP check succeeded");
                true
            }
            Ok(Err(e)) => {
                debug!(host, port, error = %e, "TCP check failed");
                false
            }
            Err(_) => {
                debug!(host, port, "TCP check timed out");
                false
            }
        }
    }

    /// Check loop; returns promptly once `cancel` fires
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(target = %self.target, "Connectivity monitor started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                online = self.check_now() => {
                    if !online {
                        let failures = self.snapshot().consecutive_failures;
                        if failures > 0 {
                            warn!(failures, "Authority unreachable");
                        }
                    }
                }
            }

            let interval = self.current_interval();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("Connectivity monitor stopped");
    }

    fn lock(&self) -> MutexGuard<'_, Hysteresis> {
        self.hysteresis
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn config(timeout_secs: u64) -> ConnectivityConfig {
        ConnectivityConfig {
            check_timeout_secs: timeout_secs,
            ..Default::default()
        }
    }

    #[test]
    fn test_single_success_goes_online() {
        let mut h = Hysteresis::new(false);
        assert_eq!(h.record(true), Some(true));
        assert!(h.state().online);
    }

    #[test]
    fn test_three_failures_go_offline() {
        let mut h = Hysteresis::new(true);
        assert_eq!(h.record(false), None);
        assert_eq!(h.record(false), None);
        assert_eq!(h.record(false), Some(false));
        assert!(!h.state().online);
        assert_eq!(h.state().consecutive_failures, 3);
    }

    #[test]
    fn test_two_failures_then_success_stays_online() {
        let mut h = Hysteresis::new(true);
        for success in [false, false, true] {
            assert_eq!(h.record(success), None);
            assert!(h.state().online);
        }
        assert_eq!(h.state().consecutive_failures, 0);
        // Counter was reset: two more failures still do not flip
        assert_eq!(h.record(false), None);
        assert_eq!(h.record(false), None);
        assert!(h.state().online);
    }

    #[test]
    fn test_failures_while_offline_do_not_transition() {
        let mut h = Hysteresis::new(false);
        for _ in 0..5 {
            assert_eq!(h.record(false), None);
        }
        assert!(h.state().last_check_time.is_some());
    }

    #[test]
    fn test_callbacks_fire_only_on_transition() {
        let monitor = ConnectivityMonitor::new("http://127.0.0.1:9", &config(1)).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        monitor.on_change(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        monitor.record_result(true);
        monitor.record_result(true);
        monitor.record_result(false);
        monitor.record_result(false);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        monitor.record_result(false);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!monitor.is_online());
    }

    #[test]
    fn test_panicking_callback_does_not_stop_others() {
        let monitor = ConnectivityMonitor::new("http://127.0.0.1:9", &config(1)).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        monitor.on_change(Box::new(|_| panic!("callback bug")));
        let counter = calls.clone();
        monitor.on_change(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(monitor.record_result(true), Some(true));
        for _ in 0..OFFLINE_THRESHOLD {
            monitor.record_result(false);
        }
        assert!(!monitor.is_online());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_interval_depends_on_state() {
        let cfg = ConnectivityConfig {
            online_interval_secs: 30,
            offline_interval_secs: 10,
            ..Default::default()
        };
        let monitor = ConnectivityMonitor::new("http://127.0.0.1:9", &cfg).unwrap();
        assert_eq!(monitor.current_interval(), Duration::from_secs(10));
        monitor.record_result(true);
        assert_eq!(monitor.current_interval(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_check_falls_back_to_tcp() {
        // Accepts connections but never answers HTTP
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let monitor =
            ConnectivityMonitor::new(&format!("http://{}", addr), &config(1)).unwrap();
        assert!(monitor.check_reachable().await);
    }

    #[tokio::test]
    async fn test_check_fails_for_closed_port() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let monitor =
            ConnectivityMonitor::new(&format!("http://{}", addr), &config(1)).unwrap();
        assert!(!monitor.check_reachable().await);
        assert!(!monitor.check_now().await);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let monitor = Arc::new(
            ConnectivityMonitor::new("http://127.0.0.1:9", &config(1)).unwrap(),
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(monitor.run(cancel.clone()));
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .expect("monitor should stop promptly")
            .unwrap();
    }
}
