//! Network connectivity detection

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Reports whether the remote collector is reachable
pub trait Connectivity: Send + Sync {
    fn is_connected(&self) -> bool;
}

/// Connectivity probe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    /// `host:port` targets probed with a TCP connect
    pub hosts: Vec<String>,
    pub probe_timeout_ms: u64,
    pub check_interval_seconds: u64,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            hosts: vec![
                "8.8.8.8:53".to_string(),
                "1.1.1.1:53".to_string(),
                "208.67.222.222:53".to_string(),
            ],
            probe_timeout_ms: 2000,
            check_interval_seconds: 5,
        }
    }
}

/// Periodically probes well-known hosts
pub struct ConnectivityMonitor {
    config: ConnectivityConfig,
    connected: AtomicBool,
}

impl ConnectivityMonitor {
    pub fn new(config: ConnectivityConfig) -> Self {
        Self {
            config,
            connected: AtomicBool::new(false),
        }
    }

    /// Try each host in turn; the first successful connect wins
    pub async fn probe(&self) -> bool {
        let limit = Duration::from_millis(self.config.probe_timeout_ms);
        for host in &self.config.hosts {
            match timeout(limit, TcpStream::connect(host.as_str())).await {
                Ok(Ok(_)) => return true,
                Ok(Err(e)) => debug!(host = %host, error = %e, "Connectivity probe failed"),
                Err(_) => debug!(host = %host, "Connectivity probe timed out"),
            }
        }
        false
    }

    /// Probe once and record the result, logging transitions
    pub async fn check(&self) -> bool {
        let up = self.probe().await;
        let was_up = self.connected.swap(up, Ordering::SeqCst);
        match (was_up, up) {
            (false, true) => info!("Network connection established"),
            (true, false) => warn!("Network connection lost"),
            _ => {}
        }
        up
    }

    /// Probe every check interval until shutdown
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.check_interval_seconds);
        loop {
            self.check().await;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Connectivity monitor stopped");
    }
}

impl Connectivity for ConnectivityMonitor {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Connectivity flag set by hand
#[derive(Debug, Default)]
pub struct ManualConnectivity {
    connected: AtomicBool,
}

impl ManualConnectivity {
    pub fn new(connected: bool) -> Self {
        Self {
            connected: AtomicBool::new(connected),
        }
    }

    pub fn set(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

impl Connectivity for ManualConnectivity {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn monitor_for(hosts: Vec<String>) -> ConnectivityMonitor {
        ConnectivityMonitor::new(ConnectivityConfig {
            hosts,
            probe_timeout_ms: 500,
            check_interval_seconds: 1,
        })
    }

    #[tokio::test]
    async fn test_reachable_host_marks_connected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let monitor = monitor_for(vec![addr]);

        assert!(!monitor.is_connected());
        assert!(monitor.check().await);
        assert!(monitor.is_connected());
    }

    #[tokio::test]
    async fn test_unreachable_hosts_mark_disconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let monitor = monitor_for(vec![addr]);
        assert!(!monitor.check().await);
        assert!(!monitor.is_connected());
    }

    #[test]
    fn test_manual_connectivity() {
        let link = ManualConnectivity::new(false);
        assert!(!link.is_connected());
        link.set(true);
        assert!(link.is_connected());
    }
}
