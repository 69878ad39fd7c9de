//! Chunkserver connector (spec §4.10, component C10).
//!
//! Grounded on the teacher's `tools::http::ProxyConfig`/keepalive socket
//! handling: a pool of idle sockets per address, a deadline-bounded checkout,
//! and aggregated per-server stats the read planner consumes as scores.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use tokio::net::TcpStream;

use crate::chunk::part::ChunkPartType;
use crate::net::NetworkAddress;

/// Exponentially-weighted moving average over round-trip time, plus a
/// multiplicative penalty for errors, consumed by the read planner as a
/// part's quality score (spec §4.2, §4.10).
#[derive(Debug, Clone, Copy)]
pub struct ServerStats {
    ewma_rtt_ms: f64,
    error_penalty: f64,
}

const EWMA_ALPHA: f64 = 0.2;
const ERROR_DECAY: f64 = 0.9;

impl Default for ServerStats {
    fn default() -> Self {
        ServerStats {
            ewma_rtt_ms: 1.0,
            error_penalty: 1.0,
        }
    }
}

impl ServerStats {
    pub fn record_success(&mut self, rtt: Duration) {
        let ms = rtt.as_secs_f64() * 1000.0;
        self.ewma_rtt_ms = EWMA_ALPHA * ms + (1.0 - EWMA_ALPHA) * self.ewma_rtt_ms;
        self.error_penalty = 1.0 + (self.error_penalty - 1.0) * ERROR_DECAY;
    }

    pub fn record_error(&mut self) {
        self.error_penalty *= 2.0;
    }

    /// Higher is better, matching the read planner's score convention.
    pub fn score(&self) -> f64 {
        1.0 / (self.ewma_rtt_ms.max(0.01) * self.error_penalty)
    }
}

/// Connection pool keyed by chunkserver address. The idle-socket lists are
/// the one structure genuinely shared across threads/tasks (spec §5); a
/// mutex guards them the same way the teacher's `tools::http` wraps its
/// connector state.
pub struct ChunkServerConnector {
    idle: Mutex<HashMap<NetworkAddress, Vec<TcpStream>>>,
    stats: Mutex<HashMap<NetworkAddress, ServerStats>>,
}

impl Default for ChunkServerConnector {
    fn default() -> Self {
        ChunkServerConnector {
            idle: Mutex::new(HashMap::new()),
            stats: Mutex::new(HashMap::new()),
        }
    }
}

impl ChunkServerConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a live socket, reusing an idle one if available, else
    /// connecting fresh; fails once `deadline` has passed.
    pub async fn start_using_connection(&self, addr: NetworkAddress, deadline: Instant) -> Result<TcpStream> {
        if let Some(stream) = self.idle.lock().unwrap().get_mut(&addr).and_then(|v| v.pop()) {
            return Ok(stream);
        }
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or_else(|| anyhow!("deadline already passed connecting to {}", addr))?;
        let started = Instant::now();
        let result = tokio::time::timeout(remaining, TcpStream::connect(addr.to_socket_addr())).await;
        match result {
            Ok(Ok(stream)) => {
                set_keepalive(&stream)?;
                self.record_success(addr, started.elapsed());
                Ok(stream)
            }
            Ok(Err(err)) => {
                self.record_error(addr);
                Err(anyhow!("connect to {} failed: {}", addr, err))
            }
            Err(_) => {
                self.record_error(addr);
                Err(anyhow!("connect to {} timed out", addr))
            }
        }
    }

    /// Returns a socket to the idle pool for reuse unless the caller closed
    /// it (`keep = false`).
    pub fn end_using_connection(&self, addr: NetworkAddress, stream: TcpStream, keep: bool) {
        if keep {
            self.idle.lock().unwrap().entry(addr).or_default().push(stream);
        }
    }

    pub fn record_success(&self, addr: NetworkAddress, rtt: Duration) {
        self.stats.lock().unwrap().entry(addr).or_default().record_success(rtt);
    }

    pub fn record_error(&self, addr: NetworkAddress) {
        self.stats.lock().unwrap().entry(addr).or_default().record_error();
    }

    /// Snapshot of per-part scores for the read planner, keyed by the part
    /// identity rather than the bare address (spec §4.2's `plan_xor` wants
    /// `ChunkPartType -> score`).
    pub fn scores_for(&self, parts: &[(ChunkPartType, NetworkAddress)]) -> HashMap<ChunkPartType, f64> {
        let stats = self.stats.lock().unwrap();
        parts
            .iter()
            .filter_map(|&(part, addr)| stats.get(&addr).map(|s| (part, s.score())))
            .collect()
    }

    pub fn idle_count(&self, addr: NetworkAddress) -> usize {
        self.idle.lock().unwrap().get(&addr).map(|v| v.len()).unwrap_or(0)
    }
}

fn set_keepalive(stream: &TcpStream) -> Result<()> {
    use std::os::unix::io::AsRawFd;
    let fd = stream.as_raw_fd();
    nix::sys::socket::setsockopt(fd, nix::sys::socket::sockopt::KeepAlive, &true)
        .map_err(|err| anyhow!("failed to enable TCP keepalive: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_drops_after_errors_and_recovers_after_successes() {
        let mut stats = ServerStats::default();
        let before = stats.score();
        stats.record_error();
        assert!(stats.score() < before);
        for _ in 0..20 {
            stats.record_success(Duration::from_millis(1));
        }
        assert!(stats.score() > 0.0);
    }
}
