//! Per-client fixed-window rate limiting.

use crate::config::RateLimitConfig;
use crate::error::VaultError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

struct Window {
    started: Instant,
    count: u32,
}

/// Caps requests per client IP within a fixed window.
pub struct RateLimiter {
    enabled: bool,
    window: Duration,
    max_requests: u32,
    clients: Mutex<HashMap<IpAddr, Window>>,
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            enabled: true,
            window,
            max_requests,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self {
            enabled: config.enabled,
            ..Self::new(config.window(), config.max_requests)
        }
    }

    /// Limiter that lets everything through.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new(Duration::from_secs(1), 0)
        }
    }

    /// Count a request from `client`.
    pub fn check(&self, client: IpAddr) -> Result<(), VaultError> {
        self.check_at(client, Instant::now())
    }

    fn check_at(&self, client: IpAddr, now: Instant) -> Result<(), VaultError> {
        if !self.enabled {
            return Ok(());
        }

        let mut clients = self.clients.lock();
        let window = clients.entry(client).or_insert(Window {
            started: now,
            count: 0,
        });

        if now.duration_since(window.started) >= self.window {
            window.started = now;
            window.count = 0;
        }

        if window.count >= self.max_requests {
            let retry_after = self
                .window
                .saturating_sub(now.duration_since(window.started));
            return Err(VaultError::RateLimited { retry_after });
        }

        window.count += 1;
        Ok(())
    }

    /// Forget clients whose window has closed.
    pub fn prune(&self) -> usize {
        self.prune_at(Instant::now())
    }

    fn prune_at(&self, now: Instant) -> usize {
        let mut clients = self.clients.lock();
        let before = clients.len();
        clients.retain(|_, window| now.duration_since(window.started) < self.window);
        before - clients.len()
    }

    pub fn tracked_clients(&self) -> usize {
        self.clients.lock().len()
    }
}
