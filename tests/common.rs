//! Common test harness utilities for integration tests.
//!
//! - Allocating ephemeral UDP ports
//! - Building test configurations
//! - Polling for asynchronous conditions

// Not all test files use all helpers; silence dead_code warnings for unused exports.
#![allow(dead_code)]

use cubo::config::Config;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

/// Allocate an ephemeral loopback UDP port. Returns the address with assigned port.
pub fn ephemeral_udp() -> SocketAddr {
    UdpSocket::bind("127.0.0.1:0")
        .expect("bind ephemeral port")
        .local_addr()
        .expect("ephemeral addr")
}

/// Config with the broker disabled and the reporter aimed at `collector`.
pub fn offline_config(collector: SocketAddr) -> Config {
    let mut config = Config::default();
    config.broker.enabled = false;
    config.collector.addr = collector.to_string();
    config.collector.bind = "127.0.0.1:0".into();
    config
}

/// Poll `check` every 10 ms until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
