//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::time::{Duration, Instant};

use mcp_hub::supervisor::{
    HandshakeSpec, LaunchSpec, RegistrySettings, ServerRegistry, ServerStatus,
};

pub const CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Launch spec for the bundled reference child.
pub fn echo_spec(args: &[&str]) -> LaunchSpec {
    LaunchSpec::new(env!("CARGO_BIN_EXE_echo-server")).with_args(args.iter().copied())
}

/// Fast settings: short health interval, no backoff.
pub fn fast_settings() -> RegistrySettings {
    RegistrySettings {
        health_interval: Duration::from_millis(100),
        grace_period: Duration::from_secs(2),
        restart_backoff: Duration::ZERO,
        handshake: HandshakeSpec {
            timeout: Duration::from_secs(10),
            ..HandshakeSpec::default()
        },
        ..RegistrySettings::default()
    }
}

pub fn registry(entries: &[(&str, LaunchSpec)], settings: RegistrySettings) -> ServerRegistry {
    ServerRegistry::new(
        entries
            .iter()
            .map(|(name, spec)| (name.to_string(), spec.clone())),
        settings,
    )
}

/// Poll `status(name)` until `pred` holds, failing after ten seconds.
pub async fn wait_for_status<F>(registry: &ServerRegistry, name: &str, pred: F) -> ServerStatus
where
    F: Fn(&ServerStatus) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let status = registry.status(name).unwrap();
        if pred(&status) {
            return status;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for status condition, last: {status:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
