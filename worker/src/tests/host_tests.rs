//! Tests for the signal shutdown manager and the Unix host controller

use crate::host::{HostController, ShutdownIntent, ShutdownManager, SignalShutdownManager, UnixHost};
use std::time::Duration;

#[test]
fn test_no_signal_means_no_shutdown() {
    let manager = SignalShutdownManager::new(0);
    assert_eq!(manager.should_exit(), ShutdownIntent::None);
}

#[test]
fn test_signal_escalation() {
    let manager = SignalShutdownManager::new(0);

    manager.record_signal();
    assert_eq!(manager.should_exit(), ShutdownIntent::Graceful);

    manager.record_signal();
    assert_eq!(manager.should_exit(), ShutdownIntent::Immediate);

    // Further signals stay at the highest severity.
    manager.record_signal();
    assert_eq!(manager.should_exit(), ShutdownIntent::Immediate);
}

#[test]
fn test_idle_timeout_raises_graceful() {
    let manager = SignalShutdownManager::with_idle_timeout(Some(Duration::from_millis(50)));

    manager.on_idle();
    assert_eq!(manager.should_exit(), ShutdownIntent::None);

    std::thread::sleep(Duration::from_millis(80));
    assert_eq!(manager.should_exit(), ShutdownIntent::Graceful);
}

#[test]
fn test_working_resets_idle_clock() {
    let manager = SignalShutdownManager::with_idle_timeout(Some(Duration::from_millis(50)));

    manager.on_idle();
    std::thread::sleep(Duration::from_millis(30));
    manager.on_working();
    manager.on_idle();
    std::thread::sleep(Duration::from_millis(30));

    // Idleness was interrupted, so the timeout has not elapsed.
    assert_eq!(manager.should_exit(), ShutdownIntent::None);
}

#[test]
fn test_disabled_idle_timeout_never_fires() {
    let manager = SignalShutdownManager::new(0);
    manager.on_idle();
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(manager.should_exit(), ShutdownIntent::None);
}

#[test]
fn test_intent_ordering() {
    assert!(ShutdownIntent::None < ShutdownIntent::Graceful);
    assert!(ShutdownIntent::Graceful < ShutdownIntent::Immediate);
}

#[cfg(target_os = "linux")]
#[test]
fn test_unix_host_uptime() {
    let host = UnixHost::new();
    let uptime = host.uptime().unwrap();
    assert!(uptime > 0);
    assert_eq!(host.billing_cycle_uptime().unwrap(), uptime);
}
