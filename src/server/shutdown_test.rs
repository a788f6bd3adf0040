use super::shutdown::shutdown_channel;
use std::time::Duration;

#[tokio::test]
async fn test_signal_starts_clear() {
    let (_controller, signal) = shutdown_channel();
    assert!(!signal.is_shutdown());
}

#[tokio::test]
async fn test_trigger_wakes_waiters() {
    let (controller, mut signal) = shutdown_channel();
    let mut second = signal.clone();

    controller.shutdown();

    tokio::time::timeout(Duration::from_secs(1), signal.wait())
        .await
        .expect("waiter should resolve after shutdown");
    tokio::time::timeout(Duration::from_secs(1), second.wait())
        .await
        .expect("cloned waiter should resolve too");
    assert!(second.is_shutdown());
}

#[tokio::test]
async fn test_dropped_controller_releases_waiters() {
    let (controller, mut signal) = shutdown_channel();
    drop(controller);

    tokio::time::timeout(Duration::from_secs(1), signal.wait())
        .await
        .expect("waiter should resolve when the sender is dropped");
}
