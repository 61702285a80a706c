use async_trait::async_trait;

use crate::RecoveryError;

/// Hooks a [`ReconnectionStrategy`](crate::ReconnectionStrategy) drives when a
/// device connection is lost.
#[async_trait]
pub trait DeviceRecovery: Send + Sync {
    /// Tries once to bring the device link back. Returns `true` on success.
    async fn reconnect_device(&self, device_id: &str) -> bool;

    /// Cancels all work in flight for the device.
    async fn cancel_device_tasks(&self, device_id: &str, reason: &str) -> Result<(), RecoveryError>;

    /// Records that the device went away.
    async fn on_device_disconnected(&self, device_id: &str) -> Result<(), RecoveryError>;
}
