//! Device seam

use std::io;

use async_trait::async_trait;

/// The WireGuard device as the supervisor sees it.
///
/// The real device is external to this crate; the supervisor only ever
/// brings it up or takes it down, always from its single event-loop task.
#[async_trait]
pub trait Device: Send + Sync {
    /// Bring the tunnel up.
    async fn up(&self) -> io::Result<()>;

    /// Take the tunnel down.
    async fn down(&self) -> io::Result<()>;
}
