use crate::error::Result;

use async_trait::async_trait;

/// Lifecycle shared by pluggable components.
///
/// Components are initialized by their constructors; `close` releases the
/// underlying resources. Calling `close` more than once is a no-op.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn close(&self) -> Result<()>;
}
