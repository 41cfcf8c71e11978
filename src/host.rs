use std::sync::Arc;

use crate::adapters::AdapterSet;
use crate::error::HostError;

/// Source of native notifications. A host calls into the adapter set
/// synchronously, once per observed action, from any thread.
///
/// `unregister` asks the host to stop. Callbacks that are already running
/// may still complete; the sensor's own gate keeps them out of the ring
/// once detach has begun.
pub trait NotificationHost: Send + Sync {
    fn register(&self, adapters: Arc<AdapterSet>) -> Result<(), HostError>;

    fn unregister(&self);
}
