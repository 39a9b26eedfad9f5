use std::sync::Arc;

use tokio::sync::mpsc;

use crate::caching::{CacheContents, CacheError};
use crate::types::ResourceId;

/// Receives the outcome of a [`resolve`](super::FetchCoordinator::resolve) call.
///
/// The coordinator only keeps a weak reference to a listener. Dropping the listener is a valid
/// way to stop caring about a result, its pending notifications are then silently discarded.
pub trait Listener<T>: Send + Sync + 'static {
    /// The resource was resolved to `payload`.
    fn on_success(&self, id: &ResourceId, payload: Arc<T>);

    /// The resource could not be resolved.
    fn on_failure(&self, id: &ResourceId, error: CacheError);
}

/// An outcome as received through a [`ChannelListener`].
pub type Outcome<T> = (ResourceId, CacheContents<Arc<T>>);

/// A [`Listener`] that forwards every outcome into a channel.
#[derive(Debug)]
pub struct ChannelListener<T> {
    sender: mpsc::UnboundedSender<Outcome<T>>,
}

impl<T> ChannelListener<T> {
    /// Creates a listener together with the receiving end of its channel.
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<Outcome<T>>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Arc::new(Self { sender }), receiver)
    }

    fn send(&self, id: &ResourceId, result: CacheContents<Arc<T>>) {
        // the receiver is allowed to go away before all outcomes arrived
        let _ = self.sender.send((id.clone(), result));
    }
}

impl<T: Send + Sync + 'static> Listener<T> for ChannelListener<T> {
    fn on_success(&self, id: &ResourceId, payload: Arc<T>) {
        self.send(id, Ok(payload));
    }

    fn on_failure(&self, id: &ResourceId, error: CacheError) {
        self.send(id, Err(error));
    }
}
