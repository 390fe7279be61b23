//! Waiting read of a key-value entry

use crate::error::{Error, Result};
use crate::event::Event;
use crate::state::StateMask;

use super::instance::{Instance, WaitFilter};

/// Reads a key of an instance, waiting until it is stored
///
/// Used for discovery: a requester or subscriber may be created before the
/// responder or publisher it looks for has registered itself.
pub struct KeyValueGetter {
    instance: Instance,
    key: String,
}

impl KeyValueGetter {
    /// Create a getter with its own event listener on `instance`
    pub fn new(instance: &Instance, key: impl Into<String>) -> Self {
        Self {
            instance: instance.duplicate(),
            key: key.into(),
        }
    }

    /// Key being read
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Read the key, waiting for it if it is not stored yet
    ///
    /// Returns `Ok(None)` when canceled, [`Error::KeyNotFound`] when the
    /// instance terminates first and [`Error::ConnectionClosed`] when the
    /// event stream ends.
    pub async fn get(&self) -> Result<Option<String>> {
        let server = self.instance.server();

        loop {
            match server.get_key_value(self.instance.id(), &self.key).await {
                Ok(value) => return Ok(Some(value)),
                Err(Error::KeyNotFound(_)) => {}
                Err(e) => return Err(e),
            }

            // A termination published before this getter existed is only
            // known by the registry.
            self.instance.refresh().await;

            tracing::debug!(app = %self.instance.name(), key = %self.key, "Waiting for key");

            let outcome = self
                .instance
                .wait_for_with(StateMask::EMPTY, &WaitFilter::Key(self.key.clone()), None, true)
                .await;

            // Stored or removed, read again either way.
            if let Some(Event::KeyValue(_)) = outcome.matched {
                continue;
            }

            if self.instance.is_canceled() {
                return Ok(None);
            }
            if outcome.state.is_terminal() || !self.instance.exists() {
                return Err(Error::KeyNotFound(self.key.clone()));
            }
            if self.instance.is_closed() {
                return Err(Error::ConnectionClosed);
            }
            return Err(Error::KeyNotFound(self.key.clone()));
        }
    }

    /// Unblock `get` running in another task
    pub fn cancel(&self) {
        self.instance.cancel();
    }

    /// Check if `get` was canceled
    pub fn is_canceled(&self) -> bool {
        self.instance.is_canceled()
    }
}
