//! Application registry implementation
//!
//! The central registry that tracks attached applications, their key-value
//! stores and leased ports. Every mutation returns the events the server
//! publishes on its push stream, in order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};

use bytes::Bytes;
use tokio::sync::{Mutex, RwLock};

use crate::event::{Event, KeyEvent, KeyOperation, PortEvent, PublisherEvent, ResultEvent};
use crate::protocol::message::{ApplicationInfo, StatusBody};
use crate::state::State;

use super::entry::AppEntry;
use super::error::RegistryError;
use super::ports::PortPool;

/// Central registry for all attached applications
///
/// Thread-safe via `RwLock`. Status queries and lookups take the read lock.
pub struct ApplicationRegistry {
    /// Map of application id to entry, terminated entries included
    apps: RwLock<HashMap<i32, AppEntry>>,

    /// Ports leased to the applications
    ports: Mutex<PortPool>,

    /// Next application id, ids start at 1
    next_id: AtomicI32,
}

impl ApplicationRegistry {
    /// Create a registry leasing ports from `ports`
    pub fn new(ports: PortPool) -> Self {
        Self {
            apps: RwLock::new(HashMap::new()),
            ports: Mutex::new(ports),
            next_id: AtomicI32::new(1),
        }
    }

    /// Attach an application that was started outside the registry
    pub async fn attach(&self, name: &str, pid: Option<u32>) -> (i32, Vec<Event>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = AppEntry::new(id, name, pid);
        let event = entry.status_event();

        self.apps.write().await.insert(id, entry);

        tracing::info!(app = %name, id = id, pid = ?pid, "Application attached");

        (id, vec![event])
    }

    /// Detach an application
    ///
    /// Ends in STOPPED when a stop was requested, SUCCESS otherwise. Its
    /// ports are released.
    pub async fn detach(&self, id: i32) -> Result<Vec<Event>, RegistryError> {
        let events = self
            .with_app(id, |entry| {
                if !entry.is_alive() {
                    return Ok(Vec::new());
                }
                let terminal = if entry.stop_requested {
                    State::Stopped
                } else {
                    State::Success
                };
                entry.exit_code = Some(0);
                Ok(entry.transition(terminal).into_iter().collect())
            })
            .await?;

        let released = self.ports.lock().await.release_owner(id);
        tracing::info!(id = id, released_ports = released, "Application detached");

        Ok(events)
    }

    /// Running instances of the application `name`
    pub async fn connect(&self, name: &str) -> Vec<ApplicationInfo> {
        let apps = self.apps.read().await;
        let mut infos: Vec<ApplicationInfo> = apps
            .values()
            .filter(|entry| entry.name == name && entry.is_alive())
            .map(AppEntry::info)
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Application with id `id`
    pub async fn connect_with_id(&self, id: i32) -> Result<ApplicationInfo, RegistryError> {
        self.read_app(id, AppEntry::info).await
    }

    /// Every running application
    pub async fn list(&self) -> Vec<ApplicationInfo> {
        let apps = self.apps.read().await;
        let mut infos: Vec<ApplicationInfo> = apps
            .values()
            .filter(|entry| entry.is_alive())
            .map(AppEntry::info)
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Check if an application is alive, unknown ids are not
    pub async fn is_alive(&self, id: i32) -> bool {
        self.read_app(id, AppEntry::is_alive).await.unwrap_or(false)
    }

    /// Status of an application
    pub async fn status(&self, id: i32) -> Result<StatusBody, RegistryError> {
        self.read_app(id, AppEntry::status).await
    }

    /// Request a graceful stop
    pub async fn stop(&self, id: i32) -> Result<Vec<Event>, RegistryError> {
        self.with_live_app(id, |entry| {
            entry.stop_requested = true;
            Ok(entry.transition(State::Stopping).into_iter().collect())
        })
        .await
    }

    /// Kill an application, going through KILLING to KILLED
    pub async fn kill(&self, id: i32) -> Result<Vec<Event>, RegistryError> {
        let events = self
            .with_live_app(id, |entry| {
                let mut events = Vec::with_capacity(2);
                events.extend(entry.transition(State::Killing));
                entry.exit_code = Some(-9);
                events.extend(entry.transition(State::Killed));
                Ok(events)
            })
            .await?;

        self.ports.lock().await.release_owner(id);
        tracing::info!(id = id, "Application killed");

        Ok(events)
    }

    /// Update the state of an application
    pub async fn set_status(&self, id: i32, state: State) -> Result<Vec<Event>, RegistryError> {
        let events = self
            .with_live_app(id, |entry| Ok(entry.transition(state).into_iter().collect()))
            .await?;

        if state.is_terminal() {
            self.ports.lock().await.release_owner(id);
        }

        Ok(events)
    }

    /// Store the result of an application
    pub async fn set_result(&self, id: i32, data: Bytes) -> Result<Vec<Event>, RegistryError> {
        self.with_live_app(id, |entry| {
            entry.result = Some(data.clone());
            Ok(vec![Event::Result(ResultEvent {
                id,
                name: entry.name.clone(),
                data,
            })])
        })
        .await
    }

    /// Store a key, fails if the key is present
    pub async fn store_key_value(
        &self,
        id: i32,
        key: &str,
        value: &str,
    ) -> Result<Vec<Event>, RegistryError> {
        self.with_live_app(id, |entry| {
            if entry.keys.contains_key(key) {
                return Err(RegistryError::KeyAlreadyExists(key.to_string()));
            }
            entry.keys.insert(key.to_string(), value.to_string());

            tracing::debug!(app = %entry.name, id = id, key = %key, "Key stored");

            Ok(vec![Event::KeyValue(KeyEvent {
                id,
                name: entry.name.clone(),
                operation: KeyOperation::Stored,
                key: key.to_string(),
                value: value.to_string(),
            })])
        })
        .await
    }

    /// Read a key
    pub async fn get_key_value(&self, id: i32, key: &str) -> Result<String, RegistryError> {
        let apps = self.apps.read().await;
        let entry = apps
            .get(&id)
            .ok_or(RegistryError::UndefinedApplication(id))?;
        entry
            .keys
            .get(key)
            .cloned()
            .ok_or_else(|| RegistryError::KeyNotFound(key.to_string()))
    }

    /// Remove a key
    pub async fn remove_key(&self, id: i32, key: &str) -> Result<Vec<Event>, RegistryError> {
        self.with_live_app(id, |entry| {
            let value = entry
                .keys
                .remove(key)
                .ok_or_else(|| RegistryError::KeyNotFound(key.to_string()))?;

            tracing::debug!(app = %entry.name, id = id, key = %key, "Key removed");

            Ok(vec![Event::KeyValue(KeyEvent {
                id,
                name: entry.name.clone(),
                operation: KeyOperation::Removed,
                key: key.to_string(),
                value,
            })])
        })
        .await
    }

    /// Lease a port, announcing it when named
    pub async fn request_port(
        &self,
        id: i32,
        name: Option<&str>,
    ) -> Result<(u16, Vec<Event>), RegistryError> {
        // Checked first so that no port is leased to an unknown application.
        self.with_live_app(id, |_| Ok(())).await?;

        let port = self
            .ports
            .lock()
            .await
            .lease(id)
            .ok_or(RegistryError::NoPortAvailable)?;

        let events = match name {
            Some(port_name) => {
                self.with_app(id, |entry| {
                    entry.named_ports.insert(port_name.to_string(), port);
                    Ok(vec![Event::Port(PortEvent {
                        id,
                        name: entry.name.clone(),
                        port_name: port_name.to_string(),
                    })])
                })
                .await?
            }
            None => Vec::new(),
        };

        tracing::debug!(id = id, port = port, name = ?name, "Port leased");

        Ok((port, events))
    }

    /// Mark a leased port as unusable
    pub async fn port_unavailable(&self, id: i32, port: u16) -> Result<(), RegistryError> {
        if self.ports.lock().await.mark_unavailable(id, port) {
            tracing::warn!(id = id, port = port, "Port reported unavailable");
            Ok(())
        } else {
            Err(RegistryError::PortNotLeased(port))
        }
    }

    /// Give a leased port back
    pub async fn release_port(&self, id: i32, port: u16) -> Result<(), RegistryError> {
        if self.ports.lock().await.release(id, port) {
            self.with_app(id, |entry| {
                entry.named_ports.retain(|_, p| *p != port);
                Ok(())
            })
            .await?;
            Ok(())
        } else {
            Err(RegistryError::PortNotLeased(port))
        }
    }

    /// Announce a publisher
    pub async fn create_publisher(
        &self,
        id: i32,
        name: &str,
        n_subscribers: i32,
    ) -> Result<Vec<Event>, RegistryError> {
        self.with_live_app(id, |entry| {
            entry.publishers.insert(name.to_string(), n_subscribers);

            tracing::debug!(app = %entry.name, id = id, publisher = %name, "Publisher created");

            Ok(vec![Event::PublisherReady(PublisherEvent {
                id,
                name: entry.name.clone(),
                publisher_name: name.to_string(),
            })])
        })
        .await
    }

    /// Withdraw a publisher
    pub async fn terminate_publisher(&self, id: i32, name: &str) -> Result<(), RegistryError> {
        self.with_app(id, |entry| {
            entry.publishers.remove(name);
            Ok(())
        })
        .await
    }

    /// Record that the application handles stop requests
    pub async fn set_stop_handler(&self, id: i32, stopping_time: i32) -> Result<(), RegistryError> {
        self.with_live_app(id, |entry| {
            entry.stopping_time = Some(stopping_time);
            Ok(())
        })
        .await
    }

    /// Number of running applications
    pub async fn app_count(&self) -> usize {
        self.apps
            .read()
            .await
            .values()
            .filter(|entry| entry.is_alive())
            .count()
    }

    async fn read_app<T>(&self, id: i32, f: impl FnOnce(&AppEntry) -> T) -> Result<T, RegistryError> {
        let apps = self.apps.read().await;
        apps.get(&id)
            .map(f)
            .ok_or(RegistryError::UndefinedApplication(id))
    }

    async fn with_app<T>(
        &self,
        id: i32,
        f: impl FnOnce(&mut AppEntry) -> Result<T, RegistryError>,
    ) -> Result<T, RegistryError> {
        let mut apps = self.apps.write().await;
        let entry = apps
            .get_mut(&id)
            .ok_or(RegistryError::UndefinedApplication(id))?;
        f(entry)
    }

    async fn with_live_app<T>(
        &self,
        id: i32,
        f: impl FnOnce(&mut AppEntry) -> Result<T, RegistryError>,
    ) -> Result<T, RegistryError> {
        self.with_app(id, |entry| {
            if !entry.is_alive() {
                return Err(RegistryError::Terminated(id));
            }
            f(entry)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateMask;

    fn registry() -> ApplicationRegistry {
        ApplicationRegistry::new(PortPool::new(9000, 4))
    }

    #[tokio::test]
    async fn test_attach_and_connect() {
        let registry = registry();

        let (first, events) = registry.attach("app", Some(10)).await;
        let (second, _) = registry.attach("app", None).await;
        registry.attach("other", None).await;

        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert!(matches!(&events[0], Event::Status(s) if s.state == State::Running));

        let infos = registry.connect("app").await;
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].id, first);
        assert_eq!(registry.list().await.len(), 3);
        assert!(registry.connect("missing").await.is_empty());
    }

    #[tokio::test]
    async fn test_detach_success_or_stopped() {
        let registry = registry();
        let (plain, _) = registry.attach("plain", None).await;
        let (stopped, _) = registry.attach("stopped", None).await;

        let events = registry.detach(plain).await.unwrap();
        assert!(matches!(&events[0], Event::Status(s) if s.state == State::Success));

        registry.stop(stopped).await.unwrap();
        let events = registry.detach(stopped).await.unwrap();
        match &events[0] {
            Event::Status(s) => {
                assert_eq!(s.state, State::Stopped);
                assert!(s.past_states.contains(State::Stopping));
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(!registry.is_alive(plain).await);
        assert_eq!(registry.app_count().await, 0);
        // Status stays readable after termination.
        assert_eq!(
            registry.status(plain).await.unwrap().application_state,
            State::Success.bits()
        );
    }

    #[tokio::test]
    async fn test_kill_goes_through_killing() {
        let registry = registry();
        let (id, _) = registry.attach("app", None).await;

        let events = registry.kill(id).await.unwrap();
        let states: Vec<State> = events
            .iter()
            .filter_map(|e| match e {
                Event::Status(s) => Some(s.state),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![State::Killing, State::Killed]);

        assert_eq!(registry.kill(id).await, Err(RegistryError::Terminated(id)));
    }

    #[tokio::test]
    async fn test_key_value_store() {
        let registry = registry();
        let (id, _) = registry.attach("app", None).await;

        let events = registry.store_key_value(id, "k", "v").await.unwrap();
        assert!(matches!(
            &events[0],
            Event::KeyValue(e) if e.operation == KeyOperation::Stored && e.value == "v"
        ));

        assert_eq!(
            registry.store_key_value(id, "k", "w").await,
            Err(RegistryError::KeyAlreadyExists("k".into()))
        );
        assert_eq!(registry.get_key_value(id, "k").await.unwrap(), "v");

        let events = registry.remove_key(id, "k").await.unwrap();
        assert!(matches!(&events[0], Event::KeyValue(e) if e.operation == KeyOperation::Removed));

        assert_eq!(
            registry.get_key_value(id, "k").await,
            Err(RegistryError::KeyNotFound("k".into()))
        );
        assert_eq!(
            registry.get_key_value(99, "k").await,
            Err(RegistryError::UndefinedApplication(99))
        );
    }

    #[tokio::test]
    async fn test_ports() {
        let registry = registry();
        let (id, _) = registry.attach("app", None).await;

        let (port, events) = registry.request_port(id, None).await.unwrap();
        assert_eq!(port, 9000);
        assert!(events.is_empty());

        let (named, events) = registry.request_port(id, Some("data")).await.unwrap();
        assert_eq!(named, 9001);
        assert!(matches!(&events[0], Event::Port(e) if e.port_name == "data"));

        registry.port_unavailable(id, port).await.unwrap();
        registry.release_port(id, named).await.unwrap();
        assert_eq!(
            registry.release_port(id, named).await,
            Err(RegistryError::PortNotLeased(named))
        );

        assert!(registry.request_port(42, None).await.is_err());
    }

    #[tokio::test]
    async fn test_status_updates() {
        let registry = registry();
        let (id, _) = registry.attach("app", None).await;

        assert!(registry.set_status(id, State::Running).await.unwrap().is_empty());
        registry.set_status(id, State::Failure).await.unwrap();

        let status = registry.status(id).await.unwrap();
        assert_eq!(status.application_state, State::Failure.bits());
        assert_eq!(
            StateMask::from_bits(status.past_application_states),
            State::Running | State::Failure
        );
        assert!(registry.set_result(id, Bytes::from_static(b"r")).await.is_err());
    }
}
