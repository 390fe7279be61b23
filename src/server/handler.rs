//! Request handler
//!
//! Maps one registry request onto the [`ApplicationRegistry`] and builds the
//! response, together with the events to publish.

use bytes::Bytes;
use serde::Serialize;

use crate::event::Event;
use crate::protocol::constants::VALUE_ERROR;
use crate::protocol::message::from_json_part;
use crate::protocol::{RegistryRequest, Response};
use crate::registry::{ApplicationRegistry, RegistryError};
use crate::state::State;

/// Outcome of one request
#[derive(Debug)]
pub struct Handled {
    /// Sent back on the requesting connection
    pub response: Response,
    /// Published on the push stream, in order
    pub events: Vec<Event>,
}

impl Handled {
    fn reply(response: Response) -> Self {
        Self {
            response,
            events: Vec::new(),
        }
    }
}

/// Ports of the endpoints the registry serves besides the request one
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerPorts {
    pub event: u16,
    pub responder_proxy: u16,
}

/// Decode and handle a request frame `[json request, data?]`
pub async fn handle_frame(registry: &ApplicationRegistry, parts: &[Bytes], ports: ServerPorts) -> Handled {
    let request = match parts.first().map(|p| from_json_part::<RegistryRequest>(p)) {
        Some(Ok(request)) => request,
        Some(Err(e)) => {
            tracing::warn!(error = %e, "Invalid registry request");
            return Handled::reply(Response::error(VALUE_ERROR, format!("Invalid request: {}", e)));
        }
        None => return Handled::reply(Response::error(VALUE_ERROR, "Empty request")),
    };

    handle(registry, request, parts.get(1).cloned(), ports).await
}

/// Handle a decoded request
pub async fn handle(
    registry: &ApplicationRegistry,
    request: RegistryRequest,
    data: Option<Bytes>,
    ports: ServerPorts,
) -> Handled {
    tracing::trace!(request = ?request, "Registry request");

    match dispatch(registry, request, data, ports).await {
        Ok(handled) => handled,
        Err(e) => {
            tracing::debug!(error = %e, "Registry request rejected");
            Handled::reply(e.to_response())
        }
    }
}

async fn dispatch(
    registry: &ApplicationRegistry,
    request: RegistryRequest,
    data: Option<Bytes>,
    ports: ServerPorts,
) -> Result<Handled, RegistryError> {
    let handled = match request {
        RegistryRequest::Sync => Handled::reply(Response::ok(0)),
        RegistryRequest::EventPort => Handled::reply(Response::ok(i64::from(ports.event))),
        RegistryRequest::ResponderProxyPort => {
            Handled::reply(Response::ok(i64::from(ports.responder_proxy)))
        }
        RegistryRequest::AttachUnregistered { name, pid } => {
            let (id, events) = registry.attach(&name, pid).await;
            Handled {
                response: Response::ok(i64::from(id)),
                events,
            }
        }
        RegistryRequest::DetachUnregistered { id } => done(registry.detach(id).await?),
        RegistryRequest::Start { .. } => return Err(RegistryError::NotSupported("start")),
        RegistryRequest::Connect { name } => body(&registry.connect(&name).await),
        RegistryRequest::ConnectWithId { id } => body(&registry.connect_with_id(id).await?),
        RegistryRequest::List => body(&registry.list().await),
        RegistryRequest::Stop { id } => done(registry.stop(id).await?),
        RegistryRequest::Kill { id } => done(registry.kill(id).await?),
        RegistryRequest::IsAlive { id } => {
            let alive = registry.is_alive(id).await;
            Handled::reply(Response::ok(i64::from(alive)))
        }
        RegistryRequest::SetStatus { id, state } => {
            let state = State::from_bits(state);
            if state == State::Unknown {
                return Ok(Handled::reply(Response::error(VALUE_ERROR, "Invalid state")));
            }
            done(registry.set_status(id, state).await?)
        }
        RegistryRequest::GetStatus { id } => body(&registry.status(id).await?),
        RegistryRequest::SetResult { id } => {
            done(registry.set_result(id, data.unwrap_or_default()).await?)
        }
        RegistryRequest::StoreKeyValue { id, key, value } => {
            done(registry.store_key_value(id, &key, &value).await?)
        }
        RegistryRequest::GetKeyValue { id, key } => body(&registry.get_key_value(id, &key).await?),
        RegistryRequest::RemoveKey { id, key } => done(registry.remove_key(id, &key).await?),
        RegistryRequest::RequestPort { id, name } => {
            let (port, events) = registry.request_port(id, name.as_deref()).await?;
            Handled {
                response: Response::ok(i64::from(port)),
                events,
            }
        }
        RegistryRequest::PortUnavailable { id, port } => {
            registry.port_unavailable(id, port).await?;
            Handled::reply(Response::ok(0))
        }
        RegistryRequest::ReleasePort { id, port } => {
            registry.release_port(id, port).await?;
            Handled::reply(Response::ok(0))
        }
        RegistryRequest::CreatePublisher {
            id,
            name,
            n_subscribers,
        } => done(registry.create_publisher(id, &name, n_subscribers).await?),
        RegistryRequest::TerminatePublisher { id, name } => {
            registry.terminate_publisher(id, &name).await?;
            Handled::reply(Response::ok(0))
        }
        RegistryRequest::SetStopHandler { id, stopping_time } => {
            registry.set_stop_handler(id, stopping_time).await?;
            Handled::reply(Response::ok(0))
        }
    };

    Ok(handled)
}

fn done(events: Vec<Event>) -> Handled {
    Handled {
        response: Response::ok(0),
        events,
    }
}

fn body<T: Serialize>(value: &T) -> Handled {
    match Response::with_body(value) {
        Ok(response) => Handled::reply(response),
        Err(e) => Handled::reply(Response::error(VALUE_ERROR, e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{json_part, ApplicationInfo, StatusBody};
    use crate::registry::PortPool;

    fn registry() -> ApplicationRegistry {
        ApplicationRegistry::new(PortPool::new(9100, 8))
    }

    async fn attach(registry: &ApplicationRegistry, name: &str) -> i32 {
        let handled = handle(
            registry,
            RegistryRequest::AttachUnregistered {
                name: name.to_string(),
                pid: None,
            },
            None,
            ServerPorts::default(),
        )
        .await;
        handled.response.value as i32
    }

    #[tokio::test]
    async fn test_event_port_and_sync() {
        let registry = registry();

        let ports = ServerPorts {
            event: 7123,
            responder_proxy: 7124,
        };
        let handled = handle(&registry, RegistryRequest::EventPort, None, ports).await;
        assert_eq!(handled.response.value, 7123);

        let handled = handle(&registry, RegistryRequest::ResponderProxyPort, None, ports).await;
        assert_eq!(handled.response.value, 7124);

        let handled = handle(&registry, RegistryRequest::Sync, None, ServerPorts::default()).await;
        assert!(handled.response.is_ok());
    }

    #[tokio::test]
    async fn test_frame_decoding() {
        let registry = registry();

        let frame = vec![json_part(&RegistryRequest::List).unwrap()];
        let handled = handle_frame(&registry, &frame, ServerPorts::default()).await;
        let infos: Vec<ApplicationInfo> = handled.response.body().unwrap();
        assert!(infos.is_empty());

        let handled = handle_frame(&registry, &[Bytes::from_static(b"{nope")], ServerPorts::default()).await;
        assert_eq!(handled.response.value, VALUE_ERROR);

        let handled = handle_frame(&registry, &[], ServerPorts::default()).await;
        assert!(!handled.response.is_ok());
    }

    #[tokio::test]
    async fn test_start_not_supported() {
        let registry = registry();
        let handled = handle(
            &registry,
            RegistryRequest::Start {
                name: "app".into(),
                args: vec![],
            },
            None,
            ServerPorts::default(),
        )
        .await;

        assert_eq!(handled.response.value, -5);
    }

    #[tokio::test]
    async fn test_key_value_round_trip() {
        let registry = registry();
        let id = attach(&registry, "app").await;

        let handled = handle(
            &registry,
            RegistryRequest::StoreKeyValue {
                id,
                key: "k".into(),
                value: "{\"port\":1}".into(),
            },
            None,
            ServerPorts::default(),
        )
        .await;
        assert!(handled.response.is_ok());
        assert_eq!(handled.events.len(), 1);

        let handled = handle(
            &registry,
            RegistryRequest::GetKeyValue { id, key: "k".into() },
            None,
            ServerPorts::default(),
        )
        .await;
        let value: String = handled.response.body().unwrap();
        assert_eq!(value, "{\"port\":1}");

        let handled = handle(
            &registry,
            RegistryRequest::GetKeyValue { id, key: "x".into() },
            None,
            ServerPorts::default(),
        )
        .await;
        assert_eq!(handled.response.value, -3);
    }

    #[tokio::test]
    async fn test_set_result_uses_data_part() {
        let registry = registry();
        let id = attach(&registry, "app").await;

        let frame = vec![
            json_part(&RegistryRequest::SetResult { id }).unwrap(),
            Bytes::from_static(b"done"),
        ];
        let handled = handle_frame(&registry, &frame, ServerPorts::default()).await;

        match &handled.events[0] {
            Event::Result(result) => assert_eq!(result.data, Bytes::from_static(b"done")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_status_and_liveness() {
        let registry = registry();
        let id = attach(&registry, "app").await;

        let handled = handle(&registry, RegistryRequest::IsAlive { id }, None, ServerPorts::default()).await;
        assert_eq!(handled.response.value, 1);

        let handled = handle(&registry, RegistryRequest::Kill { id }, None, ServerPorts::default()).await;
        assert_eq!(handled.events.len(), 2);

        let handled = handle(&registry, RegistryRequest::IsAlive { id }, None, ServerPorts::default()).await;
        assert_eq!(handled.response.value, 0);

        let handled = handle(&registry, RegistryRequest::GetStatus { id }, None, ServerPorts::default()).await;
        let status: StatusBody = handled.response.body().unwrap();
        assert_eq!(status.application_state, State::Killed.bits());

        let handled = handle(&registry, RegistryRequest::GetStatus { id: 77 }, None, ServerPorts::default()).await;
        assert_eq!(handled.response.value, -2);
    }
}
