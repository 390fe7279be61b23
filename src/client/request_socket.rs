//! Registry RPC socket
//!
//! One request in flight at a time. The connection is opened lazily and
//! dropped after a timeout or transport failure, so that a late reply can
//! never be mistaken for the answer to the next request.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::protocol::constants::{
    VALUE_KEY_ALREADY_EXISTS, VALUE_KEY_NOT_FOUND, VALUE_UNDEFINED_APPLICATION,
};
use crate::protocol::message::{from_json_part, json_part};
use crate::protocol::{Endpoint, RegistryRequest, Response};
use crate::transport::DealerSocket;

/// Request/response connection to the registry
pub struct RequestSocket {
    endpoint: Endpoint,
    timeout: Duration,
    max_part_size: usize,
    socket: Mutex<Option<DealerSocket>>,
}

impl RequestSocket {
    /// Create a socket, the connection is opened by the first request
    pub fn new(endpoint: Endpoint, timeout: Duration, max_part_size: usize) -> Self {
        Self {
            endpoint,
            timeout,
            max_part_size,
            socket: Mutex::new(None),
        }
    }

    /// Registry endpoint
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Send a request and return the raw response
    pub async fn request(&self, request: &RegistryRequest) -> Result<Response> {
        self.request_parts(request, &[]).await
    }

    /// Send a request followed by a binary part
    pub async fn request_with_data(&self, request: &RegistryRequest, data: Bytes) -> Result<Response> {
        self.request_parts(request, &[data]).await
    }

    /// Send a request and map negative response values to errors
    ///
    /// `subject` names the key or application in the error.
    pub async fn request_checked(&self, request: &RegistryRequest, subject: &str) -> Result<Response> {
        check(self.request(request).await?, subject)
    }

    async fn request_parts(&self, request: &RegistryRequest, extra: &[Bytes]) -> Result<Response> {
        let mut parts = Vec::with_capacity(1 + extra.len());
        parts.push(json_part(request)?);
        parts.extend_from_slice(extra);

        let mut slot = self.socket.lock().await;

        let socket = match slot.take() {
            Some(socket) => socket,
            None => tokio::time::timeout(
                self.timeout,
                DealerSocket::connect(&self.endpoint, self.max_part_size),
            )
            .await
            .map_err(|_| Error::Timeout)??,
        };

        let exchange = async {
            socket.send(&parts).await?;
            socket.recv().await.ok_or(Error::ConnectionClosed)
        };

        let outcome = tokio::time::timeout(self.timeout, exchange).await;
        match outcome {
            Ok(Ok(envelope)) => {
                *slot = Some(socket);
                let body = envelope
                    .first()
                    .ok_or_else(|| Error::decode("empty registry response"))?;
                from_json_part(body)
            }
            Ok(Err(e)) => {
                tracing::debug!(endpoint = %self.endpoint, error = %e, "Registry request failed");
                Err(e)
            }
            Err(_) => {
                tracing::debug!(endpoint = %self.endpoint, "Registry request timed out");
                Err(Error::Timeout)
            }
        }
    }
}

/// Map a negative response value to the matching error
pub fn check(response: Response, subject: &str) -> Result<Response> {
    if response.is_ok() {
        return Ok(response);
    }

    Err(match response.value {
        VALUE_UNDEFINED_APPLICATION => Error::UndefinedApplication(subject.to_string()),
        VALUE_KEY_NOT_FOUND => Error::KeyNotFound(subject.to_string()),
        VALUE_KEY_ALREADY_EXISTS => Error::KeyAlreadyExists(subject.to_string()),
        value => Error::Rejected {
            value,
            message: response.message,
        },
    })
}
