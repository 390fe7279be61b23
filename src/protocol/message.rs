//! JSON message bodies
//!
//! Every control part on the wire is a JSON object. Registry requests and
//! data-plane messages are tagged by a `"type"` field; push stream bodies are
//! identified by the frame tag that precedes them.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::constants::{VALUE_ERROR, VALUE_OK};

/// Request sent to the registry request endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistryRequest {
    /// Liveness round trip
    Sync,
    /// Port of the push stream
    EventPort,
    /// Port of the responder proxy
    ResponderProxyPort,
    /// Register an application that was not started by the registry
    AttachUnregistered {
        name: String,
        #[serde(default)]
        pid: Option<u32>,
    },
    /// Remove an attached application
    DetachUnregistered { id: i32 },
    /// Launch a configured application
    Start {
        name: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Find the instances of an application by name
    Connect { name: String },
    /// Find an instance by id
    ConnectWithId { id: i32 },
    /// List every instance
    List,
    /// Request a graceful stop
    Stop { id: i32 },
    /// Kill an instance
    Kill { id: i32 },
    /// Check if an instance is alive
    IsAlive { id: i32 },
    /// Update the state of an instance
    SetStatus { id: i32, state: u32 },
    /// Read the state of an instance
    GetStatus { id: i32 },
    /// Set the result of an instance, the data follows as an extra part
    SetResult { id: i32 },
    /// Store a key in the key-value store of an instance
    StoreKeyValue { id: i32, key: String, value: String },
    /// Read a key
    GetKeyValue { id: i32, key: String },
    /// Remove a key
    RemoveKey { id: i32, key: String },
    /// Lease a port, optionally announcing it under a name
    RequestPort {
        id: i32,
        #[serde(default)]
        name: Option<String>,
    },
    /// Mark a leased port as unusable (binding failed)
    PortUnavailable { id: i32, port: u16 },
    /// Give a leased port back
    ReleasePort { id: i32, port: u16 },
    /// Announce a publisher
    CreatePublisher {
        id: i32,
        name: String,
        n_subscribers: i32,
    },
    /// Withdraw a publisher
    TerminatePublisher { id: i32, name: String },
    /// Declare that the instance handles stop requests
    SetStopHandler { id: i32, stopping_time: i32 },
}

/// Generic registry response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Non-negative on success
    pub value: i64,
    /// Detail or error message
    #[serde(default)]
    pub message: String,
    /// Typed payload of the operation, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

impl Response {
    /// Successful response carrying a value
    pub fn ok(value: i64) -> Self {
        Self {
            value,
            message: "OK".to_string(),
            body: None,
        }
    }

    /// Successful response carrying a typed body
    pub fn with_body<T: Serialize>(body: &T) -> Result<Self> {
        Ok(Self {
            value: VALUE_OK,
            message: "OK".to_string(),
            body: Some(serde_json::to_value(body)?),
        })
    }

    /// Failed response
    pub fn error(value: i64, message: impl Into<String>) -> Self {
        debug_assert!(value < 0);
        Self {
            value: if value < 0 { value } else { VALUE_ERROR },
            message: message.into(),
            body: None,
        }
    }

    /// Check if the response reports a success
    pub fn is_ok(&self) -> bool {
        self.value >= 0
    }

    /// Decode the typed body
    pub fn body<T: DeserializeOwned>(&self) -> Result<T> {
        let body = self
            .body
            .clone()
            .ok_or_else(|| Error::decode("response has no body"))?;
        Ok(serde_json::from_value(body)?)
    }
}

/// Description of one instance known to the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationInfo {
    pub id: i32,
    pub name: String,
    pub application_state: u32,
    pub past_application_states: u32,
    #[serde(default)]
    pub args: String,
    #[serde(default)]
    pub pid: Option<u32>,
}

/// Body of `STATUS` frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusBody {
    pub id: i32,
    pub name: String,
    pub application_state: u32,
    pub past_application_states: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Body of `RESULT` frames, the result data follows as an extra part
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultBody {
    pub id: i32,
    pub name: String,
}

/// Operation carried by `KEYVALUE` frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Stored,
    Removed,
}

/// Body of `KEYVALUE` frames (and of the legacy key frames, without `status`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyValueBody {
    pub id: i32,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<KeyStatus>,
    pub key: String,
    #[serde(default)]
    pub value: String,
}

/// Body of `PORT` frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortBody {
    pub id: i32,
    pub name: String,
    pub port_name: String,
}

/// Body of `PUBLISHER` frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublisherBody {
    pub id: i32,
    pub name: String,
    pub publisher_name: String,
}

/// Control part of every data-plane message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ComsMessage {
    /// Requester synchronization, answered without reaching the caller
    Sync,
    /// Request, followed by one or two payload parts
    Request {
        application_name: String,
        application_id: i32,
        server_endpoint: String,
        #[serde(default)]
        server_proxy_port: u16,
    },
    /// Response, followed by one or two payload parts
    Response,
    /// Acknowledgement of sync and cancel messages
    Ack,
    /// Unblock the receiver
    Cancel,
    /// Publisher data, followed by one or two payload parts
    Stream,
    /// Publisher liveness frame, ignored by subscribers
    SyncStream,
    /// Publisher ended the stream
    StreamEnd,
}

impl ComsMessage {
    /// Encode as a frame part
    pub fn to_part(&self) -> Bytes {
        // Serializing a plain enum into JSON cannot fail.
        Bytes::from(serde_json::to_vec(self).unwrap_or_default())
    }

    /// Decode a frame part
    pub fn from_part(part: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(part)?)
    }
}

/// Payload a subscriber sends to the publisher's companion responder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PublisherRequest {
    SubscribePublisher,
}

/// Discovery record of a responder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponderRecord {
    pub port: u16,
}

/// Discovery record of a publisher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherRecord {
    pub publisher_port: u16,
    pub n_subscribers: i32,
}

/// Encode any JSON body as a frame part
pub fn json_part<T: Serialize>(value: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

/// Decode a JSON frame part
pub fn from_json_part<T: DeserializeOwned>(part: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(part)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_request_is_tagged() {
        let request = RegistryRequest::StoreKeyValue {
            id: 3,
            key: "k".into(),
            value: "v".into(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["type"], "store_key_value");
        assert_eq!(json["id"], 3);

        let decoded: RegistryRequest =
            serde_json::from_str(r#"{"type":"request_port","id":1}"#).unwrap();
        assert_eq!(decoded, RegistryRequest::RequestPort { id: 1, name: None });
    }

    #[test]
    fn test_response_body() {
        let info = ApplicationInfo {
            id: 1,
            name: "app".into(),
            application_state: 2,
            past_application_states: 3,
            args: String::new(),
            pid: None,
        };
        let response = Response::with_body(&info).unwrap();
        assert!(response.is_ok());
        assert_eq!(response.body::<ApplicationInfo>().unwrap(), info);

        let error = Response::error(-3, "missing");
        assert!(!error.is_ok());
        assert!(error.body::<ApplicationInfo>().is_err());
    }

    #[test]
    fn test_coms_message_parts() {
        let part = ComsMessage::StreamEnd.to_part();
        assert_eq!(&part[..], br#"{"type":"stream_end"}"#);
        assert_eq!(ComsMessage::from_part(&part).unwrap(), ComsMessage::StreamEnd);
        assert!(ComsMessage::from_part(b"not json").is_err());
    }

    #[test]
    fn test_legacy_key_body_without_status() {
        let body: KeyValueBody =
            serde_json::from_str(r#"{"id":1,"name":"a","key":"k","value":"v"}"#).unwrap();
        assert_eq!(body.status, None);
    }
}
