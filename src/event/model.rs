//! Event model
//!
//! Events are decoded from the registry push stream. Each frame is
//! `[tag, json body]`, with the result data as a third part for `RESULT`:
//!
//! ```text
//! STATUS    {"id","name","application_state","past_application_states","exit_code"?}
//! RESULT    {"id","name"}  <data>
//! KEYVALUE  {"id","name","status":"stored"|"removed","key","value"}
//! PORT      {"id","name","port_name"}
//! PUBLISHER {"id","name","publisher_name"}
//! CANCEL
//! ```

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::protocol::constants::{
    TAG_CANCEL, TAG_KEYVALUE, TAG_PORT, TAG_PUBLISHER, TAG_REMOVE_KEYVALUE, TAG_RESULT,
    TAG_STATUS, TAG_STORE_KEYVALUE,
};
use crate::protocol::message::{
    from_json_part, json_part, KeyStatus, KeyValueBody, PortBody, PublisherBody, ResultBody,
    StatusBody,
};
use crate::state::{State, StateMask};
use crate::transport::Multipart;

/// Lifecycle change of an instance
#[derive(Debug, Clone, PartialEq)]
pub struct StatusEvent {
    pub id: i32,
    pub name: String,
    /// Current state
    pub state: State,
    /// Every state the instance has been in, including `state`
    pub past_states: StateMask,
    /// Exit code, once the process has exited
    pub exit_code: Option<i32>,
}

/// Result published by an instance
#[derive(Debug, Clone, PartialEq)]
pub struct ResultEvent {
    pub id: i32,
    pub name: String,
    pub data: Bytes,
}

/// Change applied to a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOperation {
    Stored,
    Removed,
}

/// Key stored in or removed from the key-value store of an instance
#[derive(Debug, Clone, PartialEq)]
pub struct KeyEvent {
    pub id: i32,
    pub name: String,
    pub operation: KeyOperation,
    pub key: String,
    pub value: String,
}

/// Named port requested by an instance
#[derive(Debug, Clone, PartialEq)]
pub struct PortEvent {
    pub id: i32,
    pub name: String,
    pub port_name: String,
}

/// Publisher announced by an instance
#[derive(Debug, Clone, PartialEq)]
pub struct PublisherEvent {
    pub id: i32,
    pub name: String,
    pub publisher_name: String,
}

/// Synthesized to unblock a waiter
#[derive(Debug, Clone, PartialEq)]
pub struct CancelEvent {
    pub id: i32,
    pub name: String,
}

/// Event delivered to listeners
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Status(StatusEvent),
    Result(ResultEvent),
    KeyValue(KeyEvent),
    Port(PortEvent),
    PublisherReady(PublisherEvent),
    Cancel(CancelEvent),
}

impl Event {
    /// Create a cancel event
    pub fn cancel(id: i32) -> Self {
        Event::Cancel(CancelEvent {
            id,
            name: String::new(),
        })
    }

    /// Id of the instance the event is about
    pub fn id(&self) -> i32 {
        match self {
            Event::Status(e) => e.id,
            Event::Result(e) => e.id,
            Event::KeyValue(e) => e.id,
            Event::Port(e) => e.id,
            Event::PublisherReady(e) => e.id,
            Event::Cancel(e) => e.id,
        }
    }

    /// Name of the application the event is about
    pub fn name(&self) -> &str {
        match self {
            Event::Status(e) => &e.name,
            Event::Result(e) => &e.name,
            Event::KeyValue(e) => &e.name,
            Event::Port(e) => &e.name,
            Event::PublisherReady(e) => &e.name,
            Event::Cancel(e) => &e.name,
        }
    }

    /// Encode as a push stream frame
    pub fn encode(&self) -> Result<Multipart> {
        let parts = match self {
            Event::Status(e) => vec![
                Bytes::from_static(TAG_STATUS.as_bytes()),
                json_part(&StatusBody {
                    id: e.id,
                    name: e.name.clone(),
                    application_state: e.state.bits(),
                    past_application_states: e.past_states.bits(),
                    exit_code: e.exit_code,
                })?,
            ],
            Event::Result(e) => vec![
                Bytes::from_static(TAG_RESULT.as_bytes()),
                json_part(&ResultBody {
                    id: e.id,
                    name: e.name.clone(),
                })?,
                e.data.clone(),
            ],
            Event::KeyValue(e) => vec![
                Bytes::from_static(TAG_KEYVALUE.as_bytes()),
                json_part(&KeyValueBody {
                    id: e.id,
                    name: e.name.clone(),
                    status: Some(match e.operation {
                        KeyOperation::Stored => KeyStatus::Stored,
                        KeyOperation::Removed => KeyStatus::Removed,
                    }),
                    key: e.key.clone(),
                    value: e.value.clone(),
                })?,
            ],
            Event::Port(e) => vec![
                Bytes::from_static(TAG_PORT.as_bytes()),
                json_part(&PortBody {
                    id: e.id,
                    name: e.name.clone(),
                    port_name: e.port_name.clone(),
                })?,
            ],
            Event::PublisherReady(e) => vec![
                Bytes::from_static(TAG_PUBLISHER.as_bytes()),
                json_part(&PublisherBody {
                    id: e.id,
                    name: e.name.clone(),
                    publisher_name: e.publisher_name.clone(),
                })?,
            ],
            Event::Cancel(_) => vec![Bytes::from_static(TAG_CANCEL.as_bytes())],
        };

        Ok(parts)
    }
}

/// Decoded push stream frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// An event to dispatch
    Event(Event),
    /// End of the stream
    Cancel,
    /// Frame with a tag this client does not know
    Unknown(String),
}

/// Decode a push stream frame
pub fn decode_frame(parts: &[Bytes]) -> Result<Frame> {
    let tag = parts
        .first()
        .ok_or_else(|| Error::decode("empty event frame"))?;
    let tag = std::str::from_utf8(tag).map_err(|_| Error::decode("event tag is not UTF-8"))?;

    if tag == TAG_CANCEL {
        return Ok(Frame::Cancel);
    }

    let known = matches!(
        tag,
        TAG_STATUS
            | TAG_RESULT
            | TAG_KEYVALUE
            | TAG_STORE_KEYVALUE
            | TAG_REMOVE_KEYVALUE
            | TAG_PORT
            | TAG_PUBLISHER
    );
    if !known {
        return Ok(Frame::Unknown(tag.to_string()));
    }

    let body = parts
        .get(1)
        .ok_or_else(|| Error::decode(format!("{} frame without body", tag)))?;

    let event = match tag {
        TAG_STATUS => {
            let body: StatusBody = from_json_part(body)?;
            Event::Status(StatusEvent {
                id: body.id,
                name: body.name,
                state: State::from_bits(body.application_state),
                past_states: StateMask::from_bits(body.past_application_states),
                exit_code: body.exit_code,
            })
        }
        TAG_RESULT => {
            let body: ResultBody = from_json_part(body)?;
            Event::Result(ResultEvent {
                id: body.id,
                name: body.name,
                data: parts.get(2).cloned().unwrap_or_default(),
            })
        }
        TAG_PORT => {
            let body: PortBody = from_json_part(body)?;
            Event::Port(PortEvent {
                id: body.id,
                name: body.name,
                port_name: body.port_name,
            })
        }
        TAG_PUBLISHER => {
            let body: PublisherBody = from_json_part(body)?;
            Event::PublisherReady(PublisherEvent {
                id: body.id,
                name: body.name,
                publisher_name: body.publisher_name,
            })
        }
        _ => {
            let body: KeyValueBody = from_json_part(body)?;
            let operation = match (tag, body.status) {
                (TAG_STORE_KEYVALUE, _) => KeyOperation::Stored,
                (TAG_REMOVE_KEYVALUE, _) => KeyOperation::Removed,
                (_, Some(KeyStatus::Stored)) => KeyOperation::Stored,
                (_, Some(KeyStatus::Removed)) => KeyOperation::Removed,
                (_, None) => return Err(Error::decode("KEYVALUE frame without status")),
            };
            Event::KeyValue(KeyEvent {
                id: body.id,
                name: body.name,
                operation,
                key: body.key,
                value: body.value,
            })
        }
    };

    Ok(Frame::Event(event))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(tag: &'static str, body: &'static str) -> Multipart {
        vec![Bytes::from_static(tag.as_bytes()), Bytes::from_static(body.as_bytes())]
    }

    #[test]
    fn test_decode_status() {
        let frame = decode_frame(&parts(
            "STATUS",
            r#"{"id":4,"name":"pub","application_state":2,"past_application_states":3}"#,
        ))
        .unwrap();

        let Frame::Event(Event::Status(status)) = frame else {
            panic!("expected a status event");
        };
        assert_eq!(status.id, 4);
        assert_eq!(status.name, "pub");
        assert_eq!(status.state, State::Running);
        assert!(status.past_states.contains(State::Starting));
        assert_eq!(status.exit_code, None);
    }

    #[test]
    fn test_encoded_events_decode_back() {
        let events = [
            Event::Status(StatusEvent {
                id: 1,
                name: "a".into(),
                state: State::Killed,
                past_states: State::Running | State::Killing | State::Killed,
                exit_code: Some(137),
            }),
            Event::Result(ResultEvent {
                id: 1,
                name: "a".into(),
                data: Bytes::from_static(b"\x00\x01binary"),
            }),
            Event::KeyValue(KeyEvent {
                id: 2,
                name: "b".into(),
                operation: KeyOperation::Removed,
                key: "k".into(),
                value: String::new(),
            }),
            Event::PublisherReady(PublisherEvent {
                id: 3,
                name: "c".into(),
                publisher_name: "stream".into(),
            }),
        ];

        for event in events {
            let frame = decode_frame(&event.encode().unwrap()).unwrap();
            assert_eq!(frame, Frame::Event(event));
        }
    }

    #[test]
    fn test_legacy_key_tags() {
        let frame = decode_frame(&parts(
            "STOREKEYVALUE",
            r#"{"id":1,"name":"a","key":"k","value":"v"}"#,
        ))
        .unwrap();
        match frame {
            Frame::Event(Event::KeyValue(e)) => assert_eq!(e.operation, KeyOperation::Stored),
            other => panic!("unexpected frame {:?}", other),
        }

        let frame = decode_frame(&parts("REMOVEKEYVALUE", r#"{"id":1,"name":"a","key":"k"}"#)).unwrap();
        match frame {
            Frame::Event(Event::KeyValue(e)) => assert_eq!(e.operation, KeyOperation::Removed),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_cancel_and_unknown_tags() {
        assert_eq!(decode_frame(&[Bytes::from_static(b"CANCEL")]).unwrap(), Frame::Cancel);
        assert_eq!(
            decode_frame(&parts("PROGRESS", "{}")).unwrap(),
            Frame::Unknown("PROGRESS".into())
        );
        assert!(Event::cancel(3).encode().unwrap() == vec![Bytes::from_static(b"CANCEL")]);
    }

    #[test]
    fn test_malformed_frames() {
        assert!(decode_frame(&[]).is_err());
        assert!(decode_frame(&[Bytes::from_static(b"STATUS")]).is_err());
        assert!(decode_frame(&parts("PORT", "{not json")).is_err());
        assert!(decode_frame(&parts("KEYVALUE", r#"{"id":1,"name":"a","key":"k"}"#)).is_err());
    }
}
