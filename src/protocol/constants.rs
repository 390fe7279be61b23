//! Protocol constants
//!
//! Tags of the registry push stream, key-value namespaces of the discovery
//! records, and framing limits.

/// Push stream tag of status events
pub const TAG_STATUS: &str = "STATUS";

/// Push stream tag of result events
pub const TAG_RESULT: &str = "RESULT";

/// Push stream tag of key-value events
pub const TAG_KEYVALUE: &str = "KEYVALUE";

/// Legacy push stream tag of key stored events
pub const TAG_STORE_KEYVALUE: &str = "STOREKEYVALUE";

/// Legacy push stream tag of key removed events
pub const TAG_REMOVE_KEYVALUE: &str = "REMOVEKEYVALUE";

/// Push stream tag of named port events
pub const TAG_PORT: &str = "PORT";

/// Push stream tag of publisher-ready events
pub const TAG_PUBLISHER: &str = "PUBLISHER";

/// Tag ending an event stream (or unblocking a subscriber)
pub const TAG_CANCEL: &str = "CANCEL";

/// Namespace of responder registration records
pub const RESPONDER_KEY: &str = "responder-676e576d-6102-42d8-ae24-222a7000dfa0";

/// Namespace of publisher registration records
pub const PUBLISHER_KEY: &str = "publisher-55845880-56e9-4ad6-bea1-e84395c90b32";

/// Prefix of the responder a publisher uses to count its subscribers
pub const PUBLISHER_RESPONDER_PREFIX: &str = "publisher:";

/// Default maximum size of one frame part (64MB)
pub const DEFAULT_MAX_PART_SIZE: usize = 64 * 1024 * 1024;

/// Maximum number of parts in one multipart message
pub const MAX_PARTS: u32 = 64;

/// Registry response value: success
pub const VALUE_OK: i64 = 0;

/// Registry response value: generic failure
pub const VALUE_ERROR: i64 = -1;

/// Registry response value: unknown application id or name
pub const VALUE_UNDEFINED_APPLICATION: i64 = -2;

/// Registry response value: key not found
pub const VALUE_KEY_NOT_FOUND: i64 = -3;

/// Registry response value: key already stored
pub const VALUE_KEY_ALREADY_EXISTS: i64 = -4;

/// Registry response value: operation not supported by this registry
pub const VALUE_NOT_SUPPORTED: i64 = -5;

/// Registry response value: no port left in the pool
pub const VALUE_NO_PORT: i64 = -6;

/// Build the key of a discovery record from a namespace and a name
pub fn record_key(namespace: &str, name: &str) -> String {
    format!("{}-{}", namespace, name)
}

/// Build a routing identity from a key and an application id
pub fn string_id(key: &str, id: i32) -> String {
    format!("{}:{}", key, id)
}

/// Split a routing identity back into its key and application id
///
/// Keys may contain `:` themselves, the id is after the last one.
pub fn parse_string_id(identity: &str) -> Option<(&str, i32)> {
    let (key, id) = identity.rsplit_once(':')?;
    Some((key, id.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_string_id() {
        let key = record_key(RESPONDER_KEY, "echo");
        let identity = string_id(&key, 12);
        assert_eq!(parse_string_id(&identity), Some((key.as_str(), 12)));

        let key = record_key(RESPONDER_KEY, &format!("{}values", PUBLISHER_RESPONDER_PREFIX));
        let identity = string_id(&key, 3);
        assert_eq!(parse_string_id(&identity), Some((key.as_str(), 3)));

        assert_eq!(parse_string_id("no-id"), None);
        assert_eq!(parse_string_id("key:x"), None);
    }
}
