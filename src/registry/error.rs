//! Registry error types
//!
//! Error types for application registry operations, each mapped to the
//! negative response value a client receives.

use crate::protocol::constants::{
    VALUE_ERROR, VALUE_KEY_ALREADY_EXISTS, VALUE_KEY_NOT_FOUND, VALUE_NOT_SUPPORTED, VALUE_NO_PORT,
    VALUE_UNDEFINED_APPLICATION,
};
use crate::protocol::Response;

/// Error type for registry operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// No application with this id
    UndefinedApplication(i32),
    /// No running application with this name
    UndefinedName(String),
    /// Key not present in the store of the application
    KeyNotFound(String),
    /// Key already present in the store of the application
    KeyAlreadyExists(String),
    /// Application already reached a terminal state
    Terminated(i32),
    /// Every port of the range is leased or unavailable
    NoPortAvailable,
    /// Port is not leased by the application
    PortNotLeased(u16),
    /// Operation this registry does not implement
    NotSupported(&'static str),
}

impl RegistryError {
    /// Response value sent to the client
    pub fn value(&self) -> i64 {
        match self {
            RegistryError::UndefinedApplication(_) | RegistryError::UndefinedName(_) => {
                VALUE_UNDEFINED_APPLICATION
            }
            RegistryError::KeyNotFound(_) => VALUE_KEY_NOT_FOUND,
            RegistryError::KeyAlreadyExists(_) => VALUE_KEY_ALREADY_EXISTS,
            RegistryError::NotSupported(_) => VALUE_NOT_SUPPORTED,
            RegistryError::NoPortAvailable => VALUE_NO_PORT,
            RegistryError::Terminated(_) | RegistryError::PortNotLeased(_) => VALUE_ERROR,
        }
    }

    /// Failed response carrying this error
    pub fn to_response(&self) -> Response {
        Response::error(self.value(), self.to_string())
    }
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::UndefinedApplication(id) => write!(f, "Undefined application: {}", id),
            RegistryError::UndefinedName(name) => write!(f, "Undefined application: {}", name),
            RegistryError::KeyNotFound(key) => write!(f, "Key not found: {}", key),
            RegistryError::KeyAlreadyExists(key) => write!(f, "Key already exists: {}", key),
            RegistryError::Terminated(id) => write!(f, "Application {} is terminated", id),
            RegistryError::NoPortAvailable => write!(f, "No port available"),
            RegistryError::PortNotLeased(port) => write!(f, "Port {} is not leased", port),
            RegistryError::NotSupported(operation) => write!(f, "Not supported: {}", operation),
        }
    }
}

impl std::error::Error for RegistryError {}
