use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    NotRunning,
    BufferFull,
    SerdeJsonError,
    ConnectFailed,
    CreateChannelFailed,
    PrefetchFailed,
    AssertQueueFailed,
    ConsumeFailed,
    PublishFailed,
    AckFailed,
    ChannelClosed,
    SchemaCompileFailed,
    #[serde(untagged)]
    Unknown(String),
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, PartialEq, Eq)]
pub struct Error {
    pub kind: ErrorKind,
    pub msg: String,
}

impl Error {
    #[must_use]
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    #[must_use]
    pub fn kind(kind: ErrorKind) -> Self {
        Self {
            kind,
            msg: String::default(),
        }
    }
}

impl std::error::Error for Error {}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::kind(kind)
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self {
            kind: ErrorKind::SerdeJsonError,
            msg: value.to_string(),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.msg.is_empty() {
            write!(f, "{:?}", self.kind)
        } else {
            write!(f, "{:?}: {}", self.kind, self.msg)
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind() {
        let error: Error = ErrorKind::NotRunning.into();
        assert_eq!(error.to_string(), "NotRunning");

        let error = Error::new(ErrorKind::ConnectFailed, "connection refused");
        assert_eq!(error.to_string(), "ConnectFailed: connection refused");

        let error: Error = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert_eq!(error.kind, ErrorKind::SerdeJsonError);
    }

    #[test]
    fn test_unknown_kind() {
        let json = serde_json::json!({
            "kind": "BrokerOnFire",
            "msg": "it is hot",
        });
        let err = serde_json::from_value::<Error>(json).unwrap();
        assert_eq!(err.kind, ErrorKind::Unknown("BrokerOnFire".to_string()));
        assert_eq!(err.msg, "it is hot");
    }
}
