use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Body of a transport message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Payload {
    #[default]
    Empty,
    Normal(Bytes),
}

impl Payload {
    /// Serializes `value` as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::SerdeJsonError`](crate::ErrorKind::SerdeJsonError)
    /// if serialization fails.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Payload::Normal(serde_json::to_vec(value)?.into()))
    }

    /// Deserializes the body as JSON. An empty body reads as `null`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::SerdeJsonError`](crate::ErrorKind::SerdeJsonError)
    /// if the body is not valid JSON for `T`.
    pub fn decode<T: for<'c> Deserialize<'c>>(&self) -> Result<T> {
        if self.is_empty() {
            Ok(serde_json::from_value(serde_json::Value::Null)?)
        } else {
            Ok(serde_json::from_slice(self.as_slice())?)
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Payload::Empty => 0,
            Payload::Normal(bytes) => bytes.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Payload::Empty => true,
            Payload::Normal(bytes) => bytes.is_empty(),
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Payload::Empty => &[],
            Payload::Normal(bytes) => bytes,
        }
    }
}

impl std::ops::Deref for Payload {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl From<Bytes> for Payload {
    fn from(value: Bytes) -> Self {
        Payload::Normal(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload::Normal(value.into())
    }
}

impl From<&'static str> for Payload {
    fn from(value: &'static str) -> Self {
        Payload::Normal(Bytes::from_static(value.as_bytes()))
    }
}

impl From<Payload> for Bytes {
    fn from(value: Payload) -> Self {
        match value {
            Payload::Empty => Bytes::new(),
            Payload::Normal(bytes) => bytes,
        }
    }
}
