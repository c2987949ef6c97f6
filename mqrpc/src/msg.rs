use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    Payload, Result,
    rpc_error::{ErrorBody, RpcError},
};

/// Transport-level message properties.
///
/// The correlation identifier and the reply destination travel here rather
/// than in the body, so brokers and tooling can read them without decoding
/// the envelope.
#[derive(Deserialize, Serialize, Debug, Default, PartialEq, Eq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct MsgMeta {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

impl MsgMeta {
    #[must_use]
    pub fn request(correlation_id: impl Into<String>, reply_to: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            reply_to: Some(reply_to.into()),
        }
    }

    #[must_use]
    pub fn response(correlation_id: Option<String>) -> Self {
        Self {
            correlation_id,
            reply_to: None,
        }
    }
}

/// An outbound message waiting to be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Queue the message is routed to.
    pub destination: String,
    pub meta: MsgMeta,
    pub payload: Payload,
}

impl Message {
    pub fn new(destination: impl Into<String>, meta: MsgMeta, payload: Payload) -> Self {
        Self {
            destination: destination.into(),
            meta,
            payload,
        }
    }
}

/// Request envelope, the body of a call message.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(
        default,
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub call_date: Option<SystemTime>,
}

impl Request {
    #[must_use]
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
            call_date: Some(SystemTime::now()),
        }
    }

    /// # Errors
    pub fn parse(payload: &Payload) -> Result<Self> {
        payload.decode()
    }

    /// # Errors
    pub fn to_payload(&self) -> Result<Payload> {
        Payload::json(self)
    }
}

/// Response envelope: exactly one of `result` or `error`.
///
/// A body carrying neither member decodes as a `null` result, and `error`
/// wins if both are present.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "lowercase", from = "RawResponse")]
pub enum Response {
    Result(Value),
    Error(ErrorBody),
}

#[derive(Deserialize)]
struct RawResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ErrorBody>,
}

impl From<RawResponse> for Response {
    fn from(raw: RawResponse) -> Self {
        match raw.error {
            Some(error) => Response::Error(error),
            None => Response::Result(raw.result.unwrap_or(Value::Null)),
        }
    }
}

impl Response {
    #[must_use]
    pub fn from_outcome(outcome: std::result::Result<Value, RpcError>) -> Self {
        match outcome {
            Ok(result) => Response::Result(result),
            Err(err) => Response::Error(err.to_body()),
        }
    }

    /// # Errors
    ///
    /// Returns the remote failure as an [`RpcError`].
    pub fn into_outcome(self) -> std::result::Result<Value, RpcError> {
        match self {
            Response::Result(result) => Ok(result),
            Response::Error(body) => Err(RpcError::from_body(body)),
        }
    }

    /// # Errors
    pub fn parse(payload: &Payload) -> Result<Self> {
        payload.decode()
    }

    /// # Errors
    pub fn to_payload(&self) -> Result<Payload> {
        Payload::json(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let req = Request::new("fibonacci", json!(5));
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["method"], "fibonacci");
        assert_eq!(value["params"], 5);
        assert!(value["callDate"].is_string());

        let parsed = Request::parse(&req.to_payload().unwrap()).unwrap();
        assert_eq!(parsed.method, "fibonacci");
        assert_eq!(parsed.params, json!(5));
    }

    #[test]
    fn test_request_tolerates_foreign_dates() {
        let payload =
            Payload::from(r#"{"method":"echo","params":[1],"callDate":"2019-04-01T10:20:30.123Z"}"#);
        let req = Request::parse(&payload).unwrap();
        assert!(req.call_date.is_some());

        let req = Request::parse(&Payload::from(r#"{"method":"echo"}"#)).unwrap();
        assert_eq!(req.params, Value::Null);
        assert_eq!(req.call_date, None);
    }

    #[test]
    fn test_response_shapes() {
        let rsp = Response::from_outcome(Ok(json!(8)));
        assert_eq!(serde_json::to_value(&rsp).unwrap(), json!({"result": 8}));

        let rsp = Response::from_outcome(Err(RpcError::MethodNotFound {
            method: "nope".into(),
        }));
        assert_eq!(
            serde_json::to_value(&rsp).unwrap(),
            json!({"error": {"code": -32601, "method": "nope", "message": "Method not found"}})
        );

        let rsp = Response::parse(&Payload::from("{}")).unwrap();
        assert_eq!(rsp, Response::Result(Value::Null));

        let rsp = Response::parse(&Payload::from(
            r#"{"error":{"code":-32603,"method":"m","message":"boom","stack":"s"}}"#,
        ))
        .unwrap();
        assert_eq!(
            rsp.into_outcome(),
            Err(RpcError::InternalError {
                method: "m".into(),
                message: "boom".into(),
                stack: Some("s".into()),
            })
        );
    }
}
