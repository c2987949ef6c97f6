use foldhash::fast::RandomState;
use futures_util::{FutureExt, future::BoxFuture};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::{collections::HashMap, future::Future, sync::Arc};

use crate::{Outcome, ParamsValidator, rpc_error::RpcError, rpc_error::Violation};

/// A bound handler: takes the raw params and yields the call outcome.
pub type Method = Arc<dyn Fn(Value) -> BoxFuture<'static, Outcome> + Send + Sync>;

/// Failure reported by a handler. Becomes an `InternalError` response
/// carrying `message` and `stack`.
///
/// Any [`std::error::Error`] converts into it, so handlers can use `?`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    pub message: String,
    pub stack: Option<String>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    #[must_use]
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl<E: std::error::Error> From<E> for HandlerError {
    fn from(err: E) -> Self {
        let mut chain = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push(format!("caused by: {cause}"));
            source = cause.source();
        }
        Self {
            message: err.to_string(),
            stack: (!chain.is_empty()).then(|| chain.join("\n")),
        }
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Method bindings of a server: at most one handler and one validator per
/// method name. Rebinding replaces.
#[derive(Default)]
pub struct Router {
    methods: HashMap<String, Method, RandomState>,
    validators: HashMap<String, Arc<dyn ParamsValidator>, RandomState>,
}

impl Router {
    /// Binds `handler` to `method`. Params are deserialized into `P`; a
    /// mismatch is reported as `InvalidParams`. Returns whether `method` is
    /// bound afterwards.
    pub fn bind<F, Fut, P, R>(&mut self, method: impl Into<String>, handler: F) -> bool
    where
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, HandlerError>> + Send + 'static,
        P: DeserializeOwned + Send + 'static,
        R: Serialize + 'static,
    {
        let method = method.into();
        let name: Arc<str> = Arc::from(method.as_str());
        let func: Method = Arc::new(move |params: Value| {
            let name = name.clone();
            let params = match serde_json::from_value::<P>(params) {
                Ok(params) => params,
                Err(err) => {
                    let violations = vec![Violation::new("", err.to_string())];
                    return futures_util::future::ready(Err(RpcError::InvalidParams {
                        method: name.to_string(),
                        violations,
                    }))
                    .boxed();
                }
            };
            let fut = handler(params);
            async move {
                match fut.await {
                    Ok(result) => serde_json::to_value(result).map_err(|err| {
                        RpcError::InternalError {
                            method: name.to_string(),
                            message: format!("result is not serializable: {err}"),
                            stack: None,
                        }
                    }),
                    Err(err) => Err(RpcError::InternalError {
                        method: name.to_string(),
                        message: err.message,
                        stack: err.stack,
                    }),
                }
            }
            .boxed()
        });
        self.methods.insert(method.clone(), func);
        self.methods.contains_key(&method)
    }

    /// Removes the handler of `method`. Its validator stays bound.
    pub fn unbind(&mut self, method: &str) -> bool {
        self.methods.remove(method).is_some()
    }

    /// Attaches a params validator to `method`, replacing any previous one.
    /// Returns whether `method` has a validator afterwards.
    pub fn bind_validator(
        &mut self,
        method: impl Into<String>,
        validator: Arc<dyn ParamsValidator>,
    ) -> bool {
        let method = method.into();
        self.validators.insert(method.clone(), validator);
        self.validators.contains_key(&method)
    }

    pub fn unbind_schema(&mut self, method: &str) -> bool {
        self.validators.remove(method).is_some()
    }

    #[must_use]
    pub fn has_method(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    pub fn method_names(&self) -> impl Iterator<Item = &String> {
        self.methods.keys()
    }

    /// Looks up the handler of `method` and validates `params` against its
    /// validator, if one is bound.
    ///
    /// # Errors
    ///
    /// `MethodNotFound` for an unbound method, `InvalidParams` for rejected
    /// params.
    pub fn prepare(&self, method: &str, params: &Value) -> std::result::Result<Method, RpcError> {
        let Some(func) = self.methods.get(method) else {
            return Err(RpcError::MethodNotFound {
                method: method.to_string(),
            });
        };
        if let Some(validator) = self.validators.get(method) {
            validator
                .validate(params)
                .map_err(|violations| RpcError::InvalidParams {
                    method: method.to_string(),
                    violations,
                })?;
        }
        Ok(func.clone())
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("methods", &self.methods.keys())
            .field("validators", &self.validators.keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JsonSchemaValidator;
    use serde_json::json;

    #[derive(Debug)]
    struct Overflow;

    impl std::fmt::Display for Overflow {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("overflow")
        }
    }

    impl std::error::Error for Overflow {}

    fn router() -> Router {
        let mut router = Router::default();
        router.bind("echo", |params: Value| async move { Ok(params) });
        router.bind("double", |n: u64| async move {
            n.checked_mul(2).ok_or(Overflow).map_err(HandlerError::from)
        });
        router
    }

    #[tokio::test]
    async fn test_dispatch() {
        let router = router();
        let echo = router.prepare("echo", &json!(7)).unwrap();
        assert_eq!(echo(json!(7)).await, Ok(json!(7)));

        let double = router.prepare("double", &json!(4)).unwrap();
        assert_eq!(double(json!(4)).await, Ok(json!(8)));
        assert_eq!(
            double(json!(u64::MAX)).await,
            Err(RpcError::InternalError {
                method: "double".into(),
                message: "overflow".into(),
                stack: None,
            })
        );
        let err = double(json!("four")).await.unwrap_err();
        assert!(matches!(err, RpcError::InvalidParams { ref method, .. } if method == "double"));
    }

    #[tokio::test]
    async fn test_prepare_errors() {
        let mut router = router();
        let err = router.prepare("nope", &Value::Null).err().unwrap();
        assert_eq!(
            err,
            RpcError::MethodNotFound {
                method: "nope".into()
            }
        );

        let validator = JsonSchemaValidator::compile(&json!({"type": "number"})).unwrap();
        assert!(router.bind_validator("echo", Arc::new(validator)));
        let err = router.prepare("echo", &json!("a")).err().unwrap();
        assert_eq!(err.code(), crate::rpc_error::INVALID_PARAMS);
        assert!(router.prepare("echo", &json!(1)).is_ok());

        assert!(router.unbind_schema("echo"));
        assert!(router.prepare("echo", &json!("a")).is_ok());
        assert!(router.unbind("echo"));
        assert!(!router.has_method("echo"));
        assert_eq!(router.method_names().collect::<Vec<_>>(), ["double"]);
    }

    #[tokio::test]
    async fn test_bind_reports_binding() {
        let mut router = Router::default();
        assert!(router.bind("echo", |params: Value| async move { Ok(params) }));
        assert!(router.has_method("echo"));
        assert!(router.bind("echo", |_: Value| async move { Ok("other") }));
        let echo = router.prepare("echo", &json!(1)).unwrap();
        assert_eq!(echo(json!(1)).await, Ok(json!("other")));
        assert_eq!(router.method_names().count(), 1);
    }

    #[test]
    fn test_handler_error_from_source_chain() {
        let err = HandlerError::from(std::io::Error::other(Overflow));
        assert_eq!(err.message, "overflow");
        assert_eq!(
            HandlerError::new("boom").with_stack("at main").stack.as_deref(),
            Some("at main")
        );
    }
}
