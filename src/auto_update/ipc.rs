// Request/Response Transport
// Named services provided on one side of the process boundary and consumed
// through proxies on the other. Arguments and results cross as JSON values.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::auto_update::UpdateError;

/// Implementation of a named service, reachable from the other side of the boundary
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Handle one call of `method` with JSON `args`
    async fn call(&self, method: &str, args: Value) -> Result<Value, UpdateError>;
}

/// Cross-boundary request/response primitive
#[async_trait]
pub trait IpcTransport: Send + Sync {
    /// Register `service` under `name`, replacing any earlier provider
    fn provide(&self, name: &str, service: Arc<dyn RemoteService>);

    /// Perform one round trip to the service registered under `name`
    async fn request(&self, name: &str, method: &str, args: Value) -> Result<Value, UpdateError>;
}

/// Callable handle to a service on the other side of the transport
///
/// The provider is looked up on every call, so a proxy can be created before
/// the other side has provided its service.
#[derive(Clone)]
pub struct RemoteProxy {
    name: String,
    transport: Arc<dyn IpcTransport>,
}

impl RemoteProxy {
    /// Name of the consumed service
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Call `method` with serializable `args` and decode the reply
    pub async fn call<A, R>(&self, method: &str, args: &A) -> Result<R, UpdateError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let args = serde_json::to_value(args).map_err(|e| {
            UpdateError::Transport(format!(
                "Failed to encode arguments for {}.{}: {}",
                self.name, method, e
            ))
        })?;

        let reply = self.transport.request(&self.name, method, args).await?;

        serde_json::from_value(reply).map_err(|e| {
            UpdateError::Decode(format!(
                "Unexpected reply from {}.{}: {}",
                self.name, method, e
            ))
        })
    }
}

/// Returns a proxy whose calls go through `transport` to the service `name`
pub fn consume(transport: Arc<dyn IpcTransport>, name: &str) -> RemoteProxy {
    RemoteProxy {
        name: name.to_string(),
        transport,
    }
}

/// Transport whose two sides live in the same process
#[derive(Default)]
pub struct InProcessTransport {
    services: RwLock<HashMap<String, Arc<dyn RemoteService>>>,
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a provider is registered under `name`
    pub fn is_provided(&self, name: &str) -> bool {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }
}

#[async_trait]
impl IpcTransport for InProcessTransport {
    fn provide(&self, name: &str, service: Arc<dyn RemoteService>) {
        log::debug!("[IPC] Providing service {}", name);
        self.services
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), service);
    }

    async fn request(&self, name: &str, method: &str, args: Value) -> Result<Value, UpdateError> {
        // Never hold the lock across the call: services may provide/consume themselves
        let service = self
            .services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| UpdateError::Transport(format!("No provider registered for {}", name)))?;

        service.call(method, args).await
    }
}

/// Error for a method a service does not implement
pub fn unknown_method(service: &str, method: &str) -> UpdateError {
    UpdateError::Transport(format!("{} has no method {}", service, method))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoService;

    #[async_trait]
    impl RemoteService for EchoService {
        async fn call(&self, method: &str, args: Value) -> Result<Value, UpdateError> {
            match method {
                "echo" => Ok(args),
                "fail" => Err(UpdateError::Network("remote failure".to_string())),
                _ => Err(unknown_method("Echo", method)),
            }
        }
    }

    fn transport_with_echo() -> Arc<InProcessTransport> {
        let transport = Arc::new(InProcessTransport::new());
        transport.provide("Echo", Arc::new(EchoService));
        transport
    }

    #[tokio::test]
    async fn test_round_trip_call() {
        let transport = transport_with_echo();
        let proxy = consume(transport, "Echo");

        let reply: Value = proxy.call("echo", &json!({ "a": 1 })).await.unwrap();
        assert_eq!(reply, json!({ "a": 1 }));
        assert_eq!(proxy.name(), "Echo");
    }

    #[tokio::test]
    async fn test_remote_error_propagates_unchanged() {
        let proxy = consume(transport_with_echo(), "Echo");

        let result: Result<Value, _> = proxy.call("fail", &()).await;
        assert_eq!(result, Err(UpdateError::Network("remote failure".to_string())));
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let proxy = consume(transport_with_echo(), "Echo");

        let result: Result<Value, _> = proxy.call("nope", &()).await;
        assert!(matches!(result, Err(UpdateError::Transport(_))));
    }

    #[tokio::test]
    async fn test_missing_provider() {
        let transport = Arc::new(InProcessTransport::new());
        let proxy = consume(transport.clone(), "Nobody");

        let result: Result<Value, _> = proxy.call("anything", &()).await;
        assert!(matches!(result, Err(UpdateError::Transport(_))));
        assert!(!transport.is_provided("Nobody"));
    }

    #[tokio::test]
    async fn test_proxy_created_before_provider() {
        let transport = Arc::new(InProcessTransport::new());
        let proxy = consume(transport.clone(), "Echo");
        transport.provide("Echo", Arc::new(EchoService));

        let reply: u32 = proxy.call("echo", &5u32).await.unwrap();
        assert_eq!(reply, 5);
    }

    #[tokio::test]
    async fn test_reply_decode_failure() {
        let proxy = consume(transport_with_echo(), "Echo");

        let result: Result<u32, _> = proxy.call("echo", "not a number").await;
        assert!(matches!(result, Err(UpdateError::Decode(_))));
    }
}
