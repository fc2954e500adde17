// Event Bus
// Publish/subscribe across the process boundary. The listener side keeps the
// registry and provides `BroadcastAPI.send`; the publisher side only holds a
// proxy to that method.

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::auto_update::ipc::{self, unknown_method, IpcTransport, RemoteProxy, RemoteService};
use crate::auto_update::UpdateError;

/// Service name the listener side provides
pub const BROADCAST_SERVICE: &str = "BroadcastAPI";

/// Future returned by a listener
pub type ListenerFuture = BoxFuture<'static, Result<(), UpdateError>>;

/// Callback invoked with the payload of each event it is subscribed to
pub type Listener = Arc<dyn Fn(Value) -> ListenerFuture + Send + Sync>;

/// Wrap an async closure into a [`Listener`]
pub fn listener<F, Fut>(f: F) -> Listener
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), UpdateError>> + Send + 'static,
{
    Arc::new(move |payload| f(payload).boxed())
}

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// One event crossing the boundary
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BroadcastEvent {
    #[serde(rename = "eventID")]
    pub event_id: String,
    pub payload: Value,
}

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<String, Vec<(ListenerId, Listener)>>>,
}

/// Listener-side registry, keyed by event id
///
/// Cloning is cheap; clones share the same registry.
#[derive(Clone, Default)]
pub struct BroadcastHub {
    registry: Arc<Registry>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` under `event_id`
    ///
    /// The same listener may be registered several times; each registration
    /// gets its own id and its own invocation per publish.
    pub fn subscribe(&self, event_id: &str, listener: Listener) -> ListenerId {
        let id = ListenerId(self.registry.next_id.fetch_add(1, Ordering::Relaxed));
        self.registry
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event_id.to_string())
            .or_default()
            .push((id, listener));
        id
    }

    /// Remove a registration; returns false (and does nothing) if it is absent
    pub fn unsubscribe(&self, event_id: &str, id: ListenerId) -> bool {
        let mut listeners = self
            .registry
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let Some(entries) = listeners.get_mut(event_id) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            listeners.remove(event_id);
        }
        removed
    }

    /// Number of registrations for `event_id`
    pub fn listener_count(&self, event_id: &str) -> usize {
        self.registry
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_id)
            .map_or(0, Vec::len)
    }

    /// Invoke every listener registered for `event_id`, one after another
    ///
    /// The listener set is snapshotted first: (un)subscribing during delivery
    /// only affects later publishes. The first failing listener stops delivery
    /// to the rest and its error is returned.
    pub async fn publish(&self, event_id: &str, payload: Value) -> Result<(), UpdateError> {
        let snapshot: Vec<Listener> = self
            .registry
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_id)
            .map(|entries| entries.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();

        for listener in snapshot {
            listener(payload.clone()).await.map_err(|e| {
                log::warn!("[Broadcast] Listener for '{}' failed: {}", event_id, e);
                match e {
                    UpdateError::Listener(msg) => UpdateError::Listener(msg),
                    other => UpdateError::Listener(format!("'{}': {}", event_id, other)),
                }
            })?;
        }

        Ok(())
    }

    /// Make this hub reachable as `BroadcastAPI` through `transport`
    pub fn provide(&self, transport: &dyn IpcTransport) {
        transport.provide(BROADCAST_SERVICE, Arc::new(BroadcastService { hub: self.clone() }));
    }
}

struct BroadcastService {
    hub: BroadcastHub,
}

#[async_trait]
impl RemoteService for BroadcastService {
    async fn call(&self, method: &str, args: Value) -> Result<Value, UpdateError> {
        match method {
            "send" => {
                let event: BroadcastEvent = serde_json::from_value(args).map_err(|e| {
                    UpdateError::Decode(format!("Malformed broadcast event: {}", e))
                })?;
                self.hub.publish(&event.event_id, event.payload).await?;
                Ok(Value::Null)
            }
            _ => Err(unknown_method(BROADCAST_SERVICE, method)),
        }
    }
}

/// Publisher side of the bus
#[derive(Clone)]
pub struct Broadcaster {
    proxy: RemoteProxy,
}

impl Broadcaster {
    /// Consume `BroadcastAPI` from `transport`
    pub fn connect(transport: Arc<dyn IpcTransport>) -> Self {
        Self {
            proxy: ipc::consume(transport, BROADCAST_SERVICE),
        }
    }

    /// Deliver `payload` to every listener of `event_id` on the other side
    ///
    /// Resolves once every listener has run. Sending to an event nobody
    /// listens to is a no-op.
    pub async fn send<P>(&self, event_id: &str, payload: &P) -> Result<(), UpdateError>
    where
        P: Serialize + ?Sized,
    {
        let payload = serde_json::to_value(payload).map_err(|e| {
            UpdateError::Transport(format!("Failed to encode '{}' payload: {}", event_id, e))
        })?;
        let event = BroadcastEvent {
            event_id: event_id.to_string(),
            payload,
        };
        let _: Value = self.proxy.call("send", &event).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auto_update::ipc::InProcessTransport;
    use serde_json::json;

    fn recording_listener(log: Arc<Mutex<Vec<String>>>, tag: &'static str) -> Listener {
        listener(move |payload: Value| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(format!("{}:{}", tag, payload));
                Ok(())
            }
        })
    }

    fn connected() -> (BroadcastHub, Broadcaster) {
        let transport = Arc::new(InProcessTransport::new());
        let hub = BroadcastHub::new();
        hub.provide(transport.as_ref());
        (hub, Broadcaster::connect(transport))
    }

    #[tokio::test]
    async fn test_publish_without_listeners_is_noop() {
        let hub = BroadcastHub::new();
        hub.publish("nobody", json!(1)).await.unwrap();
        assert_eq!(hub.listener_count("nobody"), 0);
    }

    #[tokio::test]
    async fn test_same_listener_twice_is_invoked_twice() {
        let hub = BroadcastHub::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = recording_listener(log.clone(), "a");

        hub.subscribe("evt", l.clone());
        hub.subscribe("evt", l);
        hub.publish("evt", json!("x")).await.unwrap();

        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let hub = BroadcastHub::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let id = hub.subscribe("evt", recording_listener(log.clone(), "a"));

        assert!(hub.unsubscribe("evt", id));
        assert!(!hub.unsubscribe("evt", id));
        assert!(!hub.unsubscribe("other", id));

        hub.publish("evt", json!(1)).await.unwrap();
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_events_are_isolated_by_id() {
        let hub = BroadcastHub::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        hub.subscribe("a", recording_listener(log.clone(), "a"));
        hub.subscribe("b", recording_listener(log.clone(), "b"));

        hub.publish("b", json!(2)).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["b:2".to_string()]);
    }

    #[tokio::test]
    async fn test_unsubscribe_mid_publish_keeps_scheduled_listener() {
        let hub = BroadcastHub::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let second_id = Arc::new(Mutex::new(None::<ListenerId>));

        let first = {
            let hub = hub.clone();
            let second_id = second_id.clone();
            listener(move |_| {
                let hub = hub.clone();
                let second_id = second_id.clone();
                async move {
                    if let Some(id) = *second_id.lock().unwrap() {
                        hub.unsubscribe("evt", id);
                    }
                    Ok(())
                }
            })
        };
        hub.subscribe("evt", first);
        let id = hub.subscribe("evt", recording_listener(log.clone(), "second"));
        *second_id.lock().unwrap() = Some(id);

        hub.publish("evt", json!(1)).await.unwrap();
        assert_eq!(log.lock().unwrap().len(), 1);

        hub.publish("evt", json!(2)).await.unwrap();
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failing_listener_stops_delivery() {
        let hub = BroadcastHub::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        hub.subscribe(
            "evt",
            listener(|_| async { Err::<(), _>(UpdateError::FileSystem("disk full".to_string())) }),
        );
        hub.subscribe("evt", recording_listener(log.clone(), "after"));

        let result = hub.publish("evt", json!(null)).await;
        assert!(matches!(result, Err(UpdateError::Listener(_))));
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_listeners_run_sequentially_in_registration_order() {
        let hub = BroadcastHub::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        {
            let log = log.clone();
            hub.subscribe(
                "evt",
                listener(move |_| {
                    let log = log.clone();
                    async move {
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        log.lock().unwrap().push("slow".to_string());
                        Ok(())
                    }
                }),
            );
        }
        hub.subscribe("evt", recording_listener(log.clone(), "fast"));

        hub.publish("evt", json!(0)).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["slow".to_string(), "fast:0".to_string()]);
    }

    #[tokio::test]
    async fn test_send_crosses_transport() {
        let (hub, broadcaster) = connected();
        let log = Arc::new(Mutex::new(Vec::new()));
        hub.subscribe("updater", recording_listener(log.clone(), "ui"));

        broadcaster
            .send("updater", &json!({ "event": "cleanup" }))
            .await
            .unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![r#"ui:{"event":"cleanup"}"#.to_string()]
        );
    }

    #[tokio::test]
    async fn test_send_without_provider_fails() {
        let transport = Arc::new(InProcessTransport::new());
        let broadcaster = Broadcaster::connect(transport);

        let result = broadcaster.send("updater", &json!(1)).await;
        assert!(matches!(result, Err(UpdateError::Transport(_))));
    }

    #[tokio::test]
    async fn test_broadcast_event_wire_shape() {
        let event = BroadcastEvent {
            event_id: "updater".to_string(),
            payload: json!({ "event": "apply" }),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["eventID"], "updater");
    }
}
