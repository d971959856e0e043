use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use ahash::AHashMap;
use ps_core::frame::Api;
use serde_json::Value;

pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Subscriber for one `(api, method)` pair. Identity is the `Arc` pointer.
pub type Callback = Arc<dyn Fn(&Value) -> Result<(), CallbackError> + Send + Sync>;

/// Result of one dispatch.
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failures: Vec<CallbackError>,
}

impl DispatchReport {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Routes device broadcasts to subscribers of the exact `(api, method)`.
#[derive(Default)]
pub struct MessageRouter {
    subscriptions: RwLock<AHashMap<(Api, String), Vec<Callback>>>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the same callback was already subscribed.
    pub fn subscribe(&self, api: Api, method: impl Into<String>, callback: Callback) -> bool {
        let mut subscriptions = self.subscriptions.write().expect("router lock poisoned");
        let callbacks = subscriptions.entry((api, method.into())).or_default();
        if callbacks.iter().any(|existing| Arc::ptr_eq(existing, &callback)) {
            return false;
        }
        callbacks.push(callback);
        true
    }

    /// Returns false when the callback was not subscribed.
    pub fn unsubscribe(&self, api: &Api, method: &str, callback: &Callback) -> bool {
        let mut subscriptions = self.subscriptions.write().expect("router lock poisoned");
        let key = (api.clone(), method.to_string());
        let Some(callbacks) = subscriptions.get_mut(&key) else {
            return false;
        };
        let before = callbacks.len();
        callbacks.retain(|existing| !Arc::ptr_eq(existing, callback));
        let removed = callbacks.len() != before;
        if callbacks.is_empty() {
            subscriptions.remove(&key);
        }
        removed
    }

    pub fn has_subscribers(&self, api: &Api, method: &str) -> bool {
        self.subscriptions
            .read()
            .expect("router lock poisoned")
            .contains_key(&(api.clone(), method.to_string()))
    }

    /// Call every subscriber in registration order. Callbacks run without
    /// the router lock held, so they may subscribe or unsubscribe.
    pub fn dispatch(&self, api: &Api, method: &str, params: &Value) -> DispatchReport {
        let callbacks = self
            .subscriptions
            .read()
            .expect("router lock poisoned")
            .get(&(api.clone(), method.to_string()))
            .cloned()
            .unwrap_or_default();

        let mut report = DispatchReport::default();
        for callback in callbacks {
            match panic::catch_unwind(AssertUnwindSafe(|| callback(params))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(err)) => report.failures.push(err),
                Err(payload) => report.failures.push(panic_message(payload.as_ref()).into()),
            }
        }
        report
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown cause".to_string());
    format!("subscriber panicked: {detail}")
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pairs = self.subscriptions.read().map(|s| s.len()).unwrap_or_default();
        f.debug_struct("MessageRouter").field("subscriptions", &pairs).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, name: &'static str) -> Callback {
        let log = Arc::clone(log);
        Arc::new(move |params: &Value| {
            log.lock().unwrap().push(format!("{name}:{params}"));
            Ok(())
        })
    }

    #[test]
    fn delivers_in_registration_order() {
        let router = MessageRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        router.subscribe(Api::plugin("Network"), "request", recorder(&log, "a"));
        router.subscribe(Api::plugin("Network"), "request", recorder(&log, "b"));

        let report = router.dispatch(&Api::plugin("Network"), "request", &json!(1));
        assert_eq!(report.delivered, 2);
        assert_eq!(*log.lock().unwrap(), vec!["a:1", "b:1"]);
    }

    #[test]
    fn only_exact_pair_matches() {
        let router = MessageRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        router.subscribe(Api::plugin("Network"), "request", recorder(&log, "net"));
        router.subscribe(Api::Device, "request", recorder(&log, "device"));

        router.dispatch(&Api::plugin("Network"), "response", &Value::Null);
        router.dispatch(&Api::plugin("Logs"), "request", &Value::Null);
        assert!(log.lock().unwrap().is_empty());

        router.dispatch(&Api::Device, "request", &Value::Null);
        assert_eq!(*log.lock().unwrap(), vec!["device:null"]);
    }

    #[test]
    fn failing_callback_does_not_stop_others() {
        let router = MessageRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let failing: Callback = Arc::new(|_: &Value| Err("nope".into()));
        router.subscribe(Api::Device, "m", failing);
        router.subscribe(Api::Device, "m", recorder(&log, "after"));

        let report = router.dispatch(&Api::Device, "m", &json!({}));
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].to_string(), "nope");
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn panicking_callback_does_not_stop_others() {
        let router = MessageRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let panicking: Callback = Arc::new(|_: &Value| -> Result<(), CallbackError> { panic!("plugin bug") });
        router.subscribe(Api::plugin("Network"), "request", panicking);
        router.subscribe(Api::plugin("Network"), "request", recorder(&log, "after"));

        let report = router.dispatch(&Api::plugin("Network"), "request", &json!(7));
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].to_string(), "subscriber panicked: plugin bug");
        assert_eq!(*log.lock().unwrap(), vec!["after:7"]);

        // The router stays usable afterwards.
        assert_eq!(router.dispatch(&Api::plugin("Network"), "request", &json!(8)).delivered, 1);
    }

    #[test]
    fn duplicate_subscription_is_ignored_and_unsubscribe_by_identity() {
        let router = MessageRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let cb = recorder(&log, "x");
        let other = recorder(&log, "x");

        assert!(router.subscribe(Api::Device, "m", cb.clone()));
        assert!(!router.subscribe(Api::Device, "m", cb.clone()));
        router.dispatch(&Api::Device, "m", &Value::Null);
        assert_eq!(log.lock().unwrap().len(), 1);

        assert!(!router.unsubscribe(&Api::Device, "m", &other));
        assert!(router.unsubscribe(&Api::Device, "m", &cb));
        assert!(!router.has_subscribers(&Api::Device, "m"));
    }

    #[test]
    fn callback_may_unsubscribe_itself() {
        let router = Arc::new(MessageRouter::new());
        let slot: Arc<Mutex<Option<Callback>>> = Arc::new(Mutex::new(None));
        let cb: Callback = {
            let router = Arc::downgrade(&router);
            let slot = Arc::clone(&slot);
            Arc::new(move |_: &Value| {
                if let (Some(router), Some(me)) = (router.upgrade(), slot.lock().unwrap().clone()) {
                    router.unsubscribe(&Api::Device, "once", &me);
                }
                Ok(())
            })
        };
        *slot.lock().unwrap() = Some(cb.clone());
        router.subscribe(Api::Device, "once", cb);

        assert_eq!(router.dispatch(&Api::Device, "once", &Value::Null).delivered, 1);
        assert_eq!(router.dispatch(&Api::Device, "once", &Value::Null).delivered, 0);
    }
}
