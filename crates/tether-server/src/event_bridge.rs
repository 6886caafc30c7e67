use std::sync::Arc;

use dashmap::DashMap;
use tether_core::events::EventEnvelope;
use tether_core::ids::SubscriberId;
use tether_engine::{SessionOrchestrator, Subscription};

use crate::client::{ClientId, ClientRegistry};

struct Forward {
    client_id: ClientId,
    task: tokio::task::JoinHandle<()>,
}

/// Pumps broadcaster subscriptions into WebSocket client queues.
///
/// Every subscription belongs to the client that opened it; it ends when the
/// client unsubscribes, the client goes away, or the broadcaster closes it.
pub struct EventBridge {
    registry: Arc<ClientRegistry>,
    orchestrator: Arc<dyn SessionOrchestrator>,
    forwards: Arc<DashMap<SubscriberId, Forward>>,
}

impl EventBridge {
    pub fn new(registry: Arc<ClientRegistry>, orchestrator: Arc<dyn SessionOrchestrator>) -> Self {
        Self {
            registry,
            orchestrator,
            forwards: Arc::new(DashMap::new()),
        }
    }

    /// Start forwarding `subscription` to `client_id`.
    pub fn attach(&self, client_id: &ClientId, mut subscription: Subscription) -> SubscriberId {
        let sub_id = subscription.id.clone();
        let registry = Arc::clone(&self.registry);
        let forwards = Arc::clone(&self.forwards);
        let cid = client_id.clone();
        let task_sub_id = sub_id.clone();

        // Hold the map entry while spawning so a fast-finishing task cannot
        // remove itself before it is inserted.
        let entry = self.forwards.entry(sub_id.clone());
        let task = tokio::spawn(async move {
            while let Some(envelope) = subscription.recv().await {
                let Some(json) = serialize_envelope(&envelope) else {
                    continue;
                };
                if !registry.send_to(&cid, json) && registry.get(&cid).is_none() {
                    break;
                }
            }
            tracing::debug!(client_id = %cid, subscription_id = %task_sub_id, "Event forward ended");
            forwards.remove(&task_sub_id);
        });
        entry.insert(Forward {
            client_id: client_id.clone(),
            task,
        });
        sub_id
    }

    /// Stop one subscription. Only the client that opened it may stop it.
    pub fn detach(&self, client_id: &ClientId, sub_id: &SubscriberId) -> bool {
        let Some((_, forward)) = self
            .forwards
            .remove_if(sub_id, |_, f| &f.client_id == client_id)
        else {
            return false;
        };
        self.orchestrator.unsubscribe(sub_id);
        forward.task.abort();
        true
    }

    /// Stop every subscription of a client. Returns how many were stopped.
    pub fn detach_client(&self, client_id: &ClientId) -> usize {
        let ids: Vec<SubscriberId> = self
            .forwards
            .iter()
            .filter(|f| &f.client_id == client_id)
            .map(|f| f.key().clone())
            .collect();
        ids.iter().filter(|id| self.detach(client_id, id)).count()
    }

    pub fn subscriptions_for(&self, client_id: &ClientId) -> usize {
        self.forwards
            .iter()
            .filter(|f| &f.client_id == client_id)
            .count()
    }

    pub fn active_count(&self) -> usize {
        self.forwards.len()
    }
}

/// Serialize an envelope to its wire text.
pub fn serialize_envelope(envelope: &EventEnvelope) -> Option<String> {
    serde_json::to_string(envelope).ok()
}
