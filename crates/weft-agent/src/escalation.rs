use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tracing::{debug, info};

use weft_core::error::{Result, WeftError};
use weft_core::event::{AgentEvent, EventBus, EventKind};
use weft_core::human::{EscalationRequest, EscalationResponse};
use weft_core::traits::HumanChannel;

type Pending = DashMap<String, (EscalationRequest, oneshot::Sender<EscalationResponse>)>;

/// Routes escalations from execution loops to whoever answers them (a UI,
/// a chat bridge, a test). Each request is published as an
/// `EscalationRequested` event and parked until [`respond`](Self::respond)
/// is called with its id.
///
/// A waiting loop that is cancelled or times out drops its future; the
/// request is then withdrawn and an `EscalationResolved` event with no
/// response is published.
pub struct HumanBroker {
    pending: Arc<Pending>,
    event_bus: Arc<EventBus>,
}

impl HumanBroker {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            event_bus,
        }
    }

    /// Answer a pending request. Returns false if it is unknown or withdrawn.
    pub fn respond(&self, request_id: &str, response: EscalationResponse) -> bool {
        let Some((_, (request, tx))) = self.pending.remove(request_id) else {
            return false;
        };
        info!(request_id, agent_id = request.agent_id, "Escalation answered");
        self.event_bus.publish(AgentEvent::new(
            request.run_id.clone(),
            Some(request.agent_id),
            EventKind::EscalationResolved {
                request_id: request_id.to_string(),
                response: Some(response.clone()),
            },
        ));
        // The waiter may already be gone.
        let _ = tx.send(response);
        true
    }

    pub fn pending_requests(&self) -> Vec<EscalationRequest> {
        let mut requests: Vec<EscalationRequest> =
            self.pending.iter().map(|e| e.value().0.clone()).collect();
        requests.sort_by_key(|r| r.timestamp);
        requests
    }

    /// Find a pending request by prefix match on the id.
    pub fn find_by_prefix(&self, prefix: &str) -> Option<String> {
        self.pending
            .iter()
            .map(|e| e.key().clone())
            .find(|key| key.starts_with(prefix))
    }
}

/// Withdraws the request unless it was answered.
struct Withdraw {
    pending: Arc<Pending>,
    event_bus: Arc<EventBus>,
    request_id: String,
}

impl Drop for Withdraw {
    fn drop(&mut self) {
        if let Some((_, (request, _))) = self.pending.remove(&self.request_id) {
            debug!(request_id = %self.request_id, "Escalation withdrawn");
            self.event_bus.publish(AgentEvent::new(
                request.run_id,
                Some(request.agent_id),
                EventKind::EscalationResolved {
                    request_id: self.request_id.clone(),
                    response: None,
                },
            ));
        }
    }
}

impl HumanChannel for HumanBroker {
    fn escalate(&self, request: EscalationRequest) -> BoxFuture<'_, Result<EscalationResponse>> {
        Box::pin(async move {
            let (tx, rx) = oneshot::channel();
            let id = request.id.clone();
            let event = AgentEvent::new(
                request.run_id.clone(),
                Some(request.agent_id),
                EventKind::EscalationRequested {
                    request: request.clone(),
                },
            );
            // Registered before publishing so an immediate answer finds it.
            self.pending.insert(id.clone(), (request, tx));
            let _guard = Withdraw {
                pending: self.pending.clone(),
                event_bus: self.event_bus.clone(),
                request_id: id.clone(),
            };
            self.event_bus.publish(event);

            rx.await
                .map_err(|_| WeftError::EscalationClosed(format!("request {} was dropped", id)))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use weft_core::human::EscalationKind;
    use weft_core::RunId;

    use super::*;

    fn request(id: &str) -> EscalationRequest {
        EscalationRequest {
            id: id.to_string(),
            run_id: RunId::new(),
            agent_id: 4,
            kind: EscalationKind::Confirm,
            prompt: "Submit the order?".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn respond_resolves_waiter() {
        let bus = Arc::new(EventBus::default());
        let mut events = bus.subscribe();
        let broker = Arc::new(HumanBroker::new(bus));

        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.escalate(request("req-1")).await })
        };
        let requested = events.recv().await.unwrap();
        assert_eq!(requested.type_name(), "escalation_requested");
        assert_eq!(broker.find_by_prefix("req").as_deref(), Some("req-1"));

        assert!(broker.respond("req-1", EscalationResponse::Confirmed(true)));
        assert_eq!(
            waiter.await.unwrap().unwrap(),
            EscalationResponse::Confirmed(true)
        );
        assert!(!broker.respond("req-1", EscalationResponse::Confirmed(false)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn answer_sent_straight_from_the_event_is_never_lost() {
        let bus = Arc::new(EventBus::new(1024));
        let broker = Arc::new(HumanBroker::new(bus.clone()));
        let mut events = bus.subscribe();

        let responder = {
            let broker = broker.clone();
            tokio::spawn(async move {
                let mut answered = 0;
                while answered < 200 {
                    match events.recv().await {
                        Ok(event) => {
                            if let EventKind::EscalationRequested { request } = event.kind {
                                assert!(broker.respond(&request.id, EscalationResponse::Confirmed(true)));
                                answered += 1;
                            }
                        }
                        Err(e) => panic!("event stream failed: {}", e),
                    }
                }
            })
        };

        for n in 0..200 {
            let answer = tokio::time::timeout(
                Duration::from_secs(5),
                broker.escalate(request(&format!("req-{}", n))),
            )
            .await
            .expect("answer arrives")
            .unwrap();
            assert_eq!(answer, EscalationResponse::Confirmed(true));
        }
        responder.await.unwrap();
        assert!(broker.pending_requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_waiter_withdraws_request() {
        let bus = Arc::new(EventBus::default());
        let mut events = bus.subscribe();
        let broker = HumanBroker::new(bus);

        let outcome =
            tokio::time::timeout(Duration::from_secs(1), broker.escalate(request("req-2"))).await;
        assert!(outcome.is_err());
        assert!(broker.pending_requests().is_empty());

        let _requested = events.recv().await.unwrap();
        let withdrawn = events.recv().await.unwrap();
        match withdrawn.kind {
            EventKind::EscalationResolved {
                request_id,
                response,
            } => {
                assert_eq!(request_id, "req-2");
                assert!(response.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!broker.respond("req-2", EscalationResponse::Confirmed(true)));
    }
}
