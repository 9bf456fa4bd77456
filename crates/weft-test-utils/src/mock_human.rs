use std::collections::VecDeque;
use std::sync::Mutex;

use futures::future::BoxFuture;

use weft_core::error::Result;
use weft_core::human::{EscalationRequest, EscalationResponse};
use weft_core::traits::HumanChannel;

/// Scripted human operator. Once the script runs out it never answers.
#[derive(Default)]
pub struct MockHuman {
    responses: Mutex<VecDeque<EscalationResponse>>,
    requests: Mutex<Vec<EscalationRequest>>,
}

impl MockHuman {
    pub fn with_responses(responses: Vec<EscalationResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// An operator who never responds.
    pub fn absent() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<EscalationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl HumanChannel for MockHuman {
    fn escalate(&self, request: EscalationRequest) -> BoxFuture<'_, Result<EscalationResponse>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(request);
            let next = self.responses.lock().unwrap().pop_front();
            match next {
                Some(response) => Ok(response),
                None => futures::future::pending().await,
            }
        })
    }
}
