//! A transport that holds responses until the test releases them.
//!
//! Each request is delivered to the inner transport right away, so the
//! server sees requests in arrival order, but its response is only
//! handed back once [`GatedTransport::release`] is called for it. Tests
//! use this to interleave concurrent saves and fetches deterministically.

use async_trait::async_trait;
use nimbus_client::{Request, Response, Transport, TransportError};
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};

/// Wraps a transport and gates every response.
#[derive(Debug)]
pub struct GatedTransport<T> {
    inner: T,
    gates: Mutex<Vec<Option<oneshot::Sender<()>>>>,
    arrived: Notify,
}

impl<T: Transport> GatedTransport<T> {
    /// Wraps `inner`.
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            gates: Mutex::new(Vec::new()),
            arrived: Notify::new(),
        }
    }

    /// The wrapped transport.
    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// Number of requests that have reached the gate.
    pub fn arrived(&self) -> usize {
        self.gates.lock().len()
    }

    /// Waits until at least `count` requests have reached the gate.
    pub async fn wait_for(&self, count: usize) {
        loop {
            let notified = self.arrived.notified();
            if self.arrived() >= count {
                return;
            }
            notified.await;
        }
    }

    /// Lets the response of the `index`-th request (zero based) through.
    ///
    /// Returns false if that request has not arrived or was already
    /// released.
    pub fn release(&self, index: usize) -> bool {
        let gate = self
            .gates
            .lock()
            .get_mut(index)
            .and_then(Option::take);
        gate.is_some_and(|gate| gate.send(()).is_ok())
    }
}

#[async_trait]
impl<T: Transport> Transport for GatedTransport<T> {
    async fn request(&self, request: Request) -> Result<Response, TransportError> {
        let result = self.inner.request(request).await;
        let (open, gate) = oneshot::channel();
        self.gates.lock().push(Some(open));
        self.arrived.notify_waiters();
        gate.await
            .map_err(|_| TransportError::new("gate dropped before release"))?;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::MemoryServer;
    use nimbus_client::Method;
    use std::sync::Arc;

    #[tokio::test]
    async fn holds_responses_until_released() {
        let gated = Arc::new(GatedTransport::new(MemoryServer::new()));
        let pending = tokio::spawn({
            let gated = gated.clone();
            async move {
                gated
                    .request(Request::new(Method::Get, "/classes/Game"))
                    .await
            }
        });

        gated.wait_for(1).await;
        assert_eq!(gated.inner().request_count(), 1);
        assert!(!pending.is_finished());
        assert!(gated.release(0));
        assert!(!gated.release(0));

        let response = pending.await.unwrap().unwrap();
        assert!(response.is_success());
    }
}
