//! In-memory test doubles for the transport and HTTP seams.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::http_client::{Bytes, HttpClient, HttpError, Request, Response};
use crate::telemetry::{Envelope, TelemetryChannel};

/// A telemetry channel that stores envelopes in memory for assertions.
#[derive(Clone, Debug, Default)]
pub struct InMemoryChannel {
    envelopes: Arc<Mutex<Vec<Envelope>>>,
}

impl InMemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every envelope sent so far.
    pub fn envelopes(&self) -> Vec<Envelope> {
        self.envelopes.lock().expect("channel poisoned").clone()
    }

    /// Clears the stored envelopes.
    pub fn reset(&self) {
        self.envelopes.lock().expect("channel poisoned").clear();
    }
}

impl TelemetryChannel for InMemoryChannel {
    fn send(&self, envelope: Envelope) {
        self.envelopes.lock().expect("channel poisoned").push(envelope);
    }
}

/// An [`HttpClient`] that answers every request with a fixed status and
/// body. Handy as a profile endpoint stand-in.
#[derive(Debug)]
pub struct StaticProfileClient {
    status: u16,
    body: String,
}

impl StaticProfileClient {
    pub fn new(status: u16, body: &str) -> Self {
        StaticProfileClient {
            status,
            body: body.to_string(),
        }
    }
}

#[async_trait]
impl HttpClient for StaticProfileClient {
    async fn send(&self, _request: Request<Bytes>) -> Result<Response<Bytes>, HttpError> {
        Ok(Response::builder()
            .status(self.status)
            .body(Bytes::from(self.body.clone()))?)
    }
}
