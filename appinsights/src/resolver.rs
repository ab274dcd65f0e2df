//! Asynchronous resolution of instrumentation keys to application ids.
//!
//! Downstream services identify their callers by a public application id
//! rather than the secret instrumentation key. The resolver fetches that id
//! from the profile endpoint, deduplicates concurrent lookups for the same
//! key, and caches every outcome (success or terminal failure) for the life
//! of the process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;

use crate::http_client::{Bytes, HttpClient, Request};

/// Application ids are exposed with this fixed prefix.
pub const CORRELATION_ID_PREFIX: &str = "cid-v1:";

const MAX_RETRIES: usize = 5;
const RETRY_WAIT: Duration = Duration::from_secs(10);

/// Why an application id could not be resolved.
#[derive(Clone, Debug, Error)]
pub enum ResolveError {
    #[error("invalid profile query endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),

    #[error("received status code {0} from server")]
    Status(u16),

    #[error("profile query transport failure: {0}")]
    Transport(String),
}

/// The outcome of one application id lookup.
///
/// A failed resolution carries an empty application id and a populated
/// error; callers treat it as "identity unknown", not as a fault.
#[derive(Clone, Debug, Default)]
pub struct AppIdResult {
    pub app_id: String,
    pub error: Option<ResolveError>,
}

type Callback = Box<dyn FnOnce(&AppIdResult) + Send + 'static>;

#[derive(Default)]
struct State {
    pending: HashMap<String, Vec<Callback>>,
    results: HashMap<String, AppIdResult>,
}

/// Tracks pending and completed application id lookups.
///
/// One resolver is constructed per process and shared by reference with
/// every client that needs it. `query` is safe under unbounded concurrent
/// invocation: only the map mutation is serialized, the network call runs
/// outside the lock, and concurrent queries for the same key share a single
/// network resolution.
pub struct AppIdResolver {
    inner: Arc<Inner>,
}

struct Inner {
    client: Arc<dyn HttpClient>,
    state: Mutex<State>,
}

impl AppIdResolver {
    pub fn new(client: Arc<dyn HttpClient>) -> Self {
        AppIdResolver {
            inner: Arc::new(Inner {
                client,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Looks up the application id for `ikey` at `endpoint` and invokes
    /// `callback` with the result when it is available.
    ///
    /// A cached result is delivered synchronously on the caller's thread.
    /// Otherwise the callback fires from the background resolution task, in
    /// registration order with any other callbacks waiting on the same key.
    pub fn query(
        &self,
        endpoint: &str,
        ikey: &str,
        callback: impl FnOnce(&AppIdResult) + Send + 'static,
    ) {
        let url = match profile_url(endpoint, ikey) {
            Ok(url) => url,
            Err(err) => {
                callback(&AppIdResult {
                    app_id: String::new(),
                    error: Some(err.into()),
                });
                return;
            }
        };

        let key = url.as_str().to_uppercase();
        let cached = {
            let mut state = self.inner.state.lock().expect("resolver state poisoned");
            if let Some(result) = state.results.get(&key) {
                result.clone()
            } else if let Some(waiters) = state.pending.get_mut(&key) {
                waiters.push(Box::new(callback));
                return;
            } else {
                state.pending.insert(key.clone(), vec![Box::new(callback)]);
                let inner = Arc::clone(&self.inner);
                let ikey = ikey.to_string();
                tokio::spawn(async move { inner.lookup(key, url, ikey).await });
                return;
            }
        };

        callback(&cached);
    }

    /// Async convenience wrapper over [`query`](Self::query).
    pub async fn resolve(&self, endpoint: &str, ikey: &str) -> AppIdResult {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.query(endpoint, ikey, move |result| {
            let _ = tx.send(result.clone());
        });

        rx.await.unwrap_or_else(|_| AppIdResult {
            app_id: String::new(),
            error: Some(ResolveError::Transport("resolver task dropped".into())),
        })
    }
}

fn profile_url(endpoint: &str, ikey: &str) -> Result<url::Url, url::ParseError> {
    let mut url = url::Url::parse(endpoint)?;
    url.set_query(None);
    url.set_fragment(None);
    url.set_path(&format!("api/profiles/{ikey}/appId"));
    Ok(url)
}

impl Inner {
    /// Background lookup routine; retries transient failures on a fixed
    /// interval and posts the final outcome.
    async fn lookup(self: Arc<Self>, key: String, url: url::Url, ikey: String) {
        tracing::debug!(%ikey, "looking up application id");

        let mut last_error = None;
        for _ in 0..MAX_RETRIES {
            match self.try_lookup(&url).await {
                Ok(app_id) => {
                    self.post_result(
                        &key,
                        &ikey,
                        AppIdResult {
                            app_id: format!("{CORRELATION_ID_PREFIX}{app_id}"),
                            error: None,
                        },
                    );
                    return;
                }
                Err((error, retryable)) => {
                    last_error = Some(error);
                    if !retryable {
                        break;
                    }
                    tokio::time::sleep(RETRY_WAIT).await;
                }
            }
        }

        self.post_result(
            &key,
            &ikey,
            AppIdResult {
                app_id: String::new(),
                error: last_error,
            },
        );
    }

    /// One network attempt. The error side carries whether the failure is
    /// retryable: client errors (bad key) and malformed requests are
    /// terminal, everything else gets another try.
    async fn try_lookup(&self, url: &url::Url) -> Result<String, (ResolveError, bool)> {
        let request = Request::get(url.as_str())
            .body(Bytes::new())
            .map_err(|err| (ResolveError::Transport(err.to_string()), false))?;

        let response = self
            .client
            .send(request)
            .await
            .map_err(|err| (ResolveError::Transport(err.to_string()), true))?;

        let status = response.status();
        if status.is_success() {
            Ok(String::from_utf8_lossy(response.body()).trim().to_string())
        } else {
            Err((
                ResolveError::Status(status.as_u16()),
                !status.is_client_error(),
            ))
        }
    }

    /// Writes the result into the permanent cache, removes the pending
    /// lookup, and invokes the waiting callbacks in registration order.
    fn post_result(&self, key: &str, ikey: &str, result: AppIdResult) {
        match &result.error {
            Some(error) => tracing::warn!(ikey, %error, "application id lookup failed"),
            None => tracing::debug!(ikey, "application id lookup completed"),
        }

        let callbacks = {
            let mut state = self.state.lock().expect("resolver state poisoned");
            state.results.insert(key.to_string(), result.clone());
            state.pending.remove(key).unwrap_or_default()
        };

        // Outside the lock: a callback may re-enter query().
        for callback in callbacks {
            callback(&result);
        }
    }
}

impl std::fmt::Debug for AppIdResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppIdResolver").finish_non_exhaustive()
    }
}
