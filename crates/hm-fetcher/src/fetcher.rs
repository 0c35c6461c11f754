//! Desired state fetcher: one authenticated, paginated pull into the store.
//!
//! A cycle is one async task that owns all of its state: the credentials,
//! the current bulk token, and the running tally. Each await point is one
//! link of the protocol, and the first failing link produces the cycle's
//! only result.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use http::header::AUTHORIZATION;
use http_body_util::BodyExt;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use hm_core::{HmConfig, MessageBus, ReplyFuture, TimeProvider};
use hm_state::{DesiredAppState, FreshnessSignal, StateStore};

use crate::auth::BasicAuthInfo;
use crate::error::FetchError;
use crate::http::HttpClient;

/// Path of the bulk endpoint below the base URL.
const BULK_APPS_PATH: &str = "/bulk/apps";

/// Opaque pagination cursor, echoed back verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BulkToken(serde_json::Value);

impl BulkToken {
    /// The empty-object token that starts every cycle.
    pub fn initial() -> Self {
        Self(serde_json::Value::Object(serde_json::Map::new()))
    }

    /// JSON form sent in the `bulk_token` query parameter.
    pub fn encode(&self) -> String {
        self.0.to_string()
    }
}

impl From<serde_json::Value> for BulkToken {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

impl Default for BulkToken {
    fn default() -> Self {
        Self::initial()
    }
}

/// One page of the bulk API. Missing or null `results` reads as an empty
/// page, a missing `bulk_token` as the initial token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkResponse {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub results: BTreeMap<String, DesiredAppState>,
    #[serde(default)]
    pub bulk_token: BulkToken,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<BTreeMap<String, DesiredAppState>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<BTreeMap<String, DesiredAppState>>::deserialize(deserializer)
        .map(Option::unwrap_or_default)
}

/// Outcome of one fetch cycle. Exactly one is delivered per `fetch`.
#[derive(Debug)]
pub struct FetchResult {
    pub success: bool,
    /// Empty on success.
    pub message: String,
    pub error: Option<FetchError>,
    /// Desired-state entries written during the cycle.
    pub stored: usize,
}

impl FetchResult {
    fn succeeded(stored: usize) -> Self {
        Self {
            success: true,
            message: String::new(),
            error: None,
            stored,
        }
    }

    fn failed(error: FetchError, stored: usize) -> Self {
        Self {
            success: false,
            message: error.message(),
            error: Some(error),
            stored,
        }
    }
}

/// Fetcher settings, usually taken from [`HmConfig`].
#[derive(Debug, Clone)]
pub struct FetcherSettings {
    pub base_url: String,
    pub batch_size: u32,
    /// Configured desired-state TTL; entries are stored with one less.
    pub desired_state_ttl: u64,
    pub freshness_key: String,
    pub freshness_ttl: u64,
    pub auth_subject: String,
    pub auth_timeout: Option<Duration>,
}

impl FetcherSettings {
    pub fn from_config(config: &HmConfig) -> Self {
        Self {
            base_url: config.desired_state_server_base_url.clone(),
            batch_size: config.desired_state_batch_size,
            desired_state_ttl: config.desired_state_ttl,
            freshness_key: config.desired_freshness_key.clone(),
            freshness_ttl: config.desired_freshness_ttl,
            auth_subject: config.auth_subject.clone(),
            auth_timeout: config.auth_timeout.map(Duration::from_secs),
        }
    }

    fn stored_ttl(&self) -> u64 {
        self.desired_state_ttl.saturating_sub(1)
    }
}

/// Pulls the full desired-state snapshot into the store.
#[derive(Clone)]
pub struct DesiredStateFetcher {
    bus: Arc<dyn MessageBus>,
    store: StateStore,
    http: Arc<dyn HttpClient>,
    freshness: Arc<dyn FreshnessSignal>,
    clock: Arc<dyn TimeProvider>,
    settings: Arc<FetcherSettings>,
}

impl DesiredStateFetcher {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        store: StateStore,
        http: Arc<dyn HttpClient>,
        freshness: Arc<dyn FreshnessSignal>,
        clock: Arc<dyn TimeProvider>,
        settings: FetcherSettings,
    ) -> Self {
        Self {
            bus,
            store,
            http,
            freshness,
            clock,
            settings: Arc::new(settings),
        }
    }

    /// Start a fetch cycle and return immediately.
    ///
    /// The credentials request is on the bus before this returns. The cycle
    /// delivers exactly one result on `result_tx`. Aborting the returned
    /// handle abandons the cycle without a result.
    pub fn fetch(&self, result_tx: oneshot::Sender<FetchResult>) -> JoinHandle<()> {
        let reply = self.request_credentials();
        let fetcher = self.clone();
        tokio::spawn(async move {
            let result = fetcher.run_cycle(reply).await;
            if result_tx.send(result).is_err() {
                debug!("fetch result receiver dropped");
            }
        })
    }

    /// Run a whole cycle on the current task.
    pub async fn fetch_once(&self) -> FetchResult {
        let reply = self.request_credentials();
        self.run_cycle(reply).await
    }

    fn request_credentials(&self) -> ReplyFuture {
        debug!(subject = %self.settings.auth_subject, "requesting bulk API credentials");
        self.bus.request(&self.settings.auth_subject, Vec::new())
    }

    async fn run_cycle(&self, reply: ReplyFuture) -> FetchResult {
        info!("desired state fetch cycle started");
        let mut stored = 0;
        match self.paginate(reply, &mut stored).await {
            Ok(pages) => {
                info!(pages, stored, "desired state fetch cycle complete");
                FetchResult::succeeded(stored)
            }
            Err(e) => {
                warn!(error = %e, stored, "{}", e.message());
                FetchResult::failed(e, stored)
            }
        }
    }

    /// Returns the number of pages requested, including the empty one.
    async fn paginate(&self, reply: ReplyFuture, stored: &mut usize) -> Result<u32, FetchError> {
        let credentials = self.authenticate(reply).await?;

        let mut token = BulkToken::initial();
        let mut pages = 0;
        loop {
            let request = self.page_request(&credentials, &token)?;
            let page = self.fetch_page(request).await?;
            pages += 1;

            if page.results.is_empty() {
                break;
            }

            debug!(page = pages, entries = page.results.len(), "desired state page received");
            *stored += self.store_page(&page)?;
            token = page.bulk_token;
        }

        let now = self.clock.now();
        self.freshness
            .bump(&self.settings.freshness_key, now, self.settings.freshness_ttl)
            .map_err(FetchError::FreshnessBump)?;
        debug!(key = %self.settings.freshness_key, timestamp = now, "desired state freshness bumped");

        Ok(pages)
    }

    async fn authenticate(&self, reply: ReplyFuture) -> Result<BasicAuthInfo, FetchError> {
        let payload = match self.settings.auth_timeout {
            Some(limit) => tokio::time::timeout(limit, reply)
                .await
                .map_err(|_| FetchError::AuthTimeout(limit))?,
            None => reply.await,
        }
        .map_err(FetchError::AuthRequest)?;

        serde_json::from_slice(&payload).map_err(FetchError::AuthParse)
    }

    fn page_request(
        &self,
        credentials: &BasicAuthInfo,
        token: &BulkToken,
    ) -> Result<http::Request<()>, FetchError> {
        let base = self.settings.base_url.trim_end_matches('/');
        let mut url = Url::parse(&format!("{base}{BULK_APPS_PATH}"))
            .map_err(|e| FetchError::UrlConstruction(format!("{base}: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(FetchError::UrlConstruction(format!(
                "{base}: unsupported scheme {}",
                url.scheme()
            )));
        }
        if url.query().is_some() || url.fragment().is_some() {
            return Err(FetchError::UrlConstruction(format!(
                "{base}: base URL must not carry a query or fragment"
            )));
        }

        url.query_pairs_mut()
            .append_pair("batch_size", &self.settings.batch_size.to_string())
            .append_pair("bulk_token", &token.encode());

        http::Request::get(url.as_str())
            .header(AUTHORIZATION, credentials.encode())
            .body(())
            .map_err(|e| FetchError::UrlConstruction(e.to_string()))
    }

    async fn fetch_page(&self, request: http::Request<()>) -> Result<BulkResponse, FetchError> {
        let response = self
            .http
            .send(request)
            .await
            .map_err(FetchError::HttpTransport)?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::UNAUTHORIZED => return Err(FetchError::Unauthorized),
            other => return Err(FetchError::UnexpectedStatus(other.as_u16())),
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(FetchError::BodyRead)?
            .to_bytes();

        serde_json::from_slice(&body).map_err(FetchError::BodyParse)
    }

    /// Write-through, not transactional: entries stored before a failure stay.
    fn store_page(&self, page: &BulkResponse) -> Result<usize, FetchError> {
        let ttl = self.settings.stored_ttl();
        for desired in page.results.values() {
            self.store
                .save_desired_state(desired, ttl)
                .map_err(FetchError::StoreWrite)?;
        }
        Ok(page.results.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::task::{Context, Poll};

    use bytes::Bytes;
    use hm_core::{BusMessage, LocalBus, ManualClock};
    use hm_state::{AppState, PackageState, StateResult};
    use hyper::body::{Body, Frame};
    use tokio::sync::mpsc;

    use crate::http::{BoxError, ResponseBody, ResponseFuture, full_body};

    const BASE_URL: &str = "http://cc.example.com";
    const AUTH_SUBJECT: &str = "cloudcontroller.bulk.credentials.default";
    const FRESHNESS_KEY: &str = "/desired-fresh";
    const DESIRED_STATE_TTL: u64 = 600;
    const FRESHNESS_TTL: u64 = 120;
    const BATCH_SIZE: u32 = 500;

    // ── Fakes ──────────────────────────────────────────────────────

    type Responder = oneshot::Sender<Result<http::Response<ResponseBody>, BoxError>>;

    /// A request captured by the fake client, waiting for a response.
    struct PendingRequest {
        request: http::Request<()>,
        respond: Responder,
    }

    impl PendingRequest {
        fn query(&self, name: &str) -> Option<String> {
            let url = Url::parse(&self.request.uri().to_string()).unwrap();
            url.query_pairs()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.into_owned())
        }

        fn respond_with(self, status: StatusCode, body: ResponseBody) {
            let response = http::Response::builder().status(status).body(body).unwrap();
            let _ = self.respond.send(Ok(response));
        }

        fn succeed(self, page: &BulkResponse) {
            self.respond_with(StatusCode::OK, full_body(serde_json::to_vec(page).unwrap()));
        }

        fn fail(self, error: &str) {
            let _ = self.respond.send(Err(error.to_string().into()));
        }
    }

    struct FakeHttpClient {
        requests: mpsc::UnboundedSender<PendingRequest>,
    }

    impl HttpClient for FakeHttpClient {
        fn send(&self, request: http::Request<()>) -> ResponseFuture<'_> {
            let (respond, response) = oneshot::channel();
            let queued = self.requests.send(PendingRequest { request, respond });
            Box::pin(async move {
                queued.map_err(|_| -> BoxError { "fake client closed".into() })?;
                response
                    .await
                    .map_err(|_| -> BoxError { "fake response dropped".into() })?
            })
        }
    }

    #[derive(Default)]
    struct RecordingFreshness {
        bumps: Mutex<Vec<(String, u64, u64)>>,
    }

    impl RecordingFreshness {
        fn bumps(&self) -> Vec<(String, u64, u64)> {
            self.bumps.lock().unwrap().clone()
        }
    }

    impl FreshnessSignal for RecordingFreshness {
        fn bump(&self, key: &str, timestamp: u64, ttl: u64) -> StateResult<()> {
            self.bumps
                .lock()
                .unwrap()
                .push((key.to_string(), timestamp, ttl));
            Ok(())
        }
    }

    /// Body whose first read fails.
    struct BrokenBody;

    impl Body for BrokenBody {
        type Data = Bytes;
        type Error = BoxError;

        fn poll_frame(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
            Poll::Ready(Some(Err("oh no you didn't!".into())))
        }
    }

    // ── Harness ────────────────────────────────────────────────────

    struct Harness {
        fetcher: DesiredStateFetcher,
        store: StateStore,
        clock: ManualClock,
        freshness: Arc<RecordingFreshness>,
        auth_requests: mpsc::UnboundedReceiver<BusMessage>,
        http_requests: mpsc::UnboundedReceiver<PendingRequest>,
    }

    impl Harness {
        fn new(base_url: &str) -> Self {
            Self::with_auth_timeout(base_url, None)
        }

        fn with_auth_timeout(base_url: &str, auth_timeout: Option<Duration>) -> Self {
            let clock = ManualClock::new(1_700_000_000);
            let store = StateStore::open_in_memory(Arc::new(clock.clone())).unwrap();
            let bus = LocalBus::new();
            let auth_requests = bus.subscribe(AUTH_SUBJECT);
            let (tx, http_requests) = mpsc::unbounded_channel();
            let freshness = Arc::new(RecordingFreshness::default());

            let fetcher = DesiredStateFetcher::new(
                Arc::new(bus),
                store.clone(),
                Arc::new(FakeHttpClient { requests: tx }),
                freshness.clone(),
                Arc::new(clock.clone()),
                FetcherSettings {
                    base_url: base_url.to_string(),
                    batch_size: BATCH_SIZE,
                    desired_state_ttl: DESIRED_STATE_TTL,
                    freshness_key: FRESHNESS_KEY.to_string(),
                    freshness_ttl: FRESHNESS_TTL,
                    auth_subject: AUTH_SUBJECT.to_string(),
                    auth_timeout,
                },
            );

            Self {
                fetcher,
                store,
                clock,
                freshness,
                auth_requests,
                http_requests,
            }
        }

        fn start(&self) -> oneshot::Receiver<FetchResult> {
            let (tx, rx) = oneshot::channel();
            self.fetcher.fetch(tx);
            rx
        }

        async fn authenticate(&mut self, payload: &str) {
            let request = self.auth_requests.recv().await.unwrap();
            assert!(request.payload.is_empty());
            request.respond(payload.to_string()).unwrap();
        }

        async fn next_request(&mut self) -> PendingRequest {
            self.http_requests.recv().await.unwrap()
        }

        fn no_more_requests(&mut self) -> bool {
            self.http_requests.try_recv().is_err()
        }
    }

    const GOOD_AUTH: &str = r#"{"user":"mcat","password":"testing"}"#;

    fn desired(guid: &str) -> DesiredAppState {
        DesiredAppState {
            app_guid: guid.to_string(),
            app_version: format!("{guid}-version"),
            number_of_instances: 2,
            memory: 1024,
            state: AppState::Started,
            package_state: PackageState::Staged,
            updated_at: 1_699_999_000,
        }
    }

    fn page(apps: &[&DesiredAppState], token: serde_json::Value) -> BulkResponse {
        BulkResponse {
            results: apps
                .iter()
                .map(|a| (a.app_guid.clone(), (*a).clone()))
                .collect(),
            bulk_token: token.into(),
        }
    }

    async fn assert_failure(h: &mut Harness, rx: oneshot::Receiver<FetchResult>, expected: &str) {
        let result = rx.await.unwrap();
        assert!(!result.success);
        assert_eq!(result.message, expected);
        assert!(result.error.is_some());
        assert!(h.no_more_requests());
        assert!(h.freshness.bumps().is_empty());
    }

    // ── Authentication ─────────────────────────────────────────────

    #[tokio::test]
    async fn requests_credentials_over_the_bus() {
        let mut h = Harness::new(BASE_URL);
        let _rx = h.start();

        let request = h.auth_requests.try_recv().unwrap();
        assert_eq!(request.subject, AUTH_SUBJECT);
        assert!(request.payload.is_empty());
        assert!(request.is_request());
    }

    #[tokio::test]
    async fn sends_basic_auth_to_bulk_endpoint() {
        let mut h = Harness::new(BASE_URL);
        let _rx = h.start();
        h.authenticate(GOOD_AUTH).await;

        let request = h.next_request().await;
        let uri = request.request.uri().to_string();
        assert!(uri.starts_with(BASE_URL));
        assert_eq!(request.request.uri().path(), "/bulk/apps");
        assert_eq!(request.request.method(), &http::Method::GET);
        assert_eq!(
            request.request.headers()[AUTHORIZATION],
            "Basic bWNhdDp0ZXN0aW5n"
        );
    }

    #[tokio::test]
    async fn corrupted_credentials_fail_without_requests() {
        let mut h = Harness::new(BASE_URL);
        let rx = h.start();
        h.authenticate("{").await;

        assert_failure(&mut h, rx, "Failed to parse authentication info from JSON").await;
    }

    #[tokio::test]
    async fn missing_credentials_stall_without_requests() {
        let mut h = Harness::new(BASE_URL);
        let mut rx = h.start();
        let _held = h.auth_requests.recv().await.unwrap();

        let waited =
            tokio::time::timeout(Duration::from_millis(50), h.http_requests.recv()).await;
        assert!(waited.is_err());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn auth_timeout_fails_the_cycle() {
        let mut h = Harness::with_auth_timeout(BASE_URL, Some(Duration::from_millis(20)));
        let rx = h.start();
        let _held = h.auth_requests.recv().await.unwrap();

        assert_failure(&mut h, rx, "Timed out waiting for authentication info").await;
    }

    #[tokio::test]
    async fn no_credentials_responder_fails_the_cycle() {
        let clock = ManualClock::new(0);
        let store = StateStore::open_in_memory(Arc::new(clock.clone())).unwrap();
        let (tx, _http_requests) = mpsc::unbounded_channel();
        let fetcher = DesiredStateFetcher::new(
            Arc::new(LocalBus::new()),
            store.clone(),
            Arc::new(FakeHttpClient { requests: tx }),
            Arc::new(store),
            Arc::new(clock),
            FetcherSettings::from_config(&HmConfig::default()),
        );

        let result = fetcher.fetch_once().await;
        assert!(!result.success);
        assert_eq!(result.message, "Failed to request authentication info");
    }

    #[tokio::test]
    async fn invalid_base_url_fails_without_requests() {
        let mut h = Harness::new("http://example.com/#%ZZ");
        let rx = h.start();
        h.authenticate(GOOD_AUTH).await;

        assert_failure(&mut h, rx, "Failed to generate URL request").await;
    }

    #[tokio::test]
    async fn unparseable_base_url_fails_without_requests() {
        let mut h = Harness::new("not a url");
        let rx = h.start();
        h.authenticate(GOOD_AUTH).await;

        assert_failure(&mut h, rx, "Failed to generate URL request").await;
    }

    // ── Fetching batches ───────────────────────────────────────────

    #[tokio::test]
    async fn first_request_carries_batch_size_and_empty_token() {
        let mut h = Harness::new(BASE_URL);
        let _rx = h.start();
        h.authenticate(GOOD_AUTH).await;

        let request = h.next_request().await;
        assert_eq!(request.query("batch_size").as_deref(), Some("500"));
        assert_eq!(request.query("bulk_token").as_deref(), Some("{}"));
    }

    #[tokio::test]
    async fn non_empty_page_stores_and_requests_next_batch() {
        let mut h = Harness::new(BASE_URL);
        let mut rx = h.start();
        h.authenticate(GOOD_AUTH).await;

        let a1 = desired("app-1");
        let a2 = desired("app-2");
        h.next_request()
            .await
            .succeed(&page(&[&a1, &a2], serde_json::json!({"id": 5})));

        let second = h.next_request().await;
        assert_eq!(second.query("bulk_token").as_deref(), Some(r#"{"id":5}"#));
        assert_eq!(
            second.request.headers()[AUTHORIZATION],
            "Basic bWNhdDp0ZXN0aW5n"
        );

        for app in [&a1, &a2] {
            let node = h.store.get(&app.store_key()).unwrap();
            assert_eq!(node.ttl, DESIRED_STATE_TTL - 1);
            assert_eq!(node.value, serde_json::to_vec(app).unwrap());
        }

        assert!(h.freshness.bumps().is_empty());
        assert!(rx.try_recv().is_err());
        // Auth happens once per cycle.
        assert!(h.auth_requests.try_recv().is_err());
    }

    #[tokio::test]
    async fn two_apps_then_empty_page_succeeds() {
        let mut h = Harness::new(BASE_URL);
        let rx = h.start();
        h.authenticate(GOOD_AUTH).await;

        let a1 = desired("app-1");
        let a2 = desired("app-2");
        h.next_request()
            .await
            .succeed(&page(&[&a1, &a2], serde_json::json!({"id": 5})));
        h.next_request()
            .await
            .succeed(&page(&[], serde_json::json!({"id": 17})));

        let result = rx.await.unwrap();
        assert!(result.success);
        assert!(result.message.is_empty());
        assert!(result.error.is_none());
        assert_eq!(result.stored, 2);

        assert_eq!(h.store.list("/desired").unwrap().len(), 2);
        assert_eq!(
            h.freshness.bumps(),
            vec![(FRESHNESS_KEY.to_string(), h.clock.now(), FRESHNESS_TTL)]
        );
        assert!(h.no_more_requests());
    }

    #[tokio::test]
    async fn empty_first_page_bumps_freshness_immediately() {
        let mut h = Harness::new(BASE_URL);
        let rx = h.start();
        h.authenticate(GOOD_AUTH).await;

        h.next_request()
            .await
            .succeed(&page(&[], serde_json::json!({"id": 17})));

        let result = rx.await.unwrap();
        assert!(result.success);
        assert!(h.no_more_requests());
        assert_eq!(h.freshness.bumps().len(), 1);
    }

    #[tokio::test]
    async fn terminal_page_without_token_succeeds() {
        let mut h = Harness::new(BASE_URL);
        let rx = h.start();
        h.authenticate(GOOD_AUTH).await;

        h.next_request()
            .await
            .respond_with(StatusCode::OK, full_body(r#"{"results":{}}"#));

        let result = rx.await.unwrap();
        assert!(result.success);
        assert!(h.no_more_requests());
        assert_eq!(h.freshness.bumps().len(), 1);
    }

    #[tokio::test]
    async fn null_results_end_the_cycle() {
        let mut h = Harness::new(BASE_URL);
        let rx = h.start();
        h.authenticate(GOOD_AUTH).await;

        h.next_request()
            .await
            .respond_with(StatusCode::OK, full_body(r#"{"results":null,"bulk_token":{}}"#));

        let result = rx.await.unwrap();
        assert!(result.success);
        assert_eq!(result.stored, 0);
        assert!(h.no_more_requests());
        assert_eq!(h.freshness.bumps().len(), 1);
    }

    #[tokio::test]
    async fn requests_equal_non_empty_pages_plus_one() {
        let mut h = Harness::new(BASE_URL);
        let rx = h.start();
        h.authenticate(GOOD_AUTH).await;

        let apps: Vec<DesiredAppState> = (0..3).map(|i| desired(&format!("app-{i}"))).collect();
        let mut expected_token = "{}".to_string();
        for (i, app) in apps.iter().enumerate() {
            let request = h.next_request().await;
            assert_eq!(request.query("bulk_token"), Some(expected_token.clone()));
            let token = serde_json::json!({ "id": i });
            expected_token = token.to_string();
            request.succeed(&page(&[app], token));
        }
        let last = h.next_request().await;
        assert_eq!(last.query("bulk_token"), Some(expected_token));
        last.succeed(&page(&[], serde_json::json!({})));

        let result = rx.await.unwrap();
        assert!(result.success);
        assert_eq!(result.stored, 3);
        assert!(h.no_more_requests());
    }

    // ── Failures ───────────────────────────────────────────────────

    #[tokio::test]
    async fn unauthorized_response_fails() {
        let mut h = Harness::new(BASE_URL);
        let rx = h.start();
        h.authenticate(GOOD_AUTH).await;

        h.next_request()
            .await
            .respond_with(StatusCode::UNAUTHORIZED, full_body(""));

        assert_failure(&mut h, rx, "HTTP request received unauthorized response code").await;
    }

    #[tokio::test]
    async fn non_200_response_fails() {
        let mut h = Harness::new(BASE_URL);
        let rx = h.start();
        h.authenticate(GOOD_AUTH).await;

        h.next_request()
            .await
            .respond_with(StatusCode::NOT_FOUND, full_body(""));

        assert_failure(&mut h, rx, "HTTP request received non-200 response (404)").await;
    }

    #[tokio::test]
    async fn transport_error_fails() {
        let mut h = Harness::new(BASE_URL);
        let rx = h.start();
        h.authenticate(GOOD_AUTH).await;

        h.next_request().await.fail(":(");

        assert_failure(&mut h, rx, "HTTP request failed with error").await;
    }

    #[tokio::test]
    async fn broken_body_fails() {
        let mut h = Harness::new(BASE_URL);
        let rx = h.start();
        h.authenticate(GOOD_AUTH).await;

        h.next_request()
            .await
            .respond_with(StatusCode::OK, BrokenBody.boxed());

        assert_failure(&mut h, rx, "Failed to read HTTP response body").await;
    }

    #[tokio::test]
    async fn malformed_body_fails() {
        let mut h = Harness::new(BASE_URL);
        let rx = h.start();
        h.authenticate(GOOD_AUTH).await;

        h.next_request()
            .await
            .respond_with(StatusCode::OK, full_body("ß"));

        assert_failure(&mut h, rx, "Failed to parse HTTP response body JSON").await;
    }

    #[tokio::test]
    async fn store_write_failure_fails() {
        let mut h = Harness::new(BASE_URL);
        let rx = h.start();
        h.authenticate(GOOD_AUTH).await;

        let app = desired("app-1");
        h.store
            .put(&format!("{}/foo", app.store_key()), b"mwahahaha", 10)
            .unwrap();

        h.next_request()
            .await
            .succeed(&page(&[&app], serde_json::json!({"id": 5})));

        assert_failure(&mut h, rx, "Failed to store desired state in store").await;
    }

    #[tokio::test]
    async fn failure_after_a_stored_page_keeps_earlier_entries() {
        let mut h = Harness::new(BASE_URL);
        let rx = h.start();
        h.authenticate(GOOD_AUTH).await;

        let app = desired("app-1");
        h.next_request()
            .await
            .succeed(&page(&[&app], serde_json::json!({"id": 5})));
        h.next_request()
            .await
            .respond_with(StatusCode::INTERNAL_SERVER_ERROR, full_body(""));

        let result = rx.await.unwrap();
        assert!(!result.success);
        assert_eq!(result.stored, 1);
        assert!(h.store.get(&app.store_key()).is_ok());
        assert!(h.freshness.bumps().is_empty());
    }

    #[tokio::test]
    async fn store_backed_freshness_marks_the_store() {
        let clock = ManualClock::new(5000);
        let store = StateStore::open_in_memory(Arc::new(clock.clone())).unwrap();
        let bus = LocalBus::new();
        let mut auth_requests = bus.subscribe(AUTH_SUBJECT);
        let (tx, mut http_requests) = mpsc::unbounded_channel::<PendingRequest>();
        let fetcher = DesiredStateFetcher::new(
            Arc::new(bus),
            store.clone(),
            Arc::new(FakeHttpClient { requests: tx }),
            Arc::new(store.clone()),
            Arc::new(clock),
            FetcherSettings::from_config(&HmConfig::default()),
        );

        let (result_tx, result_rx) = oneshot::channel();
        fetcher.fetch(result_tx);
        auth_requests
            .recv()
            .await
            .unwrap()
            .respond(GOOD_AUTH)
            .unwrap();
        http_requests
            .recv()
            .await
            .unwrap()
            .succeed(&page(&[], serde_json::json!({})));

        assert!(result_rx.await.unwrap().success);
        let marker = store.freshness("/desired-fresh").unwrap().unwrap();
        assert_eq!(marker.timestamp, 5000);
    }
}
