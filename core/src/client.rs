//! The authenticated API client every caller goes through.
//!
//! # Design
//! `ApiClient` owns the pipeline: prepare the request (bearer + wire casing),
//! send it through the `Transport`, classify the response. A first-attempt
//! 401 hands over to the `RefreshCoordinator`, and the request is replayed
//! exactly once with the new token. The replay consumes the request's
//! `Attempt` state, so a second 401 can only end in `SessionExpired`.
//!
//! Token state is injected (`Arc<TokenState>`), not global, so tests and
//! multiple clients can each hold their own.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::{ApiError, Result};
use crate::http::{FormPart, HttpMethod, HttpRequest, RequestBody, AUTHORIZATION};
use crate::interceptor::{classify_response, prepare_request, settle_response, ApiEnvelope, Outcome};
use crate::payload::Payload;
use crate::refresh::RefreshCoordinator;
use crate::token::{AccessToken, TokenState};
use crate::transport::Transport;
use crate::types::{AuthSession, User};

const LOGIN_PATH: &str = "/auth/login";
const SIGNUP_PATH: &str = "/auth/signup";
const REFRESH_PATH: &str = "/auth/refresh";
const LOGOUT_PATH: &str = "/auth/logout";

/// Per-call extras. Query keys are converted to wire casing like bodies.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
}

impl RequestOptions {
    #[must_use]
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

pub struct ApiClient {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    tokens: Arc<TokenState>,
    refresh: RefreshCoordinator,
}

impl ApiClient {
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>, tokens: Arc<TokenState>) -> Self {
        let refresh = RefreshCoordinator::new(Arc::clone(&tokens));
        Self {
            config,
            transport,
            tokens,
            refresh,
        }
    }

    /// Client with a `reqwest` transport and its own empty token state.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Config`] if the HTTP client cannot be built.
    #[cfg(feature = "reqwest")]
    pub fn from_config(config: ClientConfig) -> Result<Self> {
        let transport = crate::transport::ReqwestTransport::new(&config)?;
        Ok(Self::new(config, Arc::new(transport), Arc::new(TokenState::new())))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn tokens(&self) -> &Arc<TokenState> {
        &self.tokens
    }

    pub fn is_refreshing(&self) -> bool {
        self.refresh.is_refreshing()
    }

    pub async fn get(&self, path: &str, options: RequestOptions) -> Result<ApiEnvelope> {
        self.execute(self.build(HttpMethod::Get, path, None, options)).await
    }

    pub async fn post(
        &self,
        path: &str,
        body: impl Into<Option<Payload>>,
        options: RequestOptions,
    ) -> Result<ApiEnvelope> {
        let body = body.into().map(RequestBody::Json);
        self.execute(self.build(HttpMethod::Post, path, body, options)).await
    }

    pub async fn put(
        &self,
        path: &str,
        body: impl Into<Option<Payload>>,
        options: RequestOptions,
    ) -> Result<ApiEnvelope> {
        let body = body.into().map(RequestBody::Json);
        self.execute(self.build(HttpMethod::Put, path, body, options)).await
    }

    pub async fn patch(
        &self,
        path: &str,
        body: impl Into<Option<Payload>>,
        options: RequestOptions,
    ) -> Result<ApiEnvelope> {
        let body = body.into().map(RequestBody::Json);
        self.execute(self.build(HttpMethod::Patch, path, body, options)).await
    }

    pub async fn delete(&self, path: &str, options: RequestOptions) -> Result<ApiEnvelope> {
        self.execute(self.build(HttpMethod::Delete, path, None, options)).await
    }

    /// Multipart upload. Field names and file contents are sent as given.
    pub async fn post_file(&self, path: &str, parts: Vec<FormPart>) -> Result<ApiEnvelope> {
        let body = Some(RequestBody::Multipart(parts));
        self.execute(self.build(HttpMethod::Post, path, body, RequestOptions::default()))
            .await
    }

    /// Send a request through the full pipeline, refreshing and replaying it
    /// once if the server reports an expired credential.
    pub async fn execute(&self, request: HttpRequest) -> Result<ApiEnvelope> {
        let sent_with = self.tokens.current_token();
        let request = prepare_request(request, sent_with.as_ref());
        let response = self.transport.send(&request).await?;

        match classify_response(&response, request.attempt()) {
            Outcome::Success(envelope) => Ok(envelope),
            Outcome::Failed(err) => Err(self.fail(err)),
            Outcome::CredentialExpired => {
                let token = match self.tokens.current_token() {
                    // Another caller already rotated the token while this
                    // request was in flight.
                    Some(current) if sent_with.as_ref() != Some(&current) => {
                        debug!(path = %request.path, "replaying with already-rotated token");
                        current
                    }
                    _ => self
                        .refresh
                        .refresh(|| self.refresh_call())
                        .await
                        .map_err(|err| self.fail(err))?,
                };
                self.retry_with(request, token).await
            }
        }
    }

    /// Replay `request` once with `token`.
    async fn retry_with(&self, request: HttpRequest, token: AccessToken) -> Result<ApiEnvelope> {
        let Some(mut request) = request.into_retried() else {
            return Err(self.fail(ApiError::session_expired("request was already retried")));
        };
        request.set_header(AUTHORIZATION, token.bearer());
        debug!(method = %request.method, path = %request.path, "retrying after refresh");

        let response = self.transport.send(&request).await?;
        match classify_response(&response, request.attempt()) {
            Outcome::Success(envelope) => Ok(envelope),
            Outcome::Failed(err) => Err(self.fail(err)),
            Outcome::CredentialExpired => Err(self.fail(ApiError::session_expired(
                "credentials rejected after refresh",
            ))),
        }
    }

    /// `POST /auth/login`. Stores the returned access token.
    pub async fn login(&self, email: &str, password: &str) -> Result<AuthSession> {
        let body = Payload::record([
            ("email", Payload::from(email)),
            ("password", Payload::from(password)),
        ]);
        let envelope = self.execute_once(HttpMethod::Post, LOGIN_PATH, Some(body)).await?;
        self.store_session(&envelope)
    }

    /// `POST /auth/signup`. Stores the returned access token.
    pub async fn signup(&self, name: &str, email: &str, password: &str) -> Result<AuthSession> {
        let body = Payload::record([
            ("name", Payload::from(name)),
            ("email", Payload::from(email)),
            ("password", Payload::from(password)),
        ]);
        let envelope = self.execute_once(HttpMethod::Post, SIGNUP_PATH, Some(body)).await?;
        self.store_session(&envelope)
    }

    /// Refresh the access token now, sharing any refresh already in flight.
    pub async fn refresh(&self) -> Result<AccessToken> {
        self.refresh
            .refresh(|| self.refresh_call())
            .await
            .map_err(|err| self.fail(err))
    }

    /// `DELETE /auth/logout`. The local token is cleared even if the call fails.
    pub async fn logout(&self) -> Result<()> {
        let result = self.execute_once(HttpMethod::Delete, LOGOUT_PATH, None).await;
        self.tokens.clear_token();
        result.map(|_| ())
    }

    fn build(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<RequestBody>,
        options: RequestOptions,
    ) -> HttpRequest {
        let mut request = HttpRequest::new(method, self.config.url(path)).with_query(options.query);
        request.headers = options.headers;
        request.body = body;
        request
    }

    /// Send without the refresh/replay machinery. A 401 from an auth
    /// endpoint means bad credentials, not an expired session.
    async fn execute_once(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<Payload>,
    ) -> Result<ApiEnvelope> {
        let request = self.build(method, path, body.map(RequestBody::Json), RequestOptions::default());
        let request = prepare_request(request, self.tokens.current_token().as_ref());
        let response = self.transport.send(&request).await?;
        settle_response(&response)
    }

    /// The network half of a refresh. Owns everything it needs so it can run
    /// in a detached task.
    fn refresh_call(&self) -> impl Future<Output = Result<AccessToken>> + Send + 'static {
        let transport = Arc::clone(&self.transport);
        let request = prepare_request(
            HttpRequest::new(HttpMethod::Post, self.config.url(REFRESH_PATH)),
            None,
        );
        async move {
            let response = transport.send(&request).await?;
            let envelope = settle_response(&response)?;
            access_token_from(&envelope)
        }
    }

    fn store_session(&self, envelope: &ApiEnvelope) -> Result<AuthSession> {
        let access_token = access_token_from(envelope)?;
        let user = match envelope.data.get("user") {
            Some(user) if !user.is_null() => Some(user.decode::<User>()?),
            _ => None,
        };
        self.tokens.set_token(access_token.clone());
        Ok(AuthSession { access_token, user })
    }

    /// Terminal session errors drop the stored token.
    fn fail(&self, err: ApiError) -> ApiError {
        if err.is_session_expired() {
            warn!(error = %err, "session expired; clearing access token");
            self.tokens.clear_token();
        }
        err
    }
}

/// Read `data.accessToken`. Envelopes are already local-cased, so servers
/// that send `access_token` land here too.
fn access_token_from(envelope: &ApiEnvelope) -> Result<AccessToken> {
    envelope
        .data
        .get("accessToken")
        .and_then(Payload::as_str)
        .map(AccessToken::new)
        .ok_or_else(|| ApiError::Deserialization("response is missing data.accessToken".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Attempt, HttpResponse};
    use crate::payload::Binary;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    type Handler = dyn Fn(&HttpRequest) -> HttpResponse + Send + Sync;

    /// Answers requests with a closure and records what was sent.
    struct ScriptedTransport {
        handler: Box<Handler>,
        sent: Mutex<Vec<HttpRequest>>,
    }

    impl ScriptedTransport {
        fn new(handler: impl Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                handler: Box::new(handler),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<HttpRequest> {
            self.sent.lock().unwrap().clone()
        }

        fn refresh_calls(&self) -> usize {
            self.sent()
                .iter()
                .filter(|r| r.path.ends_with(REFRESH_PATH))
                .count()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
            self.sent.lock().unwrap().push(request.clone());
            let delay = if request.path.ends_with(REFRESH_PATH) { 20 } else { 5 };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok((self.handler)(request))
        }
    }

    /// Accepts `Bearer t2` only; refresh hands out `t2`.
    fn rotating_server(request: &HttpRequest) -> HttpResponse {
        if request.path.ends_with(REFRESH_PATH) {
            return HttpResponse::new(200, r#"{"data":{"access_token":"t2"}}"#);
        }
        match request.header(AUTHORIZATION) {
            Some("Bearer t2") => HttpResponse::new(200, r#"{"data":{"ok":true}}"#),
            _ => HttpResponse::new(401, r#"{"message":"token expired"}"#),
        }
    }

    fn client_with(transport: Arc<ScriptedTransport>, token: Option<&str>) -> ApiClient {
        let tokens = Arc::new(TokenState::new());
        if let Some(token) = token {
            tokens.set_token(AccessToken::new(token));
        }
        ApiClient::new(ClientConfig::new("http://localhost:3000"), transport, tokens)
    }

    #[tokio::test]
    async fn success_passes_through_without_refresh() {
        let transport = ScriptedTransport::new(|_| {
            HttpResponse::new(200, r#"{"data":[{"project_name":"a"}],"meta":{"total_count":1}}"#)
        });
        let client = client_with(Arc::clone(&transport), Some("t1"));

        let envelope = client.get("/projects", RequestOptions::default()).await.unwrap();
        assert_eq!(envelope.data, Payload::from(json!([{"projectName": "a"}])));
        assert_eq!(envelope.meta, Some(Payload::from(json!({"totalCount": 1}))));

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].path, "http://localhost:3000/api/v1/projects");
        assert_eq!(sent[0].header(AUTHORIZATION), Some("Bearer t1"));
    }

    #[tokio::test]
    async fn five_concurrent_expiries_share_one_refresh() {
        let transport = ScriptedTransport::new(rotating_server);
        let client = client_with(Arc::clone(&transport), Some("t1"));

        let paths: Vec<String> = (0..5).map(|i| format!("/projects/{i}")).collect();
        let calls = paths.iter().map(|path| client.get(path, RequestOptions::default()));
        let results = futures::future::join_all(calls).await;

        for result in results {
            assert_eq!(result.unwrap().data, Payload::from(json!({"ok": true})));
        }
        assert_eq!(transport.refresh_calls(), 1);
        let retried = transport
            .sent()
            .into_iter()
            .filter(|r| r.attempt() == Attempt::Retried)
            .collect::<Vec<_>>();
        assert_eq!(retried.len(), 5);
        assert!(retried.iter().all(|r| r.header(AUTHORIZATION) == Some("Bearer t2")));
        assert_eq!(client.tokens().current_token(), Some(AccessToken::new("t2")));
        assert!(!client.is_refreshing());
    }

    #[tokio::test]
    async fn two_concurrent_calls_each_retry_once() {
        let transport = ScriptedTransport::new(rotating_server);
        let client = client_with(Arc::clone(&transport), Some("t1"));

        let (a, b) = tokio::join!(
            client.get("/timers/current", RequestOptions::default()),
            client.post(
                "/time-entries",
                Payload::record([("description", Payload::from("x"))]),
                RequestOptions::default(),
            ),
        );
        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(transport.refresh_calls(), 1);
        // two originals, one refresh, two replays
        assert_eq!(transport.sent().len(), 5);
    }

    #[tokio::test]
    async fn retried_request_rejected_again_is_session_expired() {
        let transport = ScriptedTransport::new(|request| {
            if request.path.ends_with(REFRESH_PATH) {
                HttpResponse::new(200, r#"{"data":{"accessToken":"t2"}}"#)
            } else {
                HttpResponse::new(401, "")
            }
        });
        let client = client_with(Arc::clone(&transport), Some("t1"));

        let err = client.get("/projects", RequestOptions::default()).await.unwrap_err();
        assert!(err.is_session_expired());
        // original, refresh, one replay, nothing more
        assert_eq!(transport.sent().len(), 3);
        assert_eq!(transport.refresh_calls(), 1);
        assert!(client.tokens().current_token().is_none());
    }

    #[tokio::test]
    async fn failed_refresh_rejects_all_waiters_and_clears_token() {
        let transport = ScriptedTransport::new(|request| {
            if request.path.ends_with(REFRESH_PATH) {
                HttpResponse::new(401, r#"{"message":"refresh token revoked"}"#)
            } else {
                HttpResponse::new(401, "")
            }
        });
        let client = client_with(Arc::clone(&transport), Some("t1"));

        let calls = (0..3).map(|_| client.get("/projects", RequestOptions::default()));
        for result in futures::future::join_all(calls).await {
            assert!(result.unwrap_err().is_session_expired());
        }
        assert_eq!(transport.refresh_calls(), 1);
        assert!(client.tokens().current_token().is_none());
        assert!(transport.sent().iter().all(|r| r.attempt() == Attempt::NotAttempted));
    }

    #[tokio::test]
    async fn cleared_token_sends_no_authorization_header() {
        let transport = ScriptedTransport::new(|_| HttpResponse::new(200, "{}"));
        let client = client_with(Arc::clone(&transport), Some("t1"));

        client.tokens().clear_token();
        client.get("/projects", RequestOptions::default()).await.unwrap();
        assert!(transport.sent()[0].header(AUTHORIZATION).is_none());
    }

    #[tokio::test]
    async fn body_and_query_go_out_in_wire_casing() {
        let transport = ScriptedTransport::new(|_| HttpResponse::new(201, r#"{"data":{}}"#));
        let client = client_with(Arc::clone(&transport), Some("t1"));
        let started = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let body = Payload::record([
            ("projectId", Payload::from("p1")),
            ("startedAt", Payload::from(started)),
        ]);
        let options = RequestOptions::default().query("includeArchived", "true");
        client.post("/time-entries", body, options).await.unwrap();

        let sent = &transport.sent()[0];
        assert_eq!(
            sent.body,
            Some(RequestBody::Json(Payload::record([
                ("project_id", Payload::from("p1")),
                ("started_at", Payload::Date(started)),
            ])))
        );
        assert_eq!(sent.query, vec![("include_archived".to_string(), "true".to_string())]);
    }

    #[tokio::test]
    async fn post_file_skips_case_transformation() {
        let transport =
            ScriptedTransport::new(|_| HttpResponse::new(201, r#"{"data":{"file_name":"a.csv"}}"#));
        let client = client_with(Arc::clone(&transport), Some("t1"));
        let parts = vec![
            FormPart::text("importMode", "append"),
            FormPart::file("file", Binary::new(vec![1u8, 2, 3]).with_file_name("a.csv")),
        ];

        let envelope = client.post_file("/imports", parts.clone()).await.unwrap();
        assert_eq!(envelope.data, Payload::from(json!({"fileName": "a.csv"})));
        assert_eq!(transport.sent()[0].body, Some(RequestBody::Multipart(parts)));
    }

    #[tokio::test]
    async fn refresh_accepts_either_token_spelling() {
        for body in [r#"{"data":{"access_token":"t2"}}"#, r#"{"data":{"accessToken":"t2"}}"#] {
            let transport = ScriptedTransport::new(move |_| HttpResponse::new(200, body));
            let client = client_with(transport, None);
            client.refresh().await.unwrap();
            assert_eq!(client.tokens().current_token(), Some(AccessToken::new("t2")));
        }
    }

    #[tokio::test]
    async fn login_stores_token_and_decodes_user() {
        let transport = ScriptedTransport::new(|_| {
            HttpResponse::new(
                200,
                r#"{"data":{"access_token":"t1","user":{"id":"00000000-0000-0000-0000-000000000001","name":"Ada","email":"ada@example.com"}}}"#,
            )
        });
        let client = client_with(Arc::clone(&transport), None);

        let session = client.login("ada@example.com", "pw").await.unwrap();
        assert_eq!(session.access_token.expose(), "t1");
        assert_eq!(session.user.unwrap().name, "Ada");
        assert_eq!(client.tokens().current_token(), Some(AccessToken::new("t1")));
        assert!(transport.sent()[0].path.ends_with(LOGIN_PATH));
    }

    #[tokio::test]
    async fn rejected_login_does_not_refresh() {
        let transport = ScriptedTransport::new(|_| {
            HttpResponse::new(401, r#"{"message":"invalid email or password"}"#)
        });
        let client = client_with(Arc::clone(&transport), None);

        let err = client.login("ada@example.com", "wrong").await.unwrap_err();
        assert_eq!(err.status(), Some(401));
        assert_eq!(transport.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn logout_clears_token_even_on_failure() {
        let transport = ScriptedTransport::new(|_| HttpResponse::new(500, ""));
        let client = client_with(Arc::clone(&transport), Some("t1"));

        let err = client.logout().await.unwrap_err();
        assert!(matches!(err, ApiError::Server { status: 500, .. }));
        assert!(client.tokens().current_token().is_none());
        assert_eq!(transport.sent()[0].method, HttpMethod::Delete);
    }

    #[tokio::test]
    async fn validation_errors_are_not_retried() {
        let transport = ScriptedTransport::new(|_| {
            HttpResponse::new(422, r#"{"message":"name is required"}"#)
        });
        let client = client_with(Arc::clone(&transport), Some("t1"));

        let err = client
            .put(
                "/projects/1",
                Payload::record([("name", Payload::from(""))]),
                RequestOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "request rejected (422): name is required");
        assert_eq!(transport.sent().len(), 1);
        assert_eq!(client.tokens().current_token(), Some(AccessToken::new("t1")));
    }
}
