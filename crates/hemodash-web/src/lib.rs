//! Authenticated JSON API over the preference store, email templates and
//! the delivery orchestrator.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Path as AxumPath, State},
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use hemodash_core::{EmailTemplate, Frequency, UserPreference};
use hemodash_query::IndicatorExecutor;
use hemodash_report::{
    assemble, scheduler_status, send_with_retry, BackoffPolicy, MailTransport, Orchestrator,
    OutboundEmail, ReportConfig, RunOptions, RunStatus, RunSummary, TransportError,
};
use hemodash_storage::{PreferenceStore, StoreError, TemplateStore};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "hemodash-web";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub role: String,
    pub exp: i64,
}

/// Verifies bearer tokens of the form
/// `base64url(claims json).base64url(hmac-sha256(claims json))`.
/// Token issuance lives with the dashboard's identity provider; the issue
/// helper here exists for tests and local tooling.
#[derive(Clone)]
pub struct TokenVerifier {
    secret: Vec<u8>,
}

impl TokenVerifier {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let secret = std::env::var("HEMODASH_AUTH_SECRET")
            .map_err(|_| anyhow::anyhow!("HEMODASH_AUTH_SECRET must be set"))?;
        if secret.is_empty() {
            anyhow::bail!("HEMODASH_AUTH_SECRET must not be empty");
        }
        Ok(Self::new(secret.into_bytes()))
    }

    pub fn issue(&self, claims: &Claims) -> anyhow::Result<String> {
        let payload = serde_json::to_vec(claims)?;
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| anyhow::anyhow!("invalid hmac key"))?;
        mac.update(&payload);
        let signature = mac.finalize().into_bytes();
        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(signature)
        ))
    }

    pub fn verify(&self, token: &str) -> Option<Claims> {
        let (payload_b64, signature_b64) = token.split_once('.')?;
        let payload = URL_SAFE_NO_PAD.decode(payload_b64).ok()?;
        let signature = URL_SAFE_NO_PAD.decode(signature_b64).ok()?;
        let mut mac = HmacSha256::new_from_slice(&self.secret).ok()?;
        mac.update(&payload);
        mac.verify_slice(&signature).ok()?;
        let claims: Claims = serde_json::from_slice(&payload).ok()?;
        if claims.exp < Utc::now().timestamp() {
            return None;
        }
        Some(claims)
    }
}

#[derive(Debug, Clone)]
pub struct Identity {
    pub username: String,
    pub role: String,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }
}

impl FromRequestParts<Arc<AppState>> for Identity {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError::Unauthorized)?;
        let token = value.strip_prefix("Bearer ").ok_or(ApiError::Unauthorized)?;
        let claims = state.verifier.verify(token).ok_or(ApiError::Unauthorized)?;
        Ok(Identity {
            username: claims.sub,
            role: claims.role,
        })
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("authentication required")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("{0}")]
    BadRequest(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{message}")]
    Config { message: String, details: String },
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Protected(_) => ApiError::Forbidden,
            StoreError::NotFound(id) => ApiError::NotFound(format!("template {id}")),
            other => ApiError::Internal(anyhow::Error::new(other)),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, details) = match &self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, None),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, None),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, None),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, None),
            ApiError::Config { details, .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, Some(details.clone()))
            }
            ApiError::Internal(err) => {
                error!(error = %err, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, None)
            }
        };
        let mut body = serde_json::json!({ "error": self.to_string() });
        if let Some(details) = details {
            body["details"] = details.into();
        }
        (status, Json(body)).into_response()
    }
}

pub struct AppState {
    pub store: Arc<PreferenceStore>,
    pub templates: Arc<TemplateStore>,
    pub orchestrator: Arc<Orchestrator>,
    pub transport: Arc<dyn MailTransport>,
    pub executor: Arc<dyn IndicatorExecutor>,
    pub config: ReportConfig,
    pub verifier: TokenVerifier,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/settings", get(get_settings).post(post_settings))
        .route("/settings/all", get(get_all_settings))
        .route("/test-send", post(test_send))
        .route("/test-email", post(test_email))
        .route("/email-config", get(email_config))
        .route("/email-templates", get(list_templates).post(upsert_template))
        .route("/email-templates/{id}", delete(delete_template))
        .route("/scheduler-status", get(scheduler_status_handler))
        .route("/force-send", post(force_send))
        .route("/export-config", get(export_config))
        .route("/import-config", post(import_config))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn get_settings(
    State(state): State<Arc<AppState>>,
    identity: Identity,
) -> Json<Option<UserPreference>> {
    Json(state.store.get_one(&identity.username).await)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPayload {
    pub email: String,
    pub frequency: String,
    #[serde(default)]
    pub overview_indicators: BTreeMap<String, bool>,
    #[serde(default)]
    pub apheresis_indicators: BTreeMap<String, bool>,
    #[serde(default)]
    pub whole_blood_indicators: BTreeMap<String, bool>,
    #[serde(default)]
    pub template_id: Option<String>,
}

fn validate_email(email: &str) -> Result<String, ApiError> {
    let email = email.trim();
    if email.is_empty() || !email.contains('@') {
        return Err(ApiError::BadRequest(
            "a valid email address is required".to_string(),
        ));
    }
    Ok(email.to_string())
}

async fn post_settings(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Json(payload): Json<SettingsPayload>,
) -> Result<Json<UserPreference>, ApiError> {
    let email = validate_email(&payload.email)?;
    if Frequency::parse(&payload.frequency).is_none() {
        return Err(ApiError::BadRequest(
            "frequency must be daily, weekly or monthly".to_string(),
        ));
    }

    let preference = UserPreference {
        username: identity.username,
        email,
        frequency: payload.frequency,
        overview_indicators: payload.overview_indicators,
        apheresis_indicators: payload.apheresis_indicators,
        whole_blood_indicators: payload.whole_blood_indicators,
        template_id: payload.template_id.unwrap_or_else(|| "default".to_string()),
        last_updated: Utc::now(),
        imported_at: None,
        imported_from: None,
    };
    let stored = state.store.upsert(preference).await?;
    Ok(Json(stored))
}

async fn get_all_settings(
    State(state): State<Arc<AppState>>,
    identity: Identity,
) -> Result<Json<std::collections::HashMap<String, UserPreference>>, ApiError> {
    if !identity.is_admin() {
        return Err(ApiError::Forbidden);
    }
    Ok(Json(state.store.get_all().await))
}

/// Re-invokes a run while every failure in it is transient. The orchestrator
/// itself dispatches exactly once per user, so redundancy lives here at the
/// route boundary.
async fn run_with_transient_retry(orchestrator: &Orchestrator, options: &RunOptions) -> RunSummary {
    let mut summary = orchestrator.run(options).await;
    for _ in 0..2 {
        let retryable = summary.status == RunStatus::Completed
            && summary.failed > 0
            && summary.details.iter().all(|d| d.success || d.transient);
        if !retryable {
            break;
        }
        summary = orchestrator.run(options).await;
    }
    summary
}

async fn test_send(
    State(state): State<Arc<AppState>>,
    identity: Identity,
) -> Json<RunSummary> {
    let options = RunOptions::targeted(identity.username);
    Json(run_with_transient_retry(&state.orchestrator, &options).await)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestEmailPayload {
    pub email: String,
    #[serde(default)]
    pub frequency: Option<String>,
    #[serde(default)]
    pub indicators: Option<Vec<String>>,
}

async fn test_email(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Json(payload): Json<TestEmailPayload>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let destination = validate_email(&payload.email)?;
    if state.config.relay_token.is_none() {
        return Err(ApiError::Config {
            message: "mail relay is not configured".to_string(),
            details: "set HEMODASH_RELAY_TOKEN to enable outbound email".to_string(),
        });
    }

    let (subject, html) = match payload.indicators.as_deref() {
        Some(indicators) if !indicators.is_empty() => {
            // Ephemeral preference, never persisted: renders a real report
            // for the requested indicators.
            let mut overview = BTreeMap::new();
            for key in indicators {
                overview.insert(key.clone(), true);
            }
            let preference = UserPreference {
                username: identity.username.clone(),
                email: destination.clone(),
                frequency: payload.frequency.unwrap_or_else(|| "weekly".to_string()),
                overview_indicators: overview,
                apheresis_indicators: BTreeMap::new(),
                whole_blood_indicators: BTreeMap::new(),
                template_id: "default".to_string(),
                last_updated: Utc::now(),
                imported_at: None,
                imported_from: None,
            };
            let report = assemble(
                &preference,
                state.executor.as_ref(),
                &state.templates,
                &state.config,
                Utc::now(),
            )
            .await;
            (report.subject, report.html)
        }
        _ => (
            "Indicator Dashboard - Test Email".to_string(),
            format!(
                "<p>This is a test email from the indicator dashboard, requested by {}.</p>",
                identity.username
            ),
        ),
    };

    let email = OutboundEmail {
        from: state.config.from_address.clone(),
        to: destination.clone(),
        subject,
        html,
    };
    let receipt = send_with_retry(state.transport.as_ref(), &email, BackoffPolicy::default())
        .await
        .map_err(|err| match err {
            TransportError::NotConfigured => ApiError::Config {
                message: "mail relay is not configured".to_string(),
                details: "set HEMODASH_RELAY_TOKEN to enable outbound email".to_string(),
            },
            other => ApiError::Internal(anyhow::Error::new(other)),
        })?;

    Ok(Json(serde_json::json!({
        "success": true,
        "to": destination,
        "messageId": receipt.message_id,
    })))
}

async fn email_config(
    State(state): State<Arc<AppState>>,
    _identity: Identity,
) -> Json<serde_json::Value> {
    // The credential itself never leaves the server, only its shape.
    let (token_length, token_mask) = state.config.masked_relay_token();
    Json(serde_json::json!({
        "relayUrl": state.config.relay_url,
        "fromAddress": state.config.from_address,
        "sendHour": state.config.send_hour,
        "configured": state.config.relay_token.is_some(),
        "relayTokenLength": token_length,
        "relayTokenMask": token_mask,
    }))
}

async fn list_templates(
    State(state): State<Arc<AppState>>,
    _identity: Identity,
) -> Result<Json<std::collections::HashMap<String, EmailTemplate>>, ApiError> {
    Ok(Json(state.templates.list().await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplatePayload {
    #[serde(default = "default_template_key")]
    pub template_id: String,
    pub template: EmailTemplate,
}

fn default_template_key() -> String {
    "default".to_string()
}

async fn upsert_template(
    State(state): State<Arc<AppState>>,
    _identity: Identity,
    Json(payload): Json<TemplatePayload>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (template_id, template) = state
        .templates
        .upsert(&payload.template_id, payload.template)
        .await?;
    Ok(Json(serde_json::json!({
        "templateId": template_id,
        "template": template,
    })))
}

async fn delete_template(
    State(state): State<Arc<AppState>>,
    _identity: Identity,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.templates.delete(&id).await?;
    Ok(Json(serde_json::json!({ "deleted": id })))
}

async fn scheduler_status_handler(
    State(state): State<Arc<AppState>>,
    _identity: Identity,
) -> Json<hemodash_report::SchedulerStatus> {
    Json(scheduler_status(&state.store, &state.config, Utc::now()).await)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForceSendPayload {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub test_email: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
}

async fn force_send(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Json(payload): Json<ForceSendPayload>,
) -> Result<Json<RunSummary>, ApiError> {
    if !identity.is_admin() {
        return Err(ApiError::Forbidden);
    }
    let options = RunOptions {
        target_username: payload.user_id,
        test_email: payload.test_email,
        dry_run: payload.dry_run,
        scheduled: false,
    };
    Ok(Json(state.orchestrator.run(&options).await))
}

async fn export_config(
    State(state): State<Arc<AppState>>,
    identity: Identity,
) -> Result<impl IntoResponse, ApiError> {
    let Some(preference) = state.store.get_one(&identity.username).await else {
        return Err(ApiError::NotFound("settings".to_string()));
    };

    let mut document = serde_json::to_value(&preference)
        .map_err(|err| ApiError::Internal(anyhow::Error::new(err)))?;
    document["exportDate"] = serde_json::json!(Utc::now());
    document["exportedBy"] = serde_json::json!(identity.username);

    let disposition = format!(
        "attachment; filename=\"hemodash-settings-{}.json\"",
        identity.username
    );
    Ok(([(header::CONTENT_DISPOSITION, disposition)], Json(document)))
}

async fn import_config(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Json(payload): Json<serde_json::Value>,
) -> Result<Json<UserPreference>, ApiError> {
    let required = [
        "overviewIndicators",
        "apheresisIndicators",
        "wholeBloodIndicators",
    ];
    let complete = required
        .iter()
        .all(|key| payload.get(key).map(|v| v.is_object()).unwrap_or(false));
    if !complete {
        return Err(ApiError::BadRequest(
            "settings document must contain overviewIndicators, apheresisIndicators and wholeBloodIndicators"
                .to_string(),
        ));
    }

    let document: UserPreference = serde_json::from_value(payload.clone())
        .map_err(|err| ApiError::BadRequest(format!("invalid settings document: {err}")))?;
    let origin = payload
        .get("exportedBy")
        .and_then(|v| v.as_str())
        .unwrap_or(&document.username)
        .to_string();

    let preference = UserPreference {
        username: identity.username,
        last_updated: Utc::now(),
        imported_at: Some(Utc::now()),
        imported_from: Some(origin),
        ..document
    };
    let stored = state.store.upsert(preference).await?;
    Ok(Json(stored))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use chrono::DateTime;
    use hemodash_core::{AggregationRow, IndicatorValue, MetricValue};
    use hemodash_report::testing::{RecordingTransport, StaticExecutor};
    use hemodash_storage::StoreConfig;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tempfile::tempdir;
    use tower::ServiceExt;

    const SECRET: &str = "route-test-secret";

    fn config(with_relay_token: bool) -> ReportConfig {
        ReportConfig {
            relay_url: "http://localhost:2525/send".to_string(),
            relay_token: with_relay_token.then(|| "relay-credential-value".to_string()),
            from_address: "reports@hemodash.local".to_string(),
            send_hour: 7,
            report_cron: "0 0 7 * * *".to_string(),
            scheduler_enabled: false,
            dashboard_url: "http://localhost:3000".to_string(),
            http_timeout_secs: 5,
        }
    }

    fn build_state(
        dir: &std::path::Path,
        transport: Arc<RecordingTransport>,
        with_relay_token: bool,
    ) -> AppState {
        let store_config = StoreConfig::new(dir);
        let store = Arc::new(PreferenceStore::new(&store_config));
        let templates = Arc::new(TemplateStore::new(&store_config));
        let executor: Arc<dyn IndicatorExecutor> = Arc::new(
            StaticExecutor::default().with_rows(
                "apheresis_donations",
                vec![AggregationRow {
                    year: 2026,
                    month: 8,
                    value: IndicatorValue::Scalar(MetricValue::Number(7.0)),
                }],
            ),
        );
        let config = config(with_relay_token);
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            templates.clone(),
            executor.clone(),
            transport.clone(),
            config.clone(),
        ));
        AppState {
            store,
            templates,
            orchestrator,
            transport,
            executor,
            config,
            verifier: TokenVerifier::new(SECRET),
        }
    }

    fn token(sub: &str, role: &str) -> String {
        TokenVerifier::new(SECRET)
            .issue(&Claims {
                sub: sub.to_string(),
                role: role.to_string(),
                exp: Utc::now().timestamp() + 3600,
            })
            .expect("issue token")
    }

    async fn call(
        app: Router,
        method: &str,
        uri: &str,
        bearer: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = axum::http::Request::builder().method(method).uri(uri);
        if let Some(token) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(value) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(value.to_string()))
                .expect("request"),
            None => builder.body(Body::empty()).expect("request"),
        };
        let response = app.oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    fn settings_body(email: &str, frequency: &str) -> Value {
        json!({
            "email": email,
            "frequency": frequency,
            "overviewIndicators": { "apheresis_donations": true },
            "apheresisIndicators": {},
            "wholeBloodIndicators": {},
        })
    }

    async fn seed_user(store: &PreferenceStore, username: &str, frequency: &str) {
        let mut overview = BTreeMap::new();
        overview.insert("apheresis_donations".to_string(), true);
        store
            .upsert(UserPreference {
                username: username.to_string(),
                email: format!("{username}@example.com"),
                frequency: frequency.to_string(),
                overview_indicators: overview,
                apheresis_indicators: BTreeMap::new(),
                whole_blood_indicators: BTreeMap::new(),
                template_id: "default".to_string(),
                last_updated: DateTime::<Utc>::UNIX_EPOCH,
                imported_at: None,
                imported_from: None,
            })
            .await
            .expect("seed user");
    }

    #[tokio::test]
    async fn requests_without_token_are_unauthorized() {
        let dir = tempdir().expect("tempdir");
        let app = app(build_state(dir.path(), Arc::new(RecordingTransport::default()), true));

        let (status, body) = call(app, "GET", "/settings", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "authentication required");
    }

    #[tokio::test]
    async fn garbage_token_is_unauthorized() {
        let dir = tempdir().expect("tempdir");
        let app = app(build_state(dir.path(), Arc::new(RecordingTransport::default()), true));

        let (status, _) = call(app, "GET", "/settings", Some("not.a.token"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn settings_round_trip_stamps_last_updated() {
        let dir = tempdir().expect("tempdir");
        let app = app(build_state(dir.path(), Arc::new(RecordingTransport::default()), true));
        let token = token("alice", "user");

        let (status, stored) = call(
            app.clone(),
            "POST",
            "/settings",
            Some(&token),
            Some(settings_body("alice@example.com", "weekly")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stored["username"], "alice");
        assert_ne!(stored["lastUpdated"], json!("1970-01-01T00:00:00Z"));

        let (status, fetched) = call(app, "GET", "/settings", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["email"], "alice@example.com");
        assert_eq!(fetched["frequency"], "weekly");
    }

    #[tokio::test]
    async fn settings_for_unknown_user_is_null() {
        let dir = tempdir().expect("tempdir");
        let app = app(build_state(dir.path(), Arc::new(RecordingTransport::default()), true));

        let (status, body) = call(app, "GET", "/settings", Some(&token("ghost", "user")), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Value::Null);
    }

    #[tokio::test]
    async fn invalid_frequency_and_email_are_rejected() {
        let dir = tempdir().expect("tempdir");
        let app = app(build_state(dir.path(), Arc::new(RecordingTransport::default()), true));
        let token = token("alice", "user");

        let (status, _) = call(
            app.clone(),
            "POST",
            "/settings",
            Some(&token),
            Some(settings_body("alice@example.com", "fortnightly")),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            app,
            "POST",
            "/settings",
            Some(&token),
            Some(settings_body("   ", "weekly")),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn settings_all_requires_admin() {
        let dir = tempdir().expect("tempdir");
        let app = app(build_state(dir.path(), Arc::new(RecordingTransport::default()), true));

        let (status, _) = call(
            app.clone(),
            "GET",
            "/settings/all",
            Some(&token("alice", "user")),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = call(
            app,
            "GET",
            "/settings/all",
            Some(&token("root", "admin")),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_object());
    }

    #[tokio::test]
    async fn default_template_cannot_be_deleted_but_unknown_is_not_found() {
        let dir = tempdir().expect("tempdir");
        let app = app(build_state(dir.path(), Arc::new(RecordingTransport::default()), true));
        let token = token("alice", "user");

        let (status, _) = call(
            app.clone(),
            "DELETE",
            "/email-templates/default",
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = call(app, "DELETE", "/email-templates/nope", Some(&token), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn overwriting_default_template_creates_copy() {
        let dir = tempdir().expect("tempdir");
        let app = app(build_state(dir.path(), Arc::new(RecordingTransport::default()), true));
        let token = token("alice", "user");

        let payload = json!({
            "templateId": "default",
            "template": {
                "name": "Branded",
                "color": "#aa0000",
                "accent": "#5e72e4",
            }
        });
        let (status, body) = call(app, "POST", "/email-templates", Some(&token), Some(payload)).await;
        assert_eq!(status, StatusCode::OK);
        assert_ne!(body["templateId"], "default");
        assert_eq!(body["template"]["isDefault"], json!(false));
        assert_eq!(body["template"]["basedOn"], "default");
    }

    #[tokio::test]
    async fn force_send_is_admin_only_and_dry_run_simulates() {
        let dir = tempdir().expect("tempdir");
        let transport = Arc::new(RecordingTransport::default());
        let state = build_state(dir.path(), transport.clone(), true);
        seed_user(&state.store, "alice", "daily").await;
        seed_user(&state.store, "bob", "daily").await;
        seed_user(&state.store, "carol", "daily").await;
        let app = app(state);

        let (status, _) = call(
            app.clone(),
            "POST",
            "/force-send",
            Some(&token("alice", "user")),
            Some(json!({ "dryRun": true })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, summary) = call(
            app,
            "POST",
            "/force-send",
            Some(&token("root", "admin")),
            Some(json!({ "dryRun": true })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(summary["status"], "completed");
        assert_eq!(summary["totalUsers"], 3);
        assert_eq!(summary["success"], 3);
        assert_eq!(transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_send_targets_the_caller() {
        let dir = tempdir().expect("tempdir");
        let transport = Arc::new(RecordingTransport::default());
        let state = build_state(dir.path(), transport.clone(), true);
        seed_user(&state.store, "alice", "monthly").await;
        let app = app(state);

        let (status, summary) =
            call(app, "POST", "/test-send", Some(&token("alice", "user")), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(summary["success"], 1);
        assert_eq!(transport.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_send_retries_transient_failures_until_delivery() {
        let dir = tempdir().expect("tempdir");
        let transport = Arc::new(RecordingTransport::recovering_after("alice@example.com", 1));
        let state = build_state(dir.path(), transport.clone(), true);
        seed_user(&state.store, "alice", "monthly").await;
        let app = app(state);

        let (status, summary) =
            call(app, "POST", "/test-send", Some(&token("alice", "user")), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(summary["status"], "completed");
        assert_eq!(summary["success"], 1);
        assert_eq!(summary["failed"], 0);
        // The first attempt was rejected with a 503; the route re-ran the
        // targeted delivery and the second attempt landed.
        assert_eq!(transport.attempt_count(), 2);
        assert_eq!(transport.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_send_does_not_retry_permanent_failures() {
        let dir = tempdir().expect("tempdir");
        let transport = Arc::new(RecordingTransport::failing_for("alice@example.com", false));
        let state = build_state(dir.path(), transport.clone(), true);
        seed_user(&state.store, "alice", "monthly").await;
        let app = app(state);

        let (status, summary) =
            call(app, "POST", "/test-send", Some(&token("alice", "user")), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(summary["status"], "completed");
        assert_eq!(summary["failed"], 1);
        assert_eq!(transport.attempt_count(), 1);
        assert_eq!(transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn export_missing_settings_is_not_found() {
        let dir = tempdir().expect("tempdir");
        let app = app(build_state(dir.path(), Arc::new(RecordingTransport::default()), true));

        let (status, _) = call(
            app,
            "GET",
            "/export-config",
            Some(&token("ghost", "user")),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn export_carries_provenance_and_attachment_header() {
        let dir = tempdir().expect("tempdir");
        let state = build_state(dir.path(), Arc::new(RecordingTransport::default()), true);
        seed_user(&state.store, "alice", "weekly").await;
        let app = app(state);
        let token = token("alice", "user");

        let request = axum::http::Request::builder()
            .method("GET")
            .uri("/export-config")
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .expect("request");
        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let disposition = response.headers()[header::CONTENT_DISPOSITION]
            .to_str()
            .expect("header");
        assert!(disposition.contains("hemodash-settings-alice.json"));
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        let body: Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(body["exportedBy"], "alice");
        assert!(body.get("exportDate").is_some());
    }

    #[tokio::test]
    async fn import_requires_all_three_indicator_maps() {
        let dir = tempdir().expect("tempdir");
        let app = app(build_state(dir.path(), Arc::new(RecordingTransport::default()), true));
        let token = token("alice", "user");

        let (status, _) = call(
            app.clone(),
            "POST",
            "/import-config",
            Some(&token),
            Some(json!({ "email": "x@example.com" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let document = json!({
            "username": "bob",
            "email": "bob@example.com",
            "frequency": "daily",
            "overviewIndicators": { "apheresis_donations": true },
            "apheresisIndicators": {},
            "wholeBloodIndicators": {},
            "exportedBy": "bob",
        });
        let (status, stored) = call(app, "POST", "/import-config", Some(&token), Some(document)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stored["username"], "alice");
        assert_eq!(stored["importedFrom"], "bob");
        assert!(stored.get("importedAt").is_some());
    }

    #[tokio::test]
    async fn email_config_never_exposes_the_credential() {
        let dir = tempdir().expect("tempdir");
        let app = app(build_state(dir.path(), Arc::new(RecordingTransport::default()), true));

        let (status, body) = call(
            app,
            "GET",
            "/email-config",
            Some(&token("alice", "user")),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["configured"], json!(true));
        assert_eq!(body["relayTokenLength"], json!("relay-credential-value".len()));
        assert!(!body.to_string().contains("relay-credential-value"));
    }

    #[tokio::test]
    async fn test_email_without_relay_credential_is_config_error() {
        let dir = tempdir().expect("tempdir");
        let app = app(build_state(dir.path(), Arc::new(RecordingTransport::default()), false));

        let (status, body) = call(
            app,
            "POST",
            "/test-email",
            Some(&token("alice", "user")),
            Some(json!({ "email": "qa@example.com" })),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["details"].as_str().unwrap_or("").contains("HEMODASH_RELAY_TOKEN"));
    }

    #[tokio::test]
    async fn test_email_sends_confirmation_document() {
        let dir = tempdir().expect("tempdir");
        let transport = Arc::new(RecordingTransport::default());
        let app = app(build_state(dir.path(), transport.clone(), true));

        let (status, body) = call(
            app,
            "POST",
            "/test-email",
            Some(&token("alice", "user")),
            Some(json!({ "email": "qa@example.com" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], json!(true));
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "qa@example.com");
        assert!(sent[0].subject.contains("Test Email"));
    }

    #[tokio::test]
    async fn scheduler_status_reports_subscriber_counts() {
        let dir = tempdir().expect("tempdir");
        let state = build_state(dir.path(), Arc::new(RecordingTransport::default()), true);
        seed_user(&state.store, "alice", "daily").await;
        seed_user(&state.store, "bob", "weekly").await;
        let app = app(state);

        let (status, body) = call(
            app,
            "GET",
            "/scheduler-status",
            Some(&token("alice", "user")),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["totalSubscribers"], 2);
        assert_eq!(body["daily"], 1);
        assert_eq!(body["weekly"], 1);
        assert_eq!(body["sendHour"], 7);
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let verifier = TokenVerifier::new(SECRET);
        let token = verifier
            .issue(&Claims {
                sub: "alice".to_string(),
                role: "user".to_string(),
                exp: Utc::now().timestamp() - 60,
            })
            .expect("issue");
        assert!(verifier.verify(&token).is_none());

        let valid = verifier
            .issue(&Claims {
                sub: "alice".to_string(),
                role: "user".to_string(),
                exp: Utc::now().timestamp() + 60,
            })
            .expect("issue");
        assert_eq!(verifier.verify(&valid).map(|c| c.sub), Some("alice".to_string()));

        let other = TokenVerifier::new("different-secret");
        assert!(other.verify(&valid).is_none());
    }
}
