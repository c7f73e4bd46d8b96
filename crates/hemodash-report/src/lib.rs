//! Report assembly and delivery: mail transport boundary, HTML renderer,
//! the delivery orchestrator and its cron scheduling.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Timelike, Utc};
use futures::future::join_all;
use hemodash_core::{
    descriptor, is_due, report_window, subject_line, AggregationRow, Category, EmailTemplate,
    Frequency, IndicatorDescriptor, IndicatorValue, UserPreference,
};
use hemodash_query::IndicatorExecutor;
use hemodash_storage::{PreferenceStore, TemplateStore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "hemodash-report";

#[derive(Debug, Clone)]
pub struct ReportConfig {
    pub relay_url: String,
    pub relay_token: Option<String>,
    pub from_address: String,
    pub send_hour: u32,
    pub report_cron: String,
    pub scheduler_enabled: bool,
    pub dashboard_url: String,
    pub http_timeout_secs: u64,
}

impl ReportConfig {
    pub fn from_env() -> Self {
        Self {
            relay_url: std::env::var("HEMODASH_RELAY_URL")
                .unwrap_or_else(|_| "http://localhost:2525/send".to_string()),
            relay_token: std::env::var("HEMODASH_RELAY_TOKEN")
                .ok()
                .filter(|t| !t.is_empty()),
            from_address: std::env::var("HEMODASH_FROM_ADDRESS")
                .unwrap_or_else(|_| "reports@hemodash.local".to_string()),
            send_hour: std::env::var("HEMODASH_SEND_HOUR")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|h| *h < 24)
                .unwrap_or(7),
            report_cron: std::env::var("HEMODASH_REPORT_CRON")
                .unwrap_or_else(|_| "0 0 7 * * *".to_string()),
            scheduler_enabled: std::env::var("HEMODASH_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            dashboard_url: std::env::var("HEMODASH_DASHBOARD_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            http_timeout_secs: std::env::var("HEMODASH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        }
    }

    /// Non-secret view of the relay credential for config endpoints: its
    /// length and a masked shape, never the value itself.
    pub fn masked_relay_token(&self) -> (usize, String) {
        match self.relay_token.as_deref() {
            Some(token) => (token.len(), "*".repeat(token.len().min(12))),
            None => (0, String::new()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboundEmail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html: String,
}

#[derive(Debug, Clone)]
pub struct SentReceipt {
    pub message_id: String,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("mail relay credential is not configured")]
    NotConfigured,
    #[error("relay returned status {status}: {body}")]
    RelayStatus { status: u16, body: String },
    #[error("relay request failed: {0}")]
    Request(#[from] reqwest::Error),
}

impl TransportError {
    /// Transient failures may succeed on a later re-invocation; permanent
    /// ones will not. Mirrors the retry disposition used for HTTP fetches:
    /// 5xx and 429 statuses plus connect/timeout request errors retry.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::NotConfigured => false,
            TransportError::RelayStatus { status, .. } => *status >= 500 || *status == 429,
            TransportError::Request(err) => err.is_timeout() || err.is_connect() || err.is_request(),
        }
    }
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, email: &OutboundEmail) -> Result<SentReceipt, TransportError>;
}

/// Posts outbound mail as JSON to an HTTP relay endpoint.
pub struct HttpRelayTransport {
    client: reqwest::Client,
    relay_url: String,
    relay_token: Option<String>,
}

impl HttpRelayTransport {
    pub fn new(config: &ReportConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .context("building mail relay client")?;
        Ok(Self {
            client,
            relay_url: config.relay_url.clone(),
            relay_token: config.relay_token.clone(),
        })
    }
}

#[async_trait]
impl MailTransport for HttpRelayTransport {
    async fn send(&self, email: &OutboundEmail) -> Result<SentReceipt, TransportError> {
        let token = self
            .relay_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(TransportError::NotConfigured)?;

        let response = self
            .client
            .post(&self.relay_url)
            .bearer_auth(token)
            .json(email)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::RelayStatus {
                status: status.as_u16(),
                body,
            });
        }

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct RelayReceipt {
            message_id: Option<String>,
        }
        let receipt: RelayReceipt = response.json().await?;
        Ok(SentReceipt {
            message_id: receipt
                .message_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Bounded retry around a single transport call. Only transient failures
/// retry. Used at the HTTP-route boundary; the orchestrator run loop always
/// dispatches exactly once per user.
pub async fn send_with_retry(
    transport: &dyn MailTransport,
    email: &OutboundEmail,
    policy: BackoffPolicy,
) -> Result<SentReceipt, TransportError> {
    let mut attempt = 0usize;
    loop {
        match transport.send(email).await {
            Ok(receipt) => return Ok(receipt),
            Err(err) if err.is_transient() && attempt < policy.max_retries => {
                warn!(attempt, error = %err, "transient relay failure, retrying");
                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// One indicator's contribution to a report. A failed or empty fetch still
/// produces a section; the report never aborts over a single indicator.
pub struct IndicatorSection {
    pub descriptor: &'static IndicatorDescriptor,
    pub outcome: SectionOutcome,
}

pub enum SectionOutcome {
    Rows(Vec<AggregationRow>),
    Empty,
    Unavailable,
}

pub struct AssembledReport {
    pub subject: String,
    pub html: String,
    pub indicator_count: usize,
}

/// Builds the full report for one user: resolves the selected indicators,
/// fans the fetches out concurrently, and renders the HTML document with the
/// user's template. Per-indicator failures degrade to placeholder cards.
pub async fn assemble(
    preference: &UserPreference,
    executor: &dyn IndicatorExecutor,
    templates: &TemplateStore,
    config: &ReportConfig,
    now: DateTime<Utc>,
) -> AssembledReport {
    // Unparseable stored frequencies still get a report when explicitly
    // requested; weekly is the widest commonly used window.
    let frequency = Frequency::parse(&preference.frequency).unwrap_or(Frequency::Weekly);
    let window = report_window(frequency, now);

    let keys = preference.selected_keys();
    let fetches = keys.iter().map(|key| executor.fetch(key, &window));
    let results = join_all(fetches).await;

    let mut sections = Vec::with_capacity(keys.len());
    for (key, result) in keys.iter().zip(results) {
        let Some(descriptor) = descriptor(key.as_str()) else {
            continue;
        };
        let outcome = match result {
            Ok(rows) if rows.is_empty() => SectionOutcome::Empty,
            Ok(rows) => SectionOutcome::Rows(rows),
            Err(err) => {
                warn!(indicator = %key, error = %err, "indicator fetch failed, rendering placeholder");
                SectionOutcome::Unavailable
            }
        };
        sections.push(IndicatorSection { descriptor, outcome });
    }

    let template = templates.get(&preference.template_id).await;
    let subject = subject_line(&preference.frequency, now.date_naive());
    let html = render_report(
        preference,
        &sections,
        &template,
        now.date_naive().format("%Y-%m-%d").to_string(),
        &config.dashboard_url,
    );
    AssembledReport {
        subject,
        html,
        indicator_count: sections.len(),
    }
}

/// Lightens (positive amount) or darkens (negative) a `#rrggbb` color.
/// Unparseable input passes through unchanged.
pub fn adjust_color(hex: &str, amount: i16) -> String {
    let raw = hex.trim().trim_start_matches('#');
    if raw.len() != 6 {
        return hex.to_string();
    }
    let Ok(value) = u32::from_str_radix(raw, 16) else {
        return hex.to_string();
    };
    let channel = |shift: u32| -> u8 {
        let c = ((value >> shift) & 0xff) as i32;
        (c + i32::from(amount)).clamp(0, 255) as u8
    };
    format!("#{:02x}{:02x}{:02x}", channel(16), channel(8), channel(0))
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

pub fn render_report(
    preference: &UserPreference,
    sections: &[IndicatorSection],
    template: &EmailTemplate,
    generated_on: String,
    dashboard_url: &str,
) -> String {
    let background = template.background_color.as_deref().unwrap_or("#f4f6f8");
    let text = template.text_color.as_deref().unwrap_or("#333333");
    let header_text = template.header_text_color.as_deref().unwrap_or("#ffffff");
    let footer_bg = template.footer_background.as_deref().unwrap_or("#eceff1");
    let footer_text = template.footer_text_color.as_deref().unwrap_or("#607d8b");
    let header_from = &template.color;
    let header_to = adjust_color(&template.color, -30);

    let mut body = String::new();
    for category in Category::ORDERED {
        let group: Vec<&IndicatorSection> = sections
            .iter()
            .filter(|s| s.descriptor.category == category)
            .collect();
        if group.is_empty() {
            continue;
        }
        let _ = write!(
            body,
            "<h2 style=\"color:{};border-bottom:2px solid {};padding-bottom:6px;\">{}</h2>",
            text,
            template.accent,
            escape_html(category.label())
        );
        for section in group {
            body.push_str(&render_section(section, template, text));
        }
    }

    format!(
        "<!DOCTYPE html>\
<html><head><meta charset=\"utf-8\"></head>\
<body style=\"margin:0;background:{background};color:{text};font-family:Helvetica,Arial,sans-serif;\">\
<div style=\"max-width:640px;margin:0 auto;\">\
<div style=\"background:linear-gradient(135deg,{header_from},{header_to});color:{header_text};padding:24px;\">\
<h1 style=\"margin:0;font-size:22px;\">Indicator Dashboard</h1>\
<p style=\"margin:4px 0 0;\">Report for {username} &middot; {generated_on}</p>\
</div>\
<div style=\"padding:16px 24px;\">{body}</div>\
<div style=\"background:{footer_bg};color:{footer_text};padding:16px 24px;font-size:12px;\">\
<p style=\"margin:0;\">Generated on {generated_on}. Manage your subscription on the \
<a href=\"{dashboard_url}\" style=\"color:{footer_text};\">dashboard</a>.</p>\
</div>\
</div></body></html>",
        username = escape_html(&preference.username),
    )
}

fn render_section(section: &IndicatorSection, template: &EmailTemplate, text: &str) -> String {
    let mut card = format!(
        "<div style=\"background:#ffffff;border-left:4px solid {};border-radius:4px;\
padding:12px 16px;margin:12px 0;box-shadow:0 1px 2px rgba(0,0,0,0.08);\">\
<h3 style=\"margin:0 0 8px;color:{};font-size:15px;\">{}</h3>",
        template.accent,
        text,
        escape_html(section.descriptor.title)
    );
    match &section.outcome {
        SectionOutcome::Rows(rows) => {
            // Rows arrive sorted ascending, so the last one is the most
            // recent period; that is the one the report shows.
            if let Some(row) = rows.last() {
                card.push_str(&render_row(row, template));
            }
        }
        SectionOutcome::Empty => {
            card.push_str(
                "<p style=\"margin:0;color:#90a4ae;\">No data recorded for this indicator in the selected period.</p>",
            );
        }
        SectionOutcome::Unavailable => {
            card.push_str(
                "<p style=\"margin:0;color:#90a4ae;\">Data for this indicator is temporarily unavailable.</p>",
            );
        }
    }
    card.push_str("</div>");
    card
}

fn render_row(row: &AggregationRow, template: &EmailTemplate) -> String {
    let period = escape_html(&row.period_label());
    match &row.value {
        IndicatorValue::Scalar(value) => format!(
            "<div style=\"display:flex;justify-content:space-between;padding:4px 0;\">\
<span>{period}</span><strong style=\"color:{};\">{}</strong></div>",
            template.color,
            escape_html(&value.to_string())
        ),
        IndicatorValue::Dual { first, second } => format!(
            "<div style=\"display:flex;justify-content:space-between;padding:4px 0;\">\
<span>{period}</span><strong style=\"color:{};\">{first} / {second}</strong></div>",
            template.color
        ),
        IndicatorValue::Ranked(entries) => {
            if entries.is_empty() {
                return format!(
                    "<p style=\"margin:4px 0;color:#90a4ae;\">No alarms recorded in {period}.</p>"
                );
            }
            let mut table = format!(
                "<p style=\"margin:4px 0;font-weight:bold;\">{period}</p>\
<table style=\"width:100%;border-collapse:collapse;font-size:13px;\">\
<tr style=\"background:{};color:#ffffff;\">\
<th style=\"padding:4px;text-align:left;\">#</th>\
<th style=\"padding:4px;text-align:left;\">Alarm</th>\
<th style=\"padding:4px;text-align:right;\">Count</th>\
<th style=\"padding:4px;text-align:right;\">%</th></tr>",
                template.color
            );
            for entry in entries {
                let label = match &entry.detail {
                    Some(detail) => format!("{} ({})", entry.label, detail),
                    None => entry.label.clone(),
                };
                let _ = write!(
                    table,
                    "<tr><td style=\"padding:4px;\">{}</td>\
<td style=\"padding:4px;\">{}</td>\
<td style=\"padding:4px;text-align:right;\">{}</td>\
<td style=\"padding:4px;text-align:right;\">{:.1}%</td></tr>",
                    entry.rank,
                    escape_html(&label),
                    entry.frequency,
                    entry.percent
                );
            }
            table.push_str("</table>");
            table
        }
    }
}

/// Overrides for a delivery run. The zero-value is a manual run over all
/// eligible users; [`RunOptions::scheduled`] marks the cron path, which is
/// additionally gated on the configured send hour.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub target_username: Option<String>,
    pub test_email: Option<String>,
    pub dry_run: bool,
    pub scheduled: bool,
}

impl RunOptions {
    pub fn scheduled() -> Self {
        Self {
            scheduled: true,
            ..Self::default()
        }
    }

    pub fn targeted(username: impl Into<String>) -> Self {
        Self {
            target_username: Some(username.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Skipped,
    /// Reserved in the wire contract for run-level failures. Per-user
    /// delivery errors are isolated into `DeliveryOutcome`s and leave the
    /// run `Completed` with a nonzero `failed` count, so the orchestrator
    /// itself never produces this value.
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub total_users: usize,
    pub success: usize,
    pub failed: usize,
    pub dry_run: bool,
    pub details: Vec<DeliveryOutcome>,
}

impl RunSummary {
    fn skipped(reason: &str, dry_run: bool) -> Self {
        Self {
            status: RunStatus::Skipped,
            reason: Some(reason.to_string()),
            total_users: 0,
            success: 0,
            failed: 0,
            dry_run,
            details: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryOutcome {
    pub email: String,
    pub username: String,
    pub frequency: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub simulated: bool,
    /// Route-boundary hint for re-invoking a targeted run; not part of the
    /// wire shape.
    #[serde(skip_serializing)]
    pub transient: bool,
}

/// Drives a full delivery run: eligibility, assembly, dispatch, summary.
/// One user's failure never aborts the rest of the run.
pub struct Orchestrator {
    store: Arc<PreferenceStore>,
    templates: Arc<TemplateStore>,
    executor: Arc<dyn IndicatorExecutor>,
    transport: Arc<dyn MailTransport>,
    config: ReportConfig,
    run_gate: Mutex<()>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<PreferenceStore>,
        templates: Arc<TemplateStore>,
        executor: Arc<dyn IndicatorExecutor>,
        transport: Arc<dyn MailTransport>,
        config: ReportConfig,
    ) -> Self {
        Self {
            store,
            templates,
            executor,
            transport,
            config,
            run_gate: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ReportConfig {
        &self.config
    }

    pub async fn run(&self, options: &RunOptions) -> RunSummary {
        self.run_at(options, Utc::now()).await
    }

    /// Run with an explicit clock, the testable entry point. At most one run
    /// executes at a time; an overlapping invocation is skipped, not queued.
    pub async fn run_at(&self, options: &RunOptions, now: DateTime<Utc>) -> RunSummary {
        let Ok(_guard) = self.run_gate.try_lock() else {
            return RunSummary::skipped("run_in_progress", options.dry_run);
        };

        if options.scheduled && now.hour() != self.config.send_hour {
            return RunSummary::skipped("outside_send_window", options.dry_run);
        }

        let all = self.store.get_all().await;
        if all.is_empty() {
            return RunSummary::skipped("no_configurations", options.dry_run);
        }

        let today = now.date_naive();
        let mut recipients: Vec<UserPreference> = match &options.target_username {
            Some(target) => match all.get(target) {
                Some(pref) if !pref.email.is_empty() => vec![pref.clone()],
                _ => return RunSummary::skipped("user_not_found", options.dry_run),
            },
            None => all
                .into_values()
                .filter(|p| !p.email.is_empty() && is_due(&p.frequency, today))
                .collect(),
        };
        recipients.sort_by(|a, b| a.username.cmp(&b.username));

        let run_id = Uuid::new_v4();
        info!(
            %run_id,
            users = recipients.len(),
            dry_run = options.dry_run,
            "starting report run"
        );

        let mut details = Vec::with_capacity(recipients.len());
        for preference in &recipients {
            details.push(self.deliver(preference, options, now).await);
        }

        let success = details.iter().filter(|d| d.success).count();
        let failed = details.len() - success;
        info!(%run_id, success, failed, "report run finished");
        RunSummary {
            status: RunStatus::Completed,
            reason: None,
            total_users: details.len(),
            success,
            failed,
            dry_run: options.dry_run,
            details,
        }
    }

    /// Assembles and dispatches one user's report. Exactly one transport
    /// attempt; redundancy is a re-invoked run, never a loop here.
    async fn deliver(
        &self,
        preference: &UserPreference,
        options: &RunOptions,
        now: DateTime<Utc>,
    ) -> DeliveryOutcome {
        let destination = options
            .test_email
            .clone()
            .unwrap_or_else(|| preference.email.clone());

        let report = assemble(
            preference,
            self.executor.as_ref(),
            &self.templates,
            &self.config,
            now,
        )
        .await;

        if options.dry_run {
            info!(
                username = %preference.username,
                to = %destination,
                indicators = report.indicator_count,
                "dry run, delivery simulated"
            );
            return DeliveryOutcome {
                email: destination,
                username: preference.username.clone(),
                frequency: preference.frequency.clone(),
                success: true,
                error: None,
                message_id: Some(format!("dry-run-{}", Uuid::new_v4())),
                simulated: true,
                transient: false,
            };
        }

        let email = OutboundEmail {
            from: self.config.from_address.clone(),
            to: destination.clone(),
            subject: report.subject,
            html: report.html,
        };
        match self.transport.send(&email).await {
            Ok(receipt) => DeliveryOutcome {
                email: destination,
                username: preference.username.clone(),
                frequency: preference.frequency.clone(),
                success: true,
                error: None,
                message_id: Some(receipt.message_id),
                simulated: false,
                transient: false,
            },
            Err(err) => {
                warn!(username = %preference.username, error = %err, "delivery failed");
                DeliveryOutcome {
                    email: destination,
                    username: preference.username.clone(),
                    frequency: preference.frequency.clone(),
                    success: false,
                    error: Some(err.to_string()),
                    message_id: None,
                    simulated: false,
                    transient: err.is_transient(),
                }
            }
        }
    }
}

pub async fn build_scheduler(
    orchestrator: Arc<Orchestrator>,
    config: &ReportConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.report_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let orchestrator = orchestrator.clone();
        Box::pin(async move {
            let summary = orchestrator.run(&RunOptions::scheduled()).await;
            info!(
                status = ?summary.status,
                success = summary.success,
                failed = summary.failed,
                "scheduled report run finished"
            );
        })
    })
    .with_context(|| format!("creating report job for cron {cron}"))?;
    sched.add(job).await.context("adding report job")?;
    Ok(Some(sched))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub enabled: bool,
    pub cron: String,
    pub send_hour: u32,
    pub next_execution: DateTime<Utc>,
    pub total_subscribers: usize,
    pub daily: usize,
    pub weekly: usize,
    pub monthly: usize,
    pub next_execution_recipients: usize,
    pub is_monday: bool,
    pub is_first_day_of_month: bool,
}

/// Projection of the next scheduled run: when it fires and who would
/// receive mail if preferences stay as they are now.
pub async fn scheduler_status(
    store: &PreferenceStore,
    config: &ReportConfig,
    now: DateTime<Utc>,
) -> SchedulerStatus {
    let all = store.get_all().await;
    let subscribed: Vec<&UserPreference> = all.values().filter(|p| !p.email.is_empty()).collect();
    let count = |f: Frequency| {
        subscribed
            .iter()
            .filter(|p| Frequency::parse(&p.frequency) == Some(f))
            .count()
    };

    let today = now.date_naive();
    let next_date = if now.hour() < config.send_hour {
        today
    } else {
        today.succ_opt().unwrap_or(today)
    };
    let next_execution = next_date
        .and_hms_opt(config.send_hour, 0, 0)
        .map(|dt| dt.and_utc())
        .unwrap_or(now);
    let recipients = subscribed
        .iter()
        .filter(|p| is_due(&p.frequency, next_date))
        .count();

    SchedulerStatus {
        enabled: config.scheduler_enabled,
        cron: config.report_cron.clone(),
        send_hour: config.send_hour,
        next_execution,
        total_subscribers: subscribed.len(),
        daily: count(Frequency::Daily),
        weekly: count(Frequency::Weekly),
        monthly: count(Frequency::Monthly),
        next_execution_recipients: recipients,
        is_monday: next_date.weekday() == chrono::Weekday::Mon,
        is_first_day_of_month: next_date.day() == 1,
    }
}

/// Test doubles shared with the web crate's route tests.
pub mod testing {
    use super::*;
    use hemodash_core::{IndicatorKey, ReportWindow};
    use hemodash_query::QueryError;
    use std::sync::Mutex as StdMutex;

    /// Executor returning canned rows per indicator key; unknown keys fail
    /// transiently.
    #[derive(Default)]
    pub struct StaticExecutor {
        rows: HashMap<String, Vec<AggregationRow>>,
    }

    impl StaticExecutor {
        pub fn with_rows(mut self, key: &str, rows: Vec<AggregationRow>) -> Self {
            self.rows.insert(key.to_string(), rows);
            self
        }
    }

    #[async_trait]
    impl IndicatorExecutor for StaticExecutor {
        async fn fetch(
            &self,
            key: &IndicatorKey,
            _window: &ReportWindow,
        ) -> Result<Vec<AggregationRow>, QueryError> {
            self.rows
                .get(key.as_str())
                .cloned()
                .ok_or_else(|| QueryError::Transient("no canned rows".to_string()))
        }
    }

    /// Transport recording every outbound email; optionally fails for one
    /// destination address, either indefinitely or for a limited number of
    /// attempts.
    #[derive(Default)]
    pub struct RecordingTransport {
        pub sent: StdMutex<Vec<OutboundEmail>>,
        pub fail_for: Option<String>,
        pub fail_transiently: bool,
        remaining_failures: StdMutex<Option<usize>>,
        attempts: StdMutex<usize>,
    }

    impl RecordingTransport {
        pub fn failing_for(destination: &str, transiently: bool) -> Self {
            Self {
                fail_for: Some(destination.to_string()),
                fail_transiently: transiently,
                ..Self::default()
            }
        }

        /// Rejects `destination` with a transient status a fixed number of
        /// times, then delivers normally.
        pub fn recovering_after(destination: &str, failures: usize) -> Self {
            Self {
                fail_for: Some(destination.to_string()),
                fail_transiently: true,
                remaining_failures: StdMutex::new(Some(failures)),
                ..Self::default()
            }
        }

        pub fn sent_count(&self) -> usize {
            self.sent.lock().map(|s| s.len()).unwrap_or(0)
        }

        /// Total `send` calls, rejected attempts included.
        pub fn attempt_count(&self) -> usize {
            self.attempts.lock().map(|a| *a).unwrap_or(0)
        }

        fn take_failure(&self) -> bool {
            let mut remaining = self
                .remaining_failures
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            match remaining.as_mut() {
                None => true,
                Some(0) => false,
                Some(n) => {
                    *n -= 1;
                    true
                }
            }
        }
    }

    #[async_trait]
    impl MailTransport for RecordingTransport {
        async fn send(&self, email: &OutboundEmail) -> Result<SentReceipt, TransportError> {
            *self.attempts.lock().unwrap_or_else(|p| p.into_inner()) += 1;
            if self.fail_for.as_deref() == Some(email.to.as_str()) && self.take_failure() {
                let status = if self.fail_transiently { 503 } else { 400 };
                return Err(TransportError::RelayStatus {
                    status,
                    body: "rejected by test transport".to_string(),
                });
            }
            let mut sent = self.sent.lock().unwrap_or_else(|p| p.into_inner());
            sent.push(email.clone());
            Ok(SentReceipt {
                message_id: format!("test-{}", sent.len()),
            })
        }
    }
}
