//! Portal row extraction + the per-identity scrape session for the PJN portal.

use std::collections::HashSet;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use futures::FutureExt;
use pjnw_core::{escape_markup, Identity, Record, RecordKind};
use pjnw_storage::{DriverError, WebDriverConfig, WebDriverSession};
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use url::Url;

pub const CRATE_NAME: &str = "pjnw-portal";

pub const LOGIN_URL: &str = "https://sso.pjn.gov.ar/auth/realms/pjn/protocol/openid-connect/auth?client_id=pjn-portal&redirect_uri=https%3A%2F%2Fportalpjn.pjn.gov.ar%2F&response_mode=fragment&response_type=code&scope=openid";
pub const PORTAL_BASE_URL: &str = "https://portalpjn.pjn.gov.ar/";

pub const USERNAME_SELECTOR: &str = "#username";
pub const PASSWORD_SELECTOR: &str = "#password";
pub const LOGIN_BUTTON_SELECTOR: &str = "#kc-login";
pub const ROW_SELECTOR: &str = "tr.MuiBox-root";
pub const CASE_SELECTOR: &str = "p.MuiTypography-root.MuiTypography-body1.w-full.css-11dlpbt";
pub const TITLE_SELECTOR: &str = "p.MuiTypography-root.MuiTypography-body1.w-full.italic.css-4icvzy";
pub const LINK_SELECTOR: &str = r#"a[aria-label="Ver Causa"]"#;

static ROW: LazyLock<Selector> = LazyLock::new(|| static_selector(ROW_SELECTOR));
static ANY_ROW: LazyLock<Selector> = LazyLock::new(|| static_selector("tr"));
static CELL: LazyLock<Selector> = LazyLock::new(|| static_selector("td"));
static CASE: LazyLock<Selector> = LazyLock::new(|| static_selector(CASE_SELECTOR));
static TITLE: LazyLock<Selector> = LazyLock::new(|| static_selector(TITLE_SELECTOR));
static LINK: LazyLock<Selector> = LazyLock::new(|| static_selector(LINK_SELECTOR));

fn static_selector(css: &str) -> Selector {
    Selector::parse(css).expect("built-in selectors are valid CSS")
}

/// Outer markup of one update-table row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    pub html: String,
}

impl RawRow {
    pub fn new(html: impl Into<String>) -> Self {
        Self { html: html.into() }
    }

    fn preview(&self) -> String {
        self.html.chars().take(160).collect()
    }
}

/// Collects the distinct update rows present in a rendered page, in document order.
pub fn collect_rows(markup: &str) -> Vec<RawRow> {
    let document = Html::parse_document(markup);
    let mut seen = HashSet::new();
    document
        .select(&ROW)
        .map(|row| row.html())
        .filter(|html| seen.insert(html.clone()))
        .map(RawRow::new)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowSkip {
    #[error("malformed row: expected at least 3 cells, found {cells}")]
    Malformed { cells: usize },
    #[error("missing case/title")]
    MissingCaseOrTitle,
}

/// Turns one raw row into a record stamped with the current time.
pub fn extract_record(row: &RawRow, subject: &str) -> Result<Record, RowSkip> {
    extract_record_at(row, subject, Utc::now())
}

pub fn extract_record_at(
    row: &RawRow,
    subject: &str,
    scraped_at: DateTime<Utc>,
) -> Result<Record, RowSkip> {
    // Rows only survive HTML fragment parsing inside a table context.
    let fragment = Html::parse_fragment(&format!("<table><tbody>{}</tbody></table>", row.html));
    let Some(tr) = fragment.select(&ANY_ROW).next() else {
        return Err(RowSkip::Malformed { cells: 0 });
    };

    let cells = tr.select(&CELL).collect::<Vec<_>>();
    if cells.len() < 3 {
        return Err(RowSkip::Malformed { cells: cells.len() });
    }

    let kind = RecordKind::from_type_code(&element_text(cells[0]));
    let date_text = element_text(cells[2]);
    let event_date = parse_event_date(&date_text);

    let case_ref = tr.select(&CASE).next().map(element_text);
    let title = tr.select(&TITLE).next().map(element_text);
    let (Some(case_ref), Some(title)) = (case_ref, title) else {
        return Err(RowSkip::MissingCaseOrTitle);
    };

    if event_date.is_none() {
        warn!(subject, case_ref = %case_ref, date_text = %date_text, "unparseable event date; keeping row without a date");
    }

    let link = tr
        .select(&LINK)
        .next()
        .and_then(|a| a.value().attr("href"))
        .and_then(sanitize_link);

    let kind = match kind {
        RecordKind::Unknown(raw) => RecordKind::Unknown(escape_markup(&raw)),
        known => known,
    };

    Ok(Record::scraped(
        escape_markup(subject),
        kind,
        escape_markup(&case_ref),
        escape_markup(&title),
        event_date,
        link,
        scraped_at,
    ))
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

/// Parses the portal's `dd/mm/yyyy` dates.
pub fn parse_event_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text.trim(), "%d/%m/%Y").ok()
}

/// Resolves a row link against the portal and keeps it only when it is plain http(s).
pub fn sanitize_link(href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }
    let url = match Url::parse(href) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => Url::parse(PORTAL_BASE_URL).ok()?.join(href).ok()?,
        Err(_) => return None,
    };
    matches!(url.scheme(), "http" | "https").then(|| url.to_string())
}

/// Browser automation consumed by a portal session.
#[async_trait]
pub trait AutomationDriver: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), DriverError>;
    async fn wait_for_element(&self, selector: &str, timeout: Duration) -> Result<(), DriverError>;
    async fn send_keys(&self, selector: &str, text: &str) -> Result<(), DriverError>;
    async fn click(&self, selector: &str) -> Result<(), DriverError>;
    async fn current_markup(&self) -> Result<String, DriverError>;
    async fn refresh(&self) -> Result<(), DriverError>;
    async fn release(&self) -> Result<(), DriverError>;
}

/// Hands out one dedicated driver per session.
#[async_trait]
pub trait DriverLauncher: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn AutomationDriver>, DriverError>;
}

#[derive(Debug, Clone)]
pub struct WebDriverLauncher {
    config: WebDriverConfig,
}

impl WebDriverLauncher {
    pub fn new(config: WebDriverConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl DriverLauncher for WebDriverLauncher {
    async fn launch(&self) -> Result<Box<dyn AutomationDriver>, DriverError> {
        let session = WebDriverSession::start(&self.config).await?;
        Ok(Box::new(session))
    }
}

#[async_trait]
impl AutomationDriver for WebDriverSession {
    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        WebDriverSession::navigate(self, url).await
    }

    async fn wait_for_element(&self, selector: &str, timeout: Duration) -> Result<(), DriverError> {
        WebDriverSession::wait_for_element(self, selector, timeout)
            .await
            .map(|_| ())
    }

    async fn send_keys(&self, selector: &str, text: &str) -> Result<(), DriverError> {
        WebDriverSession::send_keys(self, selector, text).await
    }

    async fn click(&self, selector: &str) -> Result<(), DriverError> {
        WebDriverSession::click(self, selector).await
    }

    async fn current_markup(&self) -> Result<String, DriverError> {
        self.page_source().await
    }

    async fn refresh(&self) -> Result<(), DriverError> {
        WebDriverSession::refresh(self).await
    }

    async fn release(&self) -> Result<(), DriverError> {
        self.quit().await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SessionTimings {
    pub login_wait: Duration,
    pub content_wait: Duration,
    pub retry_delay: Duration,
    pub max_attempts: usize,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            login_wait: Duration::from_secs(20),
            content_wait: Duration::from_secs(30),
            retry_delay: Duration::from_secs(5),
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Init,
    Authenticating,
    AwaitingContent,
    RetryingContent,
    Extracting,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Authenticating => "authentication",
            Self::AwaitingContent => "content wait",
            Self::RetryingContent => "content retry",
            Self::Extracting => "extraction",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("login form did not appear within {}s", waited.as_secs())]
    AuthenticationTimeout { waited: Duration },
    #[error("automation failure during {phase}: {source}")]
    Transport {
        phase: SessionPhase,
        #[source]
        source: DriverError,
    },
}

impl SessionError {
    fn transport(phase: SessionPhase) -> impl FnOnce(DriverError) -> Self {
        move |source| Self::Transport { phase, source }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionStatus {
    Completed,
    NoUpdates,
    AuthenticationTimeout,
    TransportFault,
}

/// Outcome of one identity's session. Failures are reported here, never raised.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub subject: String,
    pub status: SessionStatus,
    pub summary: String,
    pub records: Vec<Record>,
    pub skipped_rows: usize,
}

/// Scrape of the update table for a single identity.
pub struct PortalSession {
    identity: Identity,
    launcher: Arc<dyn DriverLauncher>,
    timings: SessionTimings,
}

impl PortalSession {
    pub fn new(identity: Identity, launcher: Arc<dyn DriverLauncher>, timings: SessionTimings) -> Self {
        Self {
            identity,
            launcher,
            timings,
        }
    }

    /// Runs the session to completion. The driver is released on every path; a panic inside the
    /// session is re-raised only after release.
    pub async fn run(self) -> SessionReport {
        let span = info_span!(
            "portal_session",
            identity = %self.identity.key,
            subject = %self.identity.display_name
        );
        async move {
            info!("starting scrape");
            let driver = match self.launcher.launch().await {
                Ok(driver) => driver,
                Err(err) => return self.failure_report(SessionError::transport(SessionPhase::Init)(err)),
            };

            let outcome = AssertUnwindSafe(self.drive(driver.as_ref())).catch_unwind().await;
            if let Err(err) = driver.release().await {
                warn!(error = %err, "failed to release automation driver");
            }

            match outcome {
                Ok(Ok(report)) => report,
                Ok(Err(err)) => self.failure_report(err),
                Err(panic) => std::panic::resume_unwind(panic),
            }
        }
        .instrument(span)
        .await
    }

    async fn drive(&self, driver: &dyn AutomationDriver) -> Result<SessionReport, SessionError> {
        self.authenticate(driver).await?;
        let rows = self.await_rows(driver).await?;
        if rows.is_empty() {
            let summary = format!(
                "no updates found for {} after {} attempts",
                self.identity.display_name, self.timings.max_attempts
            );
            info!("{summary}");
            return Ok(SessionReport {
                subject: self.identity.display_name.clone(),
                status: SessionStatus::NoUpdates,
                summary,
                records: Vec::new(),
                skipped_rows: 0,
            });
        }
        Ok(self.extract(&rows))
    }

    async fn authenticate(&self, driver: &dyn AutomationDriver) -> Result<(), SessionError> {
        let phase = SessionPhase::Authenticating;
        driver
            .navigate(LOGIN_URL)
            .await
            .map_err(SessionError::transport(phase))?;
        match driver
            .wait_for_element(USERNAME_SELECTOR, self.timings.login_wait)
            .await
        {
            Ok(()) => {}
            Err(DriverError::Timeout { .. }) => {
                return Err(SessionError::AuthenticationTimeout {
                    waited: self.timings.login_wait,
                })
            }
            Err(err) => return Err(SessionError::transport(phase)(err)),
        }
        driver
            .send_keys(USERNAME_SELECTOR, &self.identity.key)
            .await
            .map_err(SessionError::transport(phase))?;
        driver
            .send_keys(PASSWORD_SELECTOR, &self.identity.secret)
            .await
            .map_err(SessionError::transport(phase))?;
        driver
            .click(LOGIN_BUTTON_SELECTOR)
            .await
            .map_err(SessionError::transport(phase))?;
        Ok(())
    }

    /// Waits for update rows, reloading between attempts. An empty result after the last
    /// attempt is a valid outcome.
    async fn await_rows(&self, driver: &dyn AutomationDriver) -> Result<Vec<RawRow>, SessionError> {
        let max_attempts = self.timings.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            let phase = if attempt == 1 {
                SessionPhase::AwaitingContent
            } else {
                tokio::time::sleep(self.timings.retry_delay).await;
                driver
                    .refresh()
                    .await
                    .map_err(SessionError::transport(SessionPhase::RetryingContent))?;
                SessionPhase::RetryingContent
            };

            match driver
                .wait_for_element(ROW_SELECTOR, self.timings.content_wait)
                .await
            {
                Ok(()) => {
                    let markup = driver
                        .current_markup()
                        .await
                        .map_err(SessionError::transport(phase))?;
                    let rows = collect_rows(&markup);
                    if !rows.is_empty() {
                        return Ok(rows);
                    }
                }
                Err(DriverError::Timeout { .. }) => {}
                Err(err) => return Err(SessionError::transport(phase)(err)),
            }
            warn!(attempt, max_attempts, "no update rows yet");
        }
        Ok(Vec::new())
    }

    fn extract(&self, rows: &[RawRow]) -> SessionReport {
        let subject = &self.identity.display_name;
        let mut records = Vec::with_capacity(rows.len());
        let mut skipped_rows = 0usize;
        for row in rows {
            match extract_record(row, subject) {
                Ok(record) => records.push(record),
                Err(skip) => {
                    skipped_rows += 1;
                    warn!(reason = %skip, row = %row.preview(), "skipping row");
                }
            }
        }
        let summary = format!(
            "scrape for {subject}: found {} rows, kept {} records",
            rows.len(),
            records.len()
        );
        info!("{summary}");
        SessionReport {
            subject: subject.clone(),
            status: SessionStatus::Completed,
            summary,
            records,
            skipped_rows,
        }
    }

    fn failure_report(&self, err: SessionError) -> SessionReport {
        let subject = self.identity.display_name.clone();
        let (status, summary) = match &err {
            SessionError::AuthenticationTimeout { .. } => (
                SessionStatus::AuthenticationTimeout,
                format!("timeout while scraping {subject}: {err}"),
            ),
            SessionError::Transport { .. } => (
                SessionStatus::TransportFault,
                format!("scrape for {subject} aborted: {err}"),
            ),
        };
        warn!("{summary}");
        SessionReport {
            subject,
            status,
            summary,
            records: Vec::new(),
            skipped_rows: 0,
        }
    }
}
