use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::retry::{Backoff, RetryPolicy};
use crate::secrets::CredentialsConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub version: String,
    pub output_directory: String,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Defaults to `~/.clientnotes/data/clientnotes.db`.
    #[serde(default)]
    pub database_path: Option<String>,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_worker_count() -> usize {
    num_cpus::get().clamp(1, 4)
}

fn default_true() -> bool {
    true
}

/// How to reach and drive the remote application.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteConfig {
    #[serde(default = "default_webdriver_url")]
    pub webdriver_url: String,
    #[serde(default = "default_browser")]
    pub browser: String,
    #[serde(default = "default_true")]
    pub headless: bool,
    #[serde(default)]
    pub login_url: String,
    #[serde(default)]
    pub report_url: String,
    /// Client search page; also the view reloaded before enrichment.
    #[serde(default)]
    pub search_url: String,
    #[serde(default = "default_download_directory")]
    pub download_directory: String,
    /// Upper bound on any single wait inside the browser.
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,
    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,
    /// `strftime` format the report form expects.
    #[serde(default = "default_date_format")]
    pub date_format: String,
    #[serde(default)]
    pub selectors: RemoteSelectors,
    /// Output column name to the CSS selector holding its value on the
    /// client profile page.
    #[serde(default = "default_record_fields")]
    pub record_fields: BTreeMap<String, String>,
}

fn default_webdriver_url() -> String {
    "http://localhost:9515".to_string()
}

fn default_browser() -> String {
    "chrome".to_string()
}

fn default_download_directory() -> String {
    "~/.clientnotes/downloads".to_string()
}

fn default_operation_timeout() -> u64 {
    20
}

fn default_download_timeout() -> u64 {
    180
}

fn default_date_format() -> String {
    "%m/%d/%Y".to_string()
}

fn default_record_fields() -> BTreeMap<String, String> {
    [
        ("case_manager", "#CaseManager"),
        ("med_record", "#MedRecordNumber"),
        ("phone_1", "#Phone1"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            webdriver_url: default_webdriver_url(),
            browser: default_browser(),
            headless: true,
            login_url: String::new(),
            report_url: String::new(),
            search_url: String::new(),
            download_directory: default_download_directory(),
            operation_timeout_secs: default_operation_timeout(),
            download_timeout_secs: default_download_timeout(),
            date_format: default_date_format(),
            selectors: RemoteSelectors::default(),
            record_fields: default_record_fields(),
        }
    }
}

/// CSS selectors for the elements the target interacts with.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RemoteSelectors {
    pub agency_id: String,
    pub email: String,
    pub password: String,
    pub submit: String,
    /// Present only once login succeeded.
    pub logged_in: String,
    pub login_error: String,
    pub start_date: String,
    pub end_date: String,
    pub export_button: String,
    pub client_list: String,
    pub search_box: String,
    pub search_button: String,
    pub search_result: String,
    pub record_loaded: String,
}

impl Default for RemoteSelectors {
    fn default() -> Self {
        Self {
            agency_id: "#AgencyId".to_string(),
            email: "#Email".to_string(),
            password: "#Password".to_string(),
            submit: "button[type=submit]".to_string(),
            logged_in: "#mainMenu".to_string(),
            login_error: ".validation-summary-errors".to_string(),
            start_date: "#StartDate".to_string(),
            end_date: "#EndDate".to_string(),
            export_button: "#btnExport".to_string(),
            client_list: "#clientList".to_string(),
            search_box: "#txtClientSearch".to_string(),
            search_button: "#btnSearch".to_string(),
            search_result: "#searchResults a".to_string(),
            record_loaded: "#clientProfile".to_string(),
        }
    }
}

/// Keep-alive and re-authentication bounds for one remote session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    #[serde(default = "default_idle_threshold")]
    pub idle_threshold_secs: u64,
    #[serde(default = "default_max_relogin_attempts")]
    pub max_relogin_attempts: u32,
    #[serde(default = "default_relogin_backoff")]
    pub relogin_backoff: Backoff,
}

fn default_idle_threshold() -> u64 {
    300
}

fn default_max_relogin_attempts() -> u32 {
    3
}

fn default_relogin_backoff() -> Backoff {
    Backoff::Fixed { delay_ms: 2_000 }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_threshold_secs: default_idle_threshold(),
            max_relogin_attempts: default_max_relogin_attempts(),
            relogin_backoff: default_relogin_backoff(),
        }
    }
}

/// Retry budgets for the three flaky call sites.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "RetryPolicy::login")]
    pub login: RetryPolicy,
    #[serde(default = "RetryPolicy::export")]
    pub export: RetryPolicy,
    #[serde(default = "RetryPolicy::lookup")]
    pub lookup: RetryPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            login: RetryPolicy::login(),
            export: RetryPolicy::export(),
            lookup: RetryPolicy::lookup(),
        }
    }
}

/// Recurring runs. A `null` cadence disables it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_weekly")]
    pub weekly: Option<WeeklySchedule>,
    #[serde(default = "default_monthly")]
    pub monthly: Option<MonthlySchedule>,
}

fn default_weekly() -> Option<WeeklySchedule> {
    Some(WeeklySchedule::default())
}

fn default_monthly() -> Option<MonthlySchedule> {
    Some(MonthlySchedule::default())
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            weekly: default_weekly(),
            monthly: default_monthly(),
        }
    }
}

/// Local time of week. `weekday` counts from Monday = 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WeeklySchedule {
    pub weekday: u32,
    pub hour: u32,
    #[serde(default)]
    pub minute: u32,
}

impl Default for WeeklySchedule {
    fn default() -> Self {
        Self {
            weekday: 1,
            hour: 9,
            minute: 0,
        }
    }
}

/// Local time of month. `day` stops at 28 so every month has it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonthlySchedule {
    pub day: u32,
    pub hour: u32,
    #[serde(default)]
    pub minute: u32,
}

impl Default for MonthlySchedule {
    fn default() -> Self {
        Self {
            day: 1,
            hour: 9,
            minute: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Filter directive, overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}
