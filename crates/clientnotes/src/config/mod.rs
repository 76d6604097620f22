pub mod loader;
pub mod schema;

pub use loader::{load_config, load_config_from_str, validate_config, MAX_WORKER_COUNT};
pub use schema::{
    Config, LoggingConfig, MonthlySchedule, RemoteConfig, RemoteSelectors, RetryConfig,
    ScheduleConfig, SessionConfig, WeeklySchedule,
};
