pub mod loader;
pub mod schema;

pub use loader::{load_settings, load_settings_from_str, validate_settings};
pub use schema::{
    LoggingSettings, ProfileSettings, RetrySettings, SchedulerSettings, Settings,
    StorageSettings, SubmissionSettings, TimeoutSettings,
};
