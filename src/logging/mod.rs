pub mod database;
pub mod event_logger;
pub mod prompt_recorder;
pub mod time;
pub mod types;

pub use database::DatabaseLogger;
pub use event_logger::{BufferedEventLogger, EventLogger};
pub use prompt_recorder::SqlitePromptRecorder;
pub use types::{Event, EventName};
