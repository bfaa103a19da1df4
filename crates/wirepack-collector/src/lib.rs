pub mod appender;
pub mod export;
pub mod server;

pub use appender::{SyncPolicy, TopicAppender};
pub use export::CsvExporter;
pub use server::CollectorServer;
