pub mod config;
pub mod error;
pub mod frame;
pub mod metrics;
pub mod normalize;
pub mod validate;

pub use config::{CollectorConfig, EdgeConfig};
pub use error::{Error, Result};
pub use frame::{encode_frame, read_frame, FrameHeader, PROTOCOL_VERSION};
pub use metrics::{MetricsRegistry, MetricsSnapshot};
pub use normalize::normalize;
