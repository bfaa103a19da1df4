pub mod codec;
pub mod store;
pub mod trainer;

pub use codec::{BatchCompressor, BatchDecompressor};
pub use store::{DictMeta, DictStore};
pub use trainer::{train_from_samples, TrainedDict};
