pub mod batch;
pub mod channels;
pub mod events;
pub mod processor;

pub use batch::{BatchConfig, UpdateBatch};
pub use channels::{ChannelPublisher, OpportunityPublisher};
pub use events::*;
pub use processor::{IngestionProcessor, ProcessorConfig, ProcessorError, ProcessorStats, UpdateHandler};

pub type Result<T> = anyhow::Result<T>;
