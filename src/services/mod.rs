pub mod archive;
pub mod conversion;
pub mod converter;
pub mod ingest;
pub mod notifier;
pub mod pipeline;
pub mod progress;
pub mod session;
pub mod sweeper;
