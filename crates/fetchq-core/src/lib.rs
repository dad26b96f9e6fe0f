pub mod config;
pub mod logging;

pub mod checksum;
pub mod control;
pub mod downloader;
pub mod error;
pub mod http;
pub mod policy;
pub mod probe;
pub mod progress;
pub mod queue;
pub mod report;
pub mod resume;
pub mod retry;
pub mod security;
pub mod segmenter;
pub mod storage;

pub use error::{FetchError, InterruptReason};
