pub mod handler;
pub mod reporter;
pub mod retry;
pub mod transcoder;
pub mod worker;

pub use handler::{ConversionHandler, Routing};
pub use reporter::ErrorReporter;
pub use retry::{FailureAction, RetryPolicy};
pub use transcoder::FfmpegTranscoder;
pub use worker::WorkerPool;
