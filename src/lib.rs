//! Presley - Video Conversion Worker
//!
//! Consumes conversion jobs from an AMQP queue, reassembles chunked
//! uploads into a single file, converts them to MPEG-DASH with ffmpeg
//! and confirms completion downstream. Each video takes effect at most
//! once even though the broker delivers at least once.
//!
//! Hexagonal Architecture:
//! - domain/: Pure business logic (jobs, chunk assembly, failure taxonomy)
//! - ports/: Trait definitions
//! - adapters/: Concrete implementations (lapin, sqlx)
//! - application/: Handler, transcoder, reporter, worker pool
//! - config: Environment configuration

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod ports;

// Re-exports for convenience
pub use config::Config;
pub use domain::jobs::ConversionJob;
