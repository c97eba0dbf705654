pub mod queue;
pub mod repository;
