// Shared types and helpers

pub mod persist;
pub mod types;
