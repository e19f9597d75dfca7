//! Periodic evaluation cycles.

pub mod engine;

pub use self::engine::CycleRunner;
