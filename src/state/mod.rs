//! Shared engine state

mod engine;

pub use engine::Engine;
