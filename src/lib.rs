pub mod engine;
pub mod telemetry;

pub use engine::Engine;
