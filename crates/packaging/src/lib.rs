pub mod context;
pub mod digest;
pub mod docker_backend;
pub mod dockerfile;
pub mod fsutil;
pub mod image_builder;
pub mod local;
pub mod store;

pub use context::*;
pub use digest::*;
pub use docker_backend::*;
pub use image_builder::*;
pub use local::*;
pub use store::*;
