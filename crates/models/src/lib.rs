pub mod artifact;
pub mod config;
pub mod error;
pub mod recipe;

pub use artifact::*;
pub use config::*;
pub use error::*;
pub use recipe::*;
