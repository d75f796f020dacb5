pub mod core;
pub mod shared;

pub use core::api::Scrat;
pub use core::errors::ScratError;
