#![doc = include_str!("../README.md")]

mod error;
pub mod metrics;
pub mod pipeline;
mod record;
pub mod server;
mod store;
mod sync;

pub use crate::error::*;
pub use crate::record::*;
pub use crate::store::*;
pub use crate::sync::*;
