//! Block-allocating producer/coordinator pipeline.
//!
//! Worker threads claim disjoint blocks of sequential IDs, synthesize one
//! record per ID and hand records one at a time to a single coordinator,
//! which appends them to a [`RecordStore`](crate::store::RecordStore) and
//! decides when the run is complete.

mod allocator;
mod coordinator;
mod counter;
mod slot;
mod worker;

#[cfg(test)]
mod tests;

pub use allocator::*;
pub use coordinator::*;
pub use counter::*;
pub use slot::*;
pub use worker::*;
