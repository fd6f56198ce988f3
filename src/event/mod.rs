//! Event Queue and Worker Pool
//!
//! Every node is driven by typed events pulled off a bounded queue by a fixed
//! pool of workers. A worker runs one event to completion; waiting on another
//! node is never a blocking wait but state in the pending tables, resumed by
//! the event carrying the response.

pub mod queue;
pub mod worker;

pub use queue::EventQueue;
pub use worker::{EventHandler, WorkerPool};

#[cfg(test)]
mod tests;
