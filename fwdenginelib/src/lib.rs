//! This is the library module that provides structures like
//! RingRegion, Ring, Port, LookupTable, Worker, AffinityController and Engine
//!
//! These structures and functions enable the user to forward frames between netmap rings
//! in a safe manner and without having to manually figure out the ring ownership protocol

pub mod affinity;
pub mod apis;
pub mod config;
pub mod decision;
pub mod engine;
pub mod lookup;
pub mod stats;
pub mod worker;

pub use apis::*;
pub use engine::{Engine, EngineError, PowerSignal, WorkerStatus};

/// Re-exported so users of the crate name MAC addresses the same way
pub use pnet::datalink::MacAddr;
