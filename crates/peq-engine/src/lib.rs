//! peq-engine: real-time orchestration of the EQ signal path
//!
//! Splits the EQ across three threads:
//! - the control thread builds parameter snapshots and schedules FIR
//!   rebuilds ([`controller::EqController`]);
//! - the audio thread processes blocks lock-free ([`engine::EqEngine`]);
//! - a background worker turns snapshots into partitioned impulse sets
//!   ([`rebuild::RebuildWorker`]).
//!
//! The only shared state is the snapshot double buffer, three bounded
//! channels and a handful of atomics. Buffers the audio thread retires
//! travel back to the control thread, which frees them at tick cadence.

pub mod controller;
pub mod engine;
pub mod linear_phase;
pub mod quality;
pub mod rebuild;
pub mod snapshot;

pub use controller::{EqController, GlobalParams};
pub use engine::{EngineTaps, EqEngine};
pub use linear_phase::{ConvolverBank, ImpulseSet, LinearPhaseEq};
pub use quality::AdaptiveQuality;
pub use snapshot::{ParamSnapshot, SnapshotBuffer};
