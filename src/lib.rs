//! smsgwd: a long-running SMS gateway worker.
//!
//! Binds to one or more SMPP carriers as a transceiver, drains the outbound
//! queue held in the relational database, submits messages with GSM-7
//! segmentation, ingests mobile-originated traffic, and self-heals sessions
//! when the carrier stops acknowledging.

pub mod config;
pub mod model;
pub mod sender;
pub mod service;
pub mod session;
pub mod stats;
pub mod store;
pub mod supervisor;
pub mod telemetry;
pub mod wire;
