//! Tickgate Library
//!
//! Ingestion-to-gating pipeline for financial time-series ticks: dual-mode
//! streaming (live feed or deterministic replay), bar persistence, derived
//! feature computation, and variance-stability gating of symbols for
//! downstream model training.

pub mod config;
pub mod feed;
pub mod features;
pub mod gate;
pub mod ingest;
pub mod models;
pub mod stability;
pub mod storage;
