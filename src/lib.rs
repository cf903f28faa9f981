// ===============================
// src/lib.rs
// ===============================
pub mod config;
pub mod domain;
pub mod engine;
pub mod feed;
pub mod gateway;
pub mod hours;
pub mod indicators;
pub mod metrics;
pub mod normalizer;
pub mod portfolio;
pub mod positions;
pub mod recorder;
pub mod risk;
pub mod strategy;
