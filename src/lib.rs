//! Gymnasticon bridges proprietary indoor bikes into the standard fitness
//! ecosystem: it ingests vendor telemetry over BLE, serial or UDP,
//! normalizes and smooths it, and rebroadcasts it as the Cycling Power,
//! Cycling Speed and Cadence and Heart Rate GATT services alongside an
//! ANT+ Bike Power channel.

pub mod ant;
pub mod app;
pub mod bike;
pub mod ble;
pub mod cli;
pub mod config;
pub mod heart_rate;
pub mod pipeline;
pub mod server;
