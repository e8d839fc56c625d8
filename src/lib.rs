//! Resilient, time-windowed retrieval of studies from a remote PACS.
//!
//! A [`engine::FetchEngine`] splits a date range into bounded windows, queries each window with
//! C-FIND and moves the studies found with C-MOVE. Every exchange is throttled, rate-gauged and
//! bounded by a timeout, and every window is retried with backoff.

pub mod cache;
pub mod client;
pub mod config;
pub mod dimse;
pub mod engine;
pub mod gauge;
pub mod model;
pub mod retry;
pub mod throttle;
pub mod types;
pub mod window;

