//! Persistence layer for the call dispatch core.
//!
//! The active-call registry is the single authority for how many calls
//! are in flight, system-wide and per user. Everything that mutates it
//! goes through the [`repository::ActiveCallRegistry`] trait; the queue,
//! user directory, and call log have their own seams so the dispatcher
//! and webhook pipeline can be tested against mocks.

pub mod model;
pub mod repository;
pub mod repository_sqlx;
pub mod schema;
