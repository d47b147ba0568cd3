// Common types and utilities shared across the application

pub mod sql;

pub use sql::Record;
