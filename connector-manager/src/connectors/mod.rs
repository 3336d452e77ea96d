//! Built-in connector implementations.

pub mod rest;

pub use rest::RestConnector;
