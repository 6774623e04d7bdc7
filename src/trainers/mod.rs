//! Concrete training runs

pub mod cascade;

pub use cascade::{CascadeExtras, CascadeModels, CascadeRun};
