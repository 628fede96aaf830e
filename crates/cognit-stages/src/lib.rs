pub mod adaptation;
pub mod common;
pub mod concept;
pub mod dialog;
pub mod execution;
pub mod memory;
pub mod observability;
pub mod orchestration;
pub mod perception;
pub mod persistence;
pub mod planning;
pub mod protocol;
pub mod runtime;
pub mod world_model;
