//! Traits and types used internally by the pool control system.
//!
//! This crate is deliberately free of any concrete hardware or
//! storage implementation; it exists so `poolctld`'s components and
//! any future driver/backend can agree on a vocabulary without
//! depending on each other directly.

pub mod board;
pub mod device;
pub mod error;
pub mod lightlink;
pub mod repository;

pub use board::Board;
pub use error::{Error, Result};
pub use lightlink::LightLink;
pub use repository::Repository;
