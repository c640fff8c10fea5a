//! Domain types shared by the link and its callers.

pub mod device;
pub mod firmware;
pub mod models;
pub mod settings;
