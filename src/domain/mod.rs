pub mod control;
pub mod error;
pub mod models;
pub mod settings;
