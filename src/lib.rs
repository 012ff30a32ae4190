//! Remote controller for a melty-blade robot over BLE.

pub mod domain;
pub mod infrastructure;
pub mod presentation;
