//! Bluetooth Module
//!
//! BLE link to the melty-blade robot.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      LinkService                         │
//! │  (Single task: commands, timers and transport events)    │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!                       ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                   LinkStateMachine                       │
//! └──────┬──────────────┬──────────────┬─────────────┬──────┘
//!        │              │              │             │
//!        ▼              ▼              ▼             ▼
//! ┌───────────┐  ┌────────────┐  ┌──────────┐  ┌───────────┐
//! │  Scanner  │  │ Connection │  │ Protocol │  │ Transport │
//! │           │  │            │  │          │  │           │
//! │ - Name    │  │ - Timing   │  │ - UUIDs  │  │ - GATT    │
//! │   match   │  │ - Channel  │  │ - Config │  │   central │
//! │           │  │   lookup   │  │   frame  │  │ - Sim     │
//! └───────────┘  └────────────┘  └──────────┘  └───────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Wire formats for config frames and telemetry
//! - [`scanner`] - Scan session bookkeeping
//! - [`connection`] - Link timing and characteristic lookup
//! - [`link`] - Link state machine
//! - [`transport`] - GATT central boundary
//! - [`simulated`] - In-process robot backend
//! - [`service`] - Link driver task and handle

pub mod connection;
pub mod link;
pub mod protocol;
pub mod scanner;
pub mod service;
pub mod simulated;
pub mod transport;

pub use service::{LinkHandle, LinkService};
