//! Test doubles and end-to-end scenarios.
//!
//! ```text
//! ┌──────────────────────┐      ┌────────────────────────┐
//! │ client scenarios     │      │ server scenarios       │
//! │  Router + Invoker    │      │  TxInboundHandler      │
//! └──────────┬───────────┘      └───────────┬────────────┘
//!            ▼                              ▼
//! ┌──────────────────────┐      ┌────────────────────────┐
//! │ FakeConnector        │      │ RecordingInvoker       │
//! │  duplex echo pipes   │      │  lock ownership checks │
//! └──────────────────────┘      └────────────────────────┘
//! ```

mod client_scenarios;
mod fake;
mod mock_server;
mod recording;
mod server_scenarios;
mod utils;

pub(crate) use fake::FakeConnector;
pub(crate) use mock_server::MockServer;
pub(crate) use recording::RecordingInvoker;
pub(crate) use utils::{ep, init_tracing, key_in_segment, wait_for};
