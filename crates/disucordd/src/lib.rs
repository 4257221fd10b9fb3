//! DiSUcord relay - channel registry, broadcast engine and lifecycle control
//!
//! This crate provides the relay server behind the `disucordd` binary:
//! - `registry` - display names and channel subscriptions
//! - `broadcast` - fan-out of channel messages to subscribers
//! - `server` - TCP accept loop, client sessions and the lifecycle controller
//! - `observer` - sinks for log lines and roster/subscriber snapshots
//! - `config` - TOML/env configuration
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       disucordd                             │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────────┐     ┌─────────────────────────┐   │
//! │  │ LifecycleController │◀────│     ControlHandle       │   │
//! │  │   (TCP listener)    │     │  (desired state, polled)│   │
//! │  └──────────┬──────────┘     └─────────────────────────┘   │
//! │             │ connections                                   │
//! │             ▼                                               │
//! │  ┌─────────────────────┐     ┌─────────────────────────┐   │
//! │  │   ClientSession     │────▶│       Registry          │   │
//! │  │    (per client)     │     │ (clients + channels)    │   │
//! │  └──────────┬──────────┘     └────────────┬────────────┘   │
//! │             │ MESSAGE                     │ snapshots       │
//! │             ▼                             ▼                 │
//! │  ┌─────────────────────┐     ┌─────────────────────────┐   │
//! │  │  BroadcastEngine    │     │    RelayObserver        │   │
//! │  └─────────────────────┘     └─────────────────────────┘   │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod broadcast;
pub mod config;
pub mod observer;
pub mod registry;
pub mod server;
