//! Convenient re-exports for common usage.
//!
//! This module provides a "prelude" that re-exports the most commonly used types
//! from Netplay Rollback, allowing you to import them all at once.
//!
//! # Usage
//!
//! ```rust
//! use netplay_rollback::prelude::*;
//! ```
//!
//! # What's Included
//!
//! - **Session types**: [`P2PSession`], [`SpectatorSession`], [`BroadcastSession`], [`SessionBuilder`], [`create_session`]
//! - **Core traits**: [`SimulationBridge`], [`OutputSink`], [`NetplaySession`], [`DatagramSocket`], [`CommandStream`]
//! - **Transports**: [`UdpDatagramSocket`], [`FramedStream`]
//! - **Fundamental types**: [`Frame`], [`FrameInputs`], [`InputState`], [`Role`]
//! - **Session state**: [`SessionState`], [`StepStatus`]
//! - **Events and errors**: [`NetplayEvent`], [`EventDrain`], [`NetplayError`], [`DisconnectReason`]
//! - **Monitoring and configuration**: [`NetworkStats`], [`RollbackStats`], [`ProtocolConfig`]
//!
//! # Example
//!
//! ```rust
//! use netplay_rollback::prelude::*;
//!
//! // A simulation whose whole state is one counter.
//! #[derive(Default)]
//! struct Counter(u32);
//!
//! impl SimulationBridge for Counter {
//!     fn state_size(&self) -> Option<usize> {
//!         Some(4)
//!     }
//!
//!     fn serialize(&mut self, buf: &mut [u8]) -> Option<usize> {
//!         buf.copy_from_slice(&self.0.to_le_bytes());
//!         Some(4)
//!     }
//!
//!     fn deserialize(&mut self, buf: &[u8]) -> bool {
//!         match <[u8; 4]>::try_from(buf) {
//!             Ok(bytes) => {
//!                 self.0 = u32::from_le_bytes(bytes);
//!                 true
//!             }
//!             Err(_) => false,
//!         }
//!     }
//!
//!     fn step(&mut self, inputs: &FrameInputs, _sink: &mut dyn OutputSink) {
//!         self.0 = self.0.wrapping_add(inputs.ports[0].words()[0] + 1);
//!     }
//!
//!     fn poll_input(&self, _port: u32, _device: u32, _index: u32, _id: u32) -> i16 {
//!         0
//!     }
//! }
//!
//! let _builder = SessionBuilder::new().with_nickname("player");
//! ```

// Core session types
pub use crate::sessions::broadcast::BroadcastSession;
pub use crate::sessions::builder::{create_session, Role, SessionBuilder};
pub use crate::sessions::p2p_session::P2PSession;
pub use crate::sessions::spectator::SpectatorSession;

// Core traits
pub use crate::sessions::session_trait::NetplaySession;
pub use crate::{CommandStream, DatagramSocket, OutputSink, SimulationBridge};

// Standard transports
pub use crate::{FramedStream, UdpDatagramSocket};

// Fundamental types
pub use crate::{Frame, FrameInputs, InputState};

// Session state types
pub use crate::{SessionState, StepStatus};

// Events and errors
pub use crate::sessions::event_drain::EventDrain;
pub use crate::{DisconnectReason, NetplayError, NetplayEvent};

// Monitoring and configuration
pub use crate::{NetworkStats, ProtocolConfig, RollbackStats};
