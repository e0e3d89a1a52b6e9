//! # Coordination Engine
//!
//! Parent/child coordination and reliable messaging for tree-shaped node
//! networks.
//!
//! ## Architecture
//!
//! Every node in the tree runs a [`Coordinator`] for the sessions it leads
//! over its children, and a [`SessionManager`] for the sessions it takes
//! part in under its parent. All traffic crosses node boundaries as
//! [`Message`] values through a [`Transport`](transport::Transport), usually
//! wrapped in a [`ReliableMessageRouter`]:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                                 node                                      │
//! │                                                                           │
//! │  ┌─────────────┐  INIT/COMMAND/HEARTBEAT   ┌──────────────────────────┐   │
//! │  │ Coordinator │──────────────────────────►│ ReliableMessageRouter    │   │
//! │  │ (parent)    │◄── READY/ERROR/COMPLETE ──│ (retry, ack, dedup)      │   │
//! │  └─────────────┘                           └──────────────────────────┘   │
//! │         │                                               │                 │
//! │         ▼                                               ▼                 │
//! │  ┌─────────────────┐                          ┌─────────────────────┐     │
//! │  │ SessionManager  │── BackpressureManager ──►│ Transport           │     │
//! │  │ (child)         │   (PAUSE / RESUME)       │ (embedder-provided) │     │
//! │  └─────────────────┘                          └─────────────────────┘     │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Lifecycle
//!
//! Components are explicitly constructed, started and stopped. `start()` on a
//! running component and `stop()` on a stopped one are no-ops.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use coordination_engine::config::CoordinatorConfig;
//! use coordination_engine::topology::StaticTopology;
//! use coordination_engine::transport::NoOpTransport;
//! use coordination_engine::Coordinator;
//!
//! #[tokio::main]
//! async fn main() {
//!     let topology = StaticTopology::new("root").with_children(["a", "b"]);
//!     let coordinator = Coordinator::new(topology, NoOpTransport, CoordinatorConfig::default());
//!     coordinator.start();
//!
//!     let session_id = coordinator
//!         .initiate_coordination(None)
//!         .await
//!         .expect("Failed to initiate");
//!     println!("opened {session_id}");
//!
//!     coordinator.stop().await;
//! }
//! ```

pub mod config;
pub mod coordination;
pub mod error;
mod lifecycle;
pub mod message;
pub mod messaging;
pub mod metrics;
pub mod resilience;
pub mod topology;
pub mod transport;

// Re-exports for convenience
pub use config::{
    BackpressureConfig, CoordinationConfig, CoordinatorConfig, DeliveryConfig, ReadyQuorum,
    RouterConfig, SessionConfig,
};
pub use coordination::{
    BackpressureManager, BackpressureState, CoordinationProtocol, CoordinationSession,
    CoordinationState, Coordinator, SessionEvent, SessionManager, StateManager,
};
pub use error::{CoordinationError, Result};
pub use message::{Message, MessagePriority, MessageType};
pub use messaging::{
    DeliveryStatus, DeliveryTracker, FailureInjector, FailureType, ReliabilityLevel,
    ReliableMessageRouter, RetryPolicy,
};
pub use topology::{NodeTopology, StaticTopology};
pub use transport::{NoOpTransport, Transport};
