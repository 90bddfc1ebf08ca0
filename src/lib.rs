//! Real-time update patterns (short polling, long polling, server-sent
//! events and websockets) served from one pending-response broker.

pub mod api;
pub mod broker;
pub mod clock;
pub mod config;
pub mod message;
pub mod subscriber;
pub mod waiter;

pub use broker::{Broker, BrokerConfig, BrokerError};
pub use message::Message;
pub use subscriber::{Deliver, DeliveryError, Subscription};
pub use waiter::WaitOutcome;
