//! Mirra reflector: mirrors a remote collection into a local [`mirra_store::Store`].
//!
//! A [`Reflector`] combines a periodic full listing with a long-lived watch
//! subscription, both provided by a [`ListerWatcher`]. Every transition it detects
//! is applied to the store and reported to an [`EventHandler`]. A watch connection
//! that dies is noticed on the next health-check tick and relaunched.

#![forbid(unsafe_code)]

mod backend;
mod config;
mod handler;
pub mod memory;
mod reflector;

pub use backend::{BackendError, ListerWatcher, Subscription};
pub use config::ReflectorConfig;
pub use handler::{EventHandler, Handlers, NoopHandler};
pub use memory::MemoryBackend;
pub use reflector::{Reflector, ReflectorError};
