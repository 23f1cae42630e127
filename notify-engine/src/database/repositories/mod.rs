//! Repository layer.
//!
//! The engine talks to storage only through [`NotificationRepository`] and
//! [`PreferenceStore`]; SQLx and in-memory implementations are provided.

pub mod memory;
pub mod notification;
pub mod preference;

pub use memory::*;
pub use notification::*;
pub use preference::*;
