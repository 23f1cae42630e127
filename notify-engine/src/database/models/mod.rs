//! Database row models.
//!
//! These map directly to the schema; JSON columns are stored as text and
//! converted at the domain boundary.

pub mod notification;
pub mod preference;

pub use notification::*;
pub use preference::*;
