//! Fleet Core - Entity Types
//!
//! Pure data structures shared by the fleet persistence layer: entities,
//! change sets, the error taxonomy, the client filter tree and the clock
//! seam. This crate performs no I/O.

pub mod changes;
pub mod clock;
pub mod entities;
pub mod enums;
pub mod error;
pub mod filter;
pub mod identity;

pub use changes::*;
pub use clock::{Clock, ManualClock, SystemClock};
pub use entities::*;
pub use enums::*;
pub use error::*;
pub use filter::{Condition, FilterTree, Filters, LogicalOperator, PropertyOperator};
pub use identity::*;
