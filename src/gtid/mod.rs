//! GTID Module
//!
//! GTID set parsing and manipulation. Set subtraction lives on the server:
//! `GTID_SUBTRACT()` decides what is errant.

mod set;
pub mod gaps;

pub use set::{ExplodedGtid, FixPlan, GtidRangeEntry, GtidSet};
