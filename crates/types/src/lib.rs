//! Shared vocabulary for the SafeStore quarantine workspace.
//!
//! Identifiers, object lifecycle enums, threat records and the result codes
//! exchanged between the object store adapter and the quarantine engine.

pub mod codes;
pub mod ids;
pub mod object;
pub mod report;
pub mod threat;

pub use codes::*;
pub use ids::*;
pub use object::*;
pub use report::*;
pub use threat::*;
