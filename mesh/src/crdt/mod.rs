// ============================================================================
// Context CRDTs - Version Counter, OR-Set and LWW-Register
// ============================================================================

mod counter;
mod lww;
mod or_set;
mod state;

pub use counter::VersionCounter;
pub use lww::{LwwRegister, RegisterValue};
pub use or_set::{Element, ElementId, OrSet, Tombstone};
pub use state::ContextState;
