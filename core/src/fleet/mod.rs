//! Model Fleet Manager (spec §4.D).

mod manager;
pub mod state;

pub use manager::{FleetManager, ModelSnapshot};
pub use state::{BoundedHistory, ModelRuntimeState, RuntimeStateKind, HISTORY_LEN};
