//! wpo-placement: assigns site databases to MariaDB shards.
//!
//! Each namespace hosts a few MariaDB servers labelled for automatic
//! allocation. New site databases go to the shard holding the fewest
//! databases, as seen by an inventory rebuilt from watch events.
//!
//! # Components
//!
//! - **`inventory`**: Shard → databases map fed by shard and database events
//! - **`placer`**: `DatabasePlacer`: optimistic placement, conflict read-back
//! - **`error`**: Placement errors

pub mod error;
pub mod inventory;
pub mod placer;

pub use error::{PlacementError, PlacementResult};
pub use inventory::{DatabaseRecord, ShardEntry, ShardInventory};
pub use placer::{DatabasePlacer, Placement, PlacerConfig};
