//! wpo-routing: public routes for WordPress sites.
//!
//! A site at `host/path` needs no route of its own when a route for a
//! parent URL already sends traffic to the same service. This crate keeps
//! a table of known routes and decides, by longest segment-wise prefix,
//! whether a new route is needed.
//!
//! # Components
//!
//! - **`table`**: Route table and the parent/closest-parent resolution
//! - **`resolver`**: `RouteResolver`: route creation with deduplication
//! - **`error`**: Routing errors

pub mod error;
pub mod resolver;
pub mod table;

pub use error::{RouteError, RouteResult};
pub use resolver::{RouteConfig, RouteOutcome, RouteRequest, RouteResolver};
pub use table::{RouteEntry, RouteTable, is_parent_route};
