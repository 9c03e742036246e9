//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Registration (per method):
//!     HttpRule (annotation, service config or implicit)
//!     → lexer.rs (tokens) → template.rs (segments, variables, verb)
//!     → router.rs (insert into the path trie)
//!
//! Request:
//!     path + verb
//!     → router.rs (longest-match search with backtracking)
//!     → params.rs (captures and query → typed field values)
//!     → Binding + Params
//! ```
//!
//! # Design Decisions
//! - Templates are compiled once, at registration; a bad template fails
//!   the registering call and never reaches traffic
//! - The trie is a plain value: snapshots clone it, mutate the copy and
//!   publish it
//! - Route misses and verb misses both surface as `NotFound`

pub mod lexer;
pub mod params;
pub mod router;
pub mod rule;
pub mod template;

pub use params::{FieldPath, Params};
pub use router::{Binding, Path, RouteError, RouteMatch, ANY_VERB, WEBSOCKET_VERB};
pub use rule::HttpRule;
