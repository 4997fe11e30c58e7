//! File-based route resolution for the dynamic directory.
//!
//! Request flow:
//! ```text
//! pathname
//!     → path.rs      (decode + safety checks, or clean no-match)
//!     → resolver.rs  (handler candidates, version lookup)
//!     → statics.rs   (extension-typed file serving on handler miss)
//! ```
//! `snapshot.rs` walks the same tree on demand to produce the route listing
//! served by the meta API. `version.rs` is the single source of cache
//! validity: a file's version token changes whenever its content does.

pub mod path;
pub mod resolver;
pub mod snapshot;
pub mod statics;
pub mod version;

pub use path::{parse_request_path, ParsedPath};
pub use resolver::{HandlerResolver, ResolvedHandler};
pub use snapshot::{route_snapshot, HandlerRouteEntry, RouteSnapshot, StaticRouteEntry};
pub use statics::{StaticFileResponse, StaticResponder};
pub use version::file_version;
