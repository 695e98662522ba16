//! Role hub: the static role registry, per-role inbound queues, paired
//! request/response, broadcast, and timeout-bounded collaboration and
//! voting sessions.
//!
//! # Module layout
//!
//! - [`roles`]: `RoleKey`, `RoleDefinition`, `RoleHandler`
//! - [`message`]: `Message`, `MessageKind`, `MessageLog`
//! - [`router`]: `Hub` (registration, send, request, broadcast)
//! - [`session`]: collaboration and voting sessions on `Hub`
//! - [`error`]: `HubError`, `HubResult`

pub mod error;
pub mod message;
pub mod roles;
pub mod router;
pub mod session;

pub use error::{HubError, HubResult};
pub use message::{Message, MessageKind, MessageLog};
pub use roles::{definition, handler_fn, standard_roles, RoleDefinition, RoleHandler, RoleKey};
pub use router::{Hub, RoleStatus};
pub use session::{Session, SessionKind, SessionResult, SessionStatus};
