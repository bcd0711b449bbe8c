//! Tool dispatch and session management.
//!
//! Every catalog action is exposed as an individually callable tool named
//! `{system}_{resource}_{action}`, alongside a fixed set of management
//! tools. Sessions carry a permission mode fixed at creation: `safe` may
//! only call read-classified tools, `power` may also call write and
//! management tools. Tool calls dispatch straight to the action gateway
//! (no graph scheduling) but share the executor's pagination controller
//! and error/retry policy.

mod registry;
mod server;
mod session;

pub use registry::{ManagementTool, ToolAccess, ToolBinding, ToolDescriptor, ToolRegistry};
pub use server::{ToolServer, Workspace};
pub use session::{Session, SessionManager, SessionMode};
