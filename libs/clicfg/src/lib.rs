//! Declarative configuration-tree engine for line-oriented device CLIs.
//!
//! This library models the running configuration of a routing appliance as a
//! hierarchical tree built incrementally from line commands. Key concepts:
//!
//! - **ConfigTree**: the persistent tree; one per device session.
//! - **Command**: a parsed line, optionally negated (`no`) or transient (`do`).
//! - **CommandInterpreter**: applies a batch of submitted lines to a tree.
//! - **RunningConfig**: a per-device session wrapping a tree with identity
//!   and change tracking, able to re-serialize the configuration as text.
//!
//! # Invariants
//!
//! - Applying the same positive command twice is idempotent.
//! - Unsetting a path removes its entire subtree and prunes empty ancestors.
//! - Rendering visits siblings in lexicographic token order, so output is
//!   deterministic regardless of command arrival order.

mod command;
mod interpreter;
mod session;
mod tree;

pub use command::{Command, CommandPrefix};
pub use interpreter::{ApplyError, CommandInterpreter};
pub use session::{DeviceParams, RunningConfig};
pub use tree::{ConfigNode, ConfigTree};
