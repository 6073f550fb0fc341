//! Applies submitted command batches to a configuration tree.

use std::collections::HashSet;

use thiserror::Error;
use tracing::debug;

use crate::command::{extract_batch, Command, CommandPrefix};
use crate::tree::ConfigTree;

/// Errors reported by the strict application path.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApplyError {
    /// A line carried no recognizable command.
    #[error("line {line}: not a recognized command: {text:?}")]
    Unrecognized { line: usize, text: String },

    /// A negated command named a path that does not exist.
    #[error("line {line}: unset of unknown path: {text:?}")]
    UnknownPath { line: usize, text: String },
}

/// Interprets batches of line commands against a [`ConfigTree`].
///
/// Within one batch the first applied command opens a block; subsequent
/// commands apply beneath it, which is how nested interface/VRF configuration
/// arrives on the wire.
#[derive(Debug, Clone)]
pub struct CommandInterpreter {
    /// Command heads that are syntactically valid but carry no persistent
    /// state (they close a block), so they are never inserted.
    log_only: HashSet<String>,
}

impl Default for CommandInterpreter {
    fn default() -> Self {
        Self {
            log_only: ["exit-address-family"]
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }
}

impl CommandInterpreter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a command head to the log-only set.
    pub fn log_only_command(mut self, head: &str) -> Self {
        self.log_only.insert(head.to_string());
        self
    }

    /// Applies a submitted snippet (envelope lines and all) to the tree.
    ///
    /// Best-effort: malformed lines are dropped with a debug log. Returns
    /// true when at least one command was applied.
    pub fn apply(&self, tree: &mut ConfigTree, snippet: &str) -> bool {
        self.apply_commands(tree, &extract_batch(snippet)) > 0
    }

    /// Applies already-extracted command strings as one batch.
    ///
    /// Returns the number of commands that mutated the tree.
    pub fn apply_commands<S: AsRef<str>>(&self, tree: &mut ConfigTree, commands: &[S]) -> usize {
        let mut context: Vec<String> = Vec::new();
        let mut applied = 0;
        for raw in commands {
            let raw = raw.as_ref();
            let Some(cmd) = Command::parse(raw) else {
                debug!(line = raw, "Dropping unparseable command line");
                continue;
            };
            match self.apply_one(tree, &mut context, &cmd) {
                Ok(true) => applied += 1,
                Ok(false) => {}
                Err(_) => debug!(line = raw, "Dropping command for unknown path"),
            }
        }
        applied
    }

    /// Strict variant: fails on the first malformed or unresolvable line.
    pub fn try_apply_commands<S: AsRef<str>>(
        &self,
        tree: &mut ConfigTree,
        commands: &[S],
    ) -> Result<usize, ApplyError> {
        let mut context: Vec<String> = Vec::new();
        let mut applied = 0;
        for (idx, raw) in commands.iter().enumerate() {
            let raw = raw.as_ref();
            let Some(cmd) = Command::parse(raw) else {
                return Err(ApplyError::Unrecognized {
                    line: idx + 1,
                    text: raw.to_string(),
                });
            };
            match self.apply_one(tree, &mut context, &cmd) {
                Ok(true) => applied += 1,
                Ok(false) => {}
                Err(()) => {
                    return Err(ApplyError::UnknownPath {
                        line: idx + 1,
                        text: raw.to_string(),
                    })
                }
            }
        }
        Ok(applied)
    }

    /// Applies a single command under the current batch context.
    ///
    /// Ok(true) if the tree changed, Ok(false) for pass-through lines,
    /// Err(()) when a negation named a missing path.
    fn apply_one(
        &self,
        tree: &mut ConfigTree,
        context: &mut Vec<String>,
        cmd: &Command,
    ) -> Result<bool, ()> {
        match cmd.prefix {
            CommandPrefix::Do => {
                // Non-persistent device action: acknowledged, never stored.
                debug!(command = %cmd.tokens.join(" "), "Pass-through 'do' command");
                Ok(false)
            }
            CommandPrefix::No => {
                let path = full_path(context, cmd);
                if tree.unset(&path) {
                    Ok(true)
                } else {
                    Err(())
                }
            }
            CommandPrefix::Plain => {
                if self.log_only.contains(cmd.head()) {
                    debug!(command = cmd.head(), "Log-only command");
                    return Ok(false);
                }
                let path = full_path(context, cmd);
                tree.set(&path);
                if context.is_empty() {
                    // First applied command of the batch opens the block.
                    *context = cmd.tokens.clone();
                }
                Ok(true)
            }
        }
    }
}

fn full_path<'a>(context: &'a [String], cmd: &'a Command) -> Vec<&'a str> {
    context
        .iter()
        .map(String::as_str)
        .chain(cmd.tokens.iter().map(String::as_str))
        .collect()
}
