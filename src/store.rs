use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::{Result, VarsError};

/// A thread-safe map of command names to their most recently written value.
///
/// Cloning a `CommandStore` is cheap, every clone is a handle to the same map. Values are
/// replaced whole, so a reader never observes a partially written value.
#[derive(Debug, Clone, Default)]
pub struct CommandStore {
    commands: Arc<DashMap<String, String>>,
}

impl CommandStore {
    /// creates an empty store
    pub fn new() -> Self {
        CommandStore::default()
    }

    /// sets `name` to `value`, overwriting any previous value
    pub fn write(&self, name: String, value: String) {
        self.commands.insert(name, value);
    }

    /// sets `name` to `value`, but refuses to blank out a name that already exists
    ///
    /// # Errors
    /// returns [`VarsError::InvalidArgument`] if `name` is present and `value` is empty
    pub fn write_non_empty(&self, name: String, value: String) -> Result<()> {
        match self.commands.entry(name) {
            Entry::Occupied(mut entry) => {
                if value.is_empty() {
                    return Err(VarsError::InvalidArgument(format!(
                        "empty value for existing command {}",
                        entry.key()
                    )));
                }
                entry.insert(value);
            }
            Entry::Vacant(entry) => {
                entry.insert(value);
            }
        }
        Ok(())
    }

    /// gets the current value of `name`
    ///
    /// # Errors
    /// returns [`VarsError::NotFound`] if `name` was never written or holds an empty value
    pub fn read(&self, name: &str) -> Result<String> {
        match self.commands.get(name) {
            Some(value) if !value.is_empty() => Ok(value.clone()),
            _ => Err(VarsError::NotFound {
                name: name.to_string(),
            }),
        }
    }

    /// number of names in the store, including names holding an empty value
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// returns `true` if nothing was written yet
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}
