//! Registry of in-flight callbacks, keyed by command id, used for cancellation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use crate::types::CommandId;

/// Maps each running command to the token that cancels it.
#[derive(Debug, Default)]
pub struct InflightRegistry {
    commands: DashMap<CommandId, Registration>,
    next_generation: AtomicU64,
}

#[derive(Debug)]
struct Registration {
    generation: u64,
    token: CancellationToken,
}

impl InflightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `command` for as long as the returned guard lives.
    ///
    /// A command id the host reuses while the old one is still registered gets
    /// a fresh token; the stale guard then leaves the new entry alone.
    pub fn begin(self: &Arc<Self>, command: CommandId) -> InflightGuard {
        let token = CancellationToken::new();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let registration = Registration { generation, token: token.clone() };
        if self.commands.insert(command, registration).is_some() {
            debug!("Command {} re-registered while still in flight", command);
        }
        trace!("Command {} in flight", command);
        InflightGuard {
            registry: self.clone(),
            command,
            generation,
            token,
        }
    }

    /// Trips the token of `command`. Returns false if it is not in flight.
    pub fn cancel(&self, command: CommandId) -> bool {
        match self.commands.get(&command) {
            Some(registration) => {
                registration.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every registered command. Used at teardown.
    pub fn cancel_all(&self) {
        for entry in self.commands.iter() {
            entry.value().token.cancel();
        }
    }

    pub fn is_in_flight(&self, command: CommandId) -> bool {
        self.commands.contains_key(&command)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Keeps a command registered; removes it on drop.
#[derive(Debug)]
pub struct InflightGuard {
    registry: Arc<InflightRegistry>,
    command: CommandId,
    generation: u64,
    token: CancellationToken,
}

impl InflightGuard {
    pub fn command(&self) -> CommandId {
        self.command
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        let generation = self.generation;
        self.registry
            .commands
            .remove_if(&self.command, |_, registered| registered.generation == generation);
    }
}
