//! Local handler registry
//!
//! Maps an address to its ordered callbacks plus whether the address has been
//! announced to the bridge. Only one `register` frame is needed per address;
//! every further callback on that address is local fan-out.
//!
//! The registry performs no I/O. Methods return what the caller must put on
//! the wire (a `register` or `unregister` frame) so the caller can send it
//! after releasing the lock.

use crate::messages::Envelope;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Callback for envelopes delivered on an address
pub type MessageHandler = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Identifies one registered callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(Uuid);

impl HandlerId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

struct Slot {
    id: HandlerId,
    handler: MessageHandler,
    /// Reply correlation: fires at most once
    once: bool,
    handled: bool,
}

#[derive(Default)]
struct Entry {
    slots: Vec<Slot>,
    at_server: bool,
}

/// Outcome of an unregister call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Removal {
    /// At least one callback was removed
    pub removed: bool,
    /// The entry is gone and was known to the bridge: send `unregister`
    pub announce: bool,
}

#[derive(Default)]
pub struct HandlerRegistry {
    entries: HashMap<String, Entry>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a callback, creating the entry if needed.
    ///
    /// `at_server` promotes the entry but never demotes it.
    pub fn register_local(&mut self, address: &str, handler: MessageHandler, at_server: bool) -> HandlerId {
        self.insert(address, handler, at_server, false)
    }

    /// Register a server-delivered callback.
    ///
    /// Returns the id and whether this call is the first to need the address
    /// at the bridge, i.e. whether a `register` frame must be sent.
    pub fn register_with_server(&mut self, address: &str, handler: MessageHandler) -> (HandlerId, bool) {
        let announce = !self.is_at_server(address);
        let id = self.register_local(address, handler, true);
        (id, announce)
    }

    /// Register a one-shot reply callback on a local-only entry
    pub fn register_reply(&mut self, address: &str, handler: MessageHandler) -> HandlerId {
        self.insert(address, handler, false, true)
    }

    fn insert(&mut self, address: &str, handler: MessageHandler, at_server: bool, once: bool) -> HandlerId {
        let id = HandlerId::new();
        let entry = self.entries.entry(address.to_string()).or_default();
        entry.at_server |= at_server;
        entry.slots.push(Slot {
            id,
            handler,
            once,
            handled: false,
        });
        id
    }

    /// Remove one callback, or every callback on the address when `id` is `None`.
    ///
    /// An entry whose callback list becomes empty is deleted.
    pub fn unregister(&mut self, address: &str, id: Option<HandlerId>) -> Removal {
        let Some(entry) = self.entries.get_mut(address) else {
            return Removal::default();
        };

        let before = entry.slots.len();
        match id {
            Some(id) => entry.slots.retain(|slot| slot.id != id),
            None => entry.slots.clear(),
        }
        let removed = entry.slots.len() != before;

        if !entry.slots.is_empty() {
            return Removal {
                removed,
                announce: false,
            };
        }

        let at_server = entry.at_server;
        self.entries.remove(address);
        Removal {
            removed,
            announce: at_server,
        }
    }

    /// Callbacks to run for an envelope on `address`, in registration order.
    ///
    /// One-shot reply slots are marked handled and skipped once handled.
    /// `None` means no entry exists for the address.
    pub fn dispatch_targets(&mut self, address: &str) -> Option<Vec<MessageHandler>> {
        let entry = self.entries.get_mut(address)?;

        let targets = entry
            .slots
            .iter_mut()
            .filter_map(|slot| {
                if slot.once {
                    if slot.handled {
                        return None;
                    }
                    slot.handled = true;
                }
                Some(slot.handler.clone())
            })
            .collect();

        Some(targets)
    }

    /// Whether a one-shot slot has fired
    pub fn is_handled(&self, address: &str, id: HandlerId) -> bool {
        self.entries
            .get(address)
            .and_then(|entry| entry.slots.iter().find(|slot| slot.id == id))
            .is_some_and(|slot| slot.handled)
    }

    pub fn is_at_server(&self, address: &str) -> bool {
        self.entries.get(address).is_some_and(|entry| entry.at_server)
    }

    /// Addresses to re-announce after a reconnect
    pub fn server_addresses(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.at_server)
            .map(|(address, _)| address.clone())
            .collect()
    }

    pub fn handler_count(&self, address: &str) -> usize {
        self.entries.get(address).map_or(0, |entry| entry.slots.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
