//! Connection registry and controller arbitration.
//!
//! Tracks every live connection's send path and feature flags, and which
//! connection (if any) holds the controller role. All state sits behind one
//! mutex that is never held across an await, so control grants are
//! linearizable: of any set of concurrent `try_set_controller` calls while
//! no controller exists, exactly one succeeds.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use crate::writer::{OutboundFrame, WriterHandle};

/// Identifier assigned to each accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Authorization role of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// May issue mutating commands.
    Controller,
    /// May only query.
    Observer,
}

/// Per-connection feature flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    /// Started a single-frame capture.
    Capturing,
    /// Started the running recording.
    Recording,
    /// Receives preview frames.
    Previewing,
}

/// Feature flags of one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionFlags {
    /// See [`Flag::Capturing`].
    pub capturing: bool,
    /// See [`Flag::Recording`].
    pub recording: bool,
    /// See [`Flag::Previewing`].
    pub previewing: bool,
}

impl SessionFlags {
    /// Value of one flag.
    pub fn get(&self, flag: Flag) -> bool {
        match flag {
            Flag::Capturing => self.capturing,
            Flag::Recording => self.recording,
            Flag::Previewing => self.previewing,
        }
    }

    fn set(&mut self, flag: Flag, value: bool) {
        match flag {
            Flag::Capturing => self.capturing = value,
            Flag::Recording => self.recording = value,
            Flag::Previewing => self.previewing = value,
        }
    }
}

/// Outcome of [`SessionRegistry::acquire_control`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlGrant {
    /// No controller existed; the caller now holds control.
    Granted,
    /// The caller already held control.
    AlreadyHeld,
    /// Another connection holds control.
    Denied,
}

impl ControlGrant {
    /// Whether the caller holds control afterwards.
    pub fn is_allowed(self) -> bool {
        !matches!(self, ControlGrant::Denied)
    }
}

/// What a connection held when it was unregistered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Departed {
    /// Flags the connection had set.
    pub flags: SessionFlags,
    /// Whether it held the controller role.
    pub was_controller: bool,
}

struct Session {
    writer: WriterHandle,
    flags: SessionFlags,
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<ConnectionId, Session>,
    controller: Option<ConnectionId>,
}

/// Registry of live connections.
#[derive(Default)]
pub struct SessionRegistry {
    state: Mutex<RegistryState>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a connection with all flags cleared, as an observer.
    pub fn register(&self, id: ConnectionId, writer: WriterHandle) {
        self.lock().sessions.insert(
            id,
            Session {
                writer,
                flags: SessionFlags::default(),
            },
        );
    }

    /// Remove a connection, releasing the controller role if it held it.
    ///
    /// Dropping the session drops its writer handle, which stops the
    /// connection's writer task once queued frames are flushed.
    pub fn unregister(&self, id: ConnectionId) -> Option<Departed> {
        let mut state = self.lock();
        let session = state.sessions.remove(&id)?;
        let was_controller = state.controller == Some(id);
        if was_controller {
            state.controller = None;
            tracing::info!("Controller {} released (disconnected)", id);
        }
        Some(Departed {
            flags: session.flags,
            was_controller,
        })
    }

    /// Make `id` the controller if there is none. Returns whether it did.
    pub fn try_set_controller(&self, id: ConnectionId) -> bool {
        self.acquire_control(id) == ControlGrant::Granted
    }

    /// Check and, if free, take the controller role in one step.
    ///
    /// Unregistered connections are always denied.
    pub fn acquire_control(&self, id: ConnectionId) -> ControlGrant {
        let mut state = self.lock();
        if !state.sessions.contains_key(&id) {
            return ControlGrant::Denied;
        }
        match state.controller {
            Some(current) if current == id => ControlGrant::AlreadyHeld,
            Some(_) => ControlGrant::Denied,
            None => {
                state.controller = Some(id);
                tracing::info!("Controller granted to {}", id);
                ControlGrant::Granted
            }
        }
    }

    /// Give up the controller role. Returns false if `id` did not hold it.
    pub fn release_controller(&self, id: ConnectionId) -> bool {
        let mut state = self.lock();
        if state.controller == Some(id) {
            state.controller = None;
            tracing::info!("Controller {} released", id);
            true
        } else {
            false
        }
    }

    /// Current controller, if any.
    pub fn controller(&self) -> Option<ConnectionId> {
        self.lock().controller
    }

    /// Role of `id`; unknown connections are observers.
    pub fn role(&self, id: ConnectionId) -> Role {
        if self.lock().controller == Some(id) {
            Role::Controller
        } else {
            Role::Observer
        }
    }

    /// Set a flag; returns false if the connection is not registered.
    pub fn set_flag(&self, id: ConnectionId, flag: Flag, value: bool) -> bool {
        match self.lock().sessions.get_mut(&id) {
            Some(session) => {
                session.flags.set(flag, value);
                true
            }
            None => false,
        }
    }

    /// Flags of `id`, or `None` if it is not registered.
    pub fn flags(&self, id: ConnectionId) -> Option<SessionFlags> {
        self.lock().sessions.get(&id).map(|s| s.flags)
    }

    /// Whether any connection has `flag` set.
    pub fn any_flag(&self, flag: Flag) -> bool {
        self.lock().sessions.values().any(|s| s.flags.get(flag))
    }

    /// Flags OR-ed across all connections.
    pub fn combined_flags(&self) -> SessionFlags {
        self.lock()
            .sessions
            .values()
            .fold(SessionFlags::default(), |acc, s| SessionFlags {
                capturing: acc.capturing || s.flags.capturing,
                recording: acc.recording || s.flags.recording,
                previewing: acc.previewing || s.flags.previewing,
            })
    }

    /// Clear `flag` on every connection.
    pub fn clear_flag(&self, flag: Flag) {
        for session in self.lock().sessions.values_mut() {
            session.flags.set(flag, false);
        }
    }

    /// Send path of `id`.
    pub fn writer(&self, id: ConnectionId) -> Option<WriterHandle> {
        self.lock().sessions.get(&id).map(|s| s.writer.clone())
    }

    /// Writers of connections with `flag` set.
    pub fn writers_with(&self, flag: Flag) -> Vec<(ConnectionId, WriterHandle)> {
        self.lock()
            .sessions
            .iter()
            .filter(|(_, s)| s.flags.get(flag))
            .map(|(id, s)| (*id, s.writer.clone()))
            .collect()
    }

    /// Largest send backlog among connections with `flag` set.
    pub fn max_pending(&self, flag: Flag) -> usize {
        self.lock()
            .sessions
            .values()
            .filter(|s| s.flags.get(flag))
            .map(|s| s.writer.pending_count())
            .max()
            .unwrap_or(0)
    }

    /// Best-effort send to every connection. Returns how many accepted it.
    pub fn broadcast(&self, frame: &OutboundFrame) -> usize {
        let targets: Vec<_> = {
            let state = self.lock();
            state
                .sessions
                .iter()
                .map(|(id, s)| (*id, s.writer.clone()))
                .collect()
        };
        deliver(&targets, frame)
    }

    /// Best-effort send to connections with `flag` set.
    pub fn send_to_flagged(&self, flag: Flag, frame: &OutboundFrame) -> usize {
        deliver(&self.writers_with(flag), frame)
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().sessions.is_empty()
    }
}

fn deliver(targets: &[(ConnectionId, WriterHandle)], frame: &OutboundFrame) -> usize {
    let mut delivered = 0;
    for (id, writer) in targets {
        match writer.try_send(frame.clone()) {
            Ok(()) => delivered += 1,
            Err(e) => tracing::debug!(
                "Dropping 0x{:02X} frame for {}: {}",
                frame.command(),
                id,
                e
            ),
        }
    }
    delivered
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("SessionRegistry")
            .field("connections", &state.sessions.len())
            .field("controller", &state.controller)
            .finish()
    }
}
