//! Session configuration.

/// Which end of the transport this session is.
///
/// Each side allocates stream ids for the exchanges it opens from its own
/// parity class, so both ends can open exchanges without coordination.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// Opens exchanges on even ids.
    Guest,
    /// Opens exchanges on odd ids.
    Host,
}

impl Role {
    /// First id this role hands out; allocation then steps by two.
    pub fn first_id(&self) -> u32 {
        match self {
            Self::Guest => 2,
            Self::Host => 1,
        }
    }
}

/// Tunables for one session.
#[derive(Clone, Debug)]
pub struct Config {
    pub role: Role,
    /// Credit both sides assume for a channel's input before any RequestN.
    pub handshake_credit: u32,
    /// How many terminated ids are remembered so their late frames can be dropped quietly.
    pub closed_history: usize,
    /// Largest inbound payload accepted; bigger frames are protocol violations.
    pub max_payload_len: usize,
}

impl Config {
    pub fn standard() -> Self {
        Self {
            role: Role::Guest,
            handshake_credit: 1,
            closed_history: 1024,
            max_payload_len: 16 * 1024 * 1024,
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn with_handshake_credit(mut self, credit: u32) -> Self {
        self.handshake_credit = credit;
        self
    }

    pub fn with_closed_history(mut self, len: usize) -> Self {
        self.closed_history = len;
        self
    }

    pub fn with_max_payload_len(mut self, len: usize) -> Self {
        self.max_payload_len = len;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::standard()
    }
}
