//! Peer identity.
//!
//! A connection carries an explicit identity value (composition, not
//! inheritance from some player base type): the id assigned during the
//! handshake, the requested display name, and the opaque client data blob.

/// Who a connection belongs to, as established by the handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    /// Connection id assigned by the accepting side. Zero until verified.
    pub id: i32,
    /// Display name requested in the identification packet.
    pub name: String,
    /// Opaque client data, passed through untouched.
    pub data: Vec<u8>,
}

impl Identity {
    /// Whether the handshake assigned an id yet.
    pub fn is_verified(&self) -> bool {
        self.id != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_unverified() {
        let identity = Identity::default();
        assert!(!identity.is_verified());
        assert_eq!(identity.id, 0);
    }
}
