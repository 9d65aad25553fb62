use std::fmt;

/// Client identifier. The low 32 bits name a client; non-zero high bits name
/// a sub-client reached through the passthrough whose own id is in the high
/// half. Direct ids are allocated starting at the listener count so small
/// values can double as listener indices in the poller token space.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct ClientId(pub u64);

const SUB_SHIFT: u32 = 32;
const SUB_MASK: u64 = 0xffff_ffff;

impl ClientId {
    /// Encodes sub-client `sub` behind passthrough `parent`.
    #[inline]
    pub fn wrap(parent: u64, sub: u64) -> ClientId {
        ClientId((parent << SUB_SHIFT) | sub)
    }

    /// True when the id denotes a sub-client behind a passthrough.
    #[inline]
    pub fn is_sub(self) -> bool {
        self.0 > SUB_MASK
    }

    /// Id of the passthrough parent holding the connection.
    #[inline]
    pub fn parent(self) -> u64 {
        self.0 >> SUB_SHIFT
    }

    /// Id of the sub-client as the downstream pool knows it.
    #[inline]
    pub fn sub(self) -> u64 {
        self.0 & SUB_MASK
    }

    #[inline]
    pub fn split(self) -> (u64, u64) {
        (self.parent(), self.sub())
    }
}

impl From<u64> for ClientId {
    #[inline]
    fn from(id: u64) -> ClientId {
        ClientId(id)
    }
}

impl fmt::Display for ClientId {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_round_trip() {
        let id = ClientId::wrap(10, 7);

        assert_eq!(id.0, (10u64 << 32) | 7);
        assert!(id.is_sub());
        assert_eq!(id.split(), (10, 7));
    }

    #[test]
    fn test_direct_ids_are_not_sub() {
        assert!(!ClientId(0).is_sub());
        assert!(!ClientId(1).is_sub());
        assert!(!ClientId(0xffff_ffff).is_sub());
        assert!(ClientId(0x1_0000_0000).is_sub());
    }

    #[test]
    fn test_any_high_bits_decode() {
        let id = ClientId(0x0000_0003_0000_002a);

        assert!(id.is_sub());
        assert_eq!(id.parent(), 3);
        assert_eq!(id.sub(), 42);
    }
}
