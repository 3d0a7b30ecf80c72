use std::fmt;
use uuid::Uuid;

/// Identifier the host assigns to one directory enumeration.
///
/// Holds the raw 16 bytes exactly as the host laid them out in memory, so the
/// derived ordering is a byte-wise comparison and equality is byte-exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EnumerationId([u8; 16]);

impl EnumerationId {
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Creates a random id. Hosts supply their own; this is for tests and dry runs.
    pub fn new_random() -> Self {
        Self(*Uuid::new_v4().as_bytes())
    }
}

impl fmt::Display for EnumerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0).hyphenated())
    }
}

/// Identifies one callback invocation. Used for cancellation and deferred completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CommandId(pub i32);

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifies the file stream a data write-back targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DataStreamId([u8; 16]);

impl DataStreamId {
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_enumeration_id_orders_bytewise() {
        let mut low = [0u8; 16];
        low[0] = 1;
        let mut high = [0u8; 16];
        high[0] = 2;
        assert!(EnumerationId::from_bytes(low) < EnumerationId::from_bytes(high));

        // A later byte only matters when earlier bytes tie.
        let mut tail = [0u8; 16];
        tail[0] = 1;
        tail[15] = 0xff;
        assert!(EnumerationId::from_bytes(low) < EnumerationId::from_bytes(tail));
        assert!(EnumerationId::from_bytes(tail) < EnumerationId::from_bytes(high));
    }

    #[test]
    fn test_enumeration_id_as_map_key() {
        let a = EnumerationId::from_bytes([3; 16]);
        let b = EnumerationId::from_bytes([1; 16]);
        let mut map = BTreeMap::new();
        map.insert(a, "a");
        map.insert(b, "b");
        assert_eq!(map.keys().copied().collect::<Vec<_>>(), vec![b, a]);
        assert_eq!(map.get(&EnumerationId::from_bytes([3; 16])), Some(&"a"));
    }

    #[test]
    fn test_random_ids_differ() {
        assert_ne!(EnumerationId::new_random(), EnumerationId::new_random());
    }
}
