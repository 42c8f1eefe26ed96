use std::fmt;
use uuid::Uuid;

/// A unique key identifying a specific advisory lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockKey(i64);

impl LockKey {
    pub const fn new(key: i64) -> Self {
        Self(key)
    }

    pub const fn from_components(high: i32, low: i32) -> Self {
        Self(((high as i64) << 32) | (low as i64 & 0xFFFFFFFF))
    }

    /// Fold a UUID into a key that lives in `namespace`.
    ///
    /// The top 16 bits carry the namespace so keys for different entity kinds
    /// never collide; the remaining 48 bits are the xor-folded UUID.
    pub fn from_uuid(namespace: u16, id: &Uuid) -> Self {
        let raw = id.as_u128();
        let folded = (raw as u64) ^ ((raw >> 64) as u64);
        let body = folded & 0x0000_FFFF_FFFF_FFFF;
        Self((((namespace as u64) << 48) | body) as i64)
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_components() {
        let key = LockKey::from_components(1, 2);
        assert_eq!(key.value(), (1_i64 << 32) | 2);
    }

    #[test]
    fn test_from_uuid_is_stable() {
        let id = Uuid::parse_str("6f1c2b9e-8d3a-4c51-9e0f-2a7b5d4c3e21").unwrap();
        assert_eq!(LockKey::from_uuid(7, &id), LockKey::from_uuid(7, &id));
    }

    #[test]
    fn test_namespaces_do_not_collide() {
        let id = Uuid::new_v4();
        let a = LockKey::from_uuid(1, &id);
        let b = LockKey::from_uuid(2, &id);
        assert_ne!(a, b);
        assert_eq!(a.value() & 0x0000_FFFF_FFFF_FFFF, b.value() & 0x0000_FFFF_FFFF_FFFF);
    }

    #[test]
    fn test_display_is_hex() {
        assert_eq!(LockKey::new(255).to_string(), "0x00000000000000FF");
    }
}
