//! Entitlement locks attached to published updates.
//!
//! A lock names the service and the permission codes a subscriber must hold.
//! Resources with code 0 publish without a lock.

use serde::Serialize;

/// Permission token for one update.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct EntitlementLock {
    service_id: u32,
    codes: Vec<u32>,
}

impl EntitlementLock {
    /// Lock for a single permission code; `None` when the code is 0.
    pub fn for_code(service_id: u32, code: u32) -> Option<Self> {
        (code != 0).then(|| Self {
            service_id,
            codes: vec![code],
        })
    }

    /// Service the codes belong to.
    pub fn service_id(&self) -> u32 {
        self.service_id
    }

    /// Permission codes, never empty.
    pub fn codes(&self) -> &[u32] {
        &self.codes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_code_is_unlocked() {
        assert_eq!(EntitlementLock::for_code(1234, 0), None);
    }

    #[test]
    fn test_lock_carries_service_and_code() {
        let lock = EntitlementLock::for_code(1234, 6205).unwrap();
        assert_eq!(lock.service_id(), 1234);
        assert_eq!(lock.codes(), &[6205]);
    }
}
