//! Deduplicates in-progress connect attempts so two concurrent callers racing to dial the same
//! endpoint don't both open a socket (spec §4.1 `InFlightSet`, §9 design note).

use crate::endpoint::Endpoint;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Reserves endpoints for the duration of an outbound connect attempt.
pub struct InFlightSet {
    next_id: std::sync::atomic::AtomicU64,
    reserved: Arc<Mutex<HashMap<Endpoint, u64>>>,
}

impl InFlightSet {
    pub fn new() -> Self {
        Self {
            next_id: std::sync::atomic::AtomicU64::new(0),
            reserved: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Attempts to reserve `endpoint`. Returns `None` if a connect attempt to it is already in
    /// progress; otherwise returns a permit that releases the reservation when dropped.
    pub fn reserve(&self, endpoint: Endpoint) -> Option<InFlightPermit> {
        use std::sync::atomic::Ordering;

        let id = match self.reserved.lock().unwrap().entry(endpoint) {
            Entry::Vacant(entry) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                entry.insert(id);
                id
            }
            Entry::Occupied(_) => return None,
        };

        Some(InFlightPermit {
            reserved: self.reserved.clone(),
            endpoint,
            id,
        })
    }

    pub fn contains(&self, endpoint: Endpoint) -> bool {
        self.reserved.lock().unwrap().contains_key(&endpoint)
    }
}

impl Default for InFlightSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds a reservation in [`InFlightSet`] open for as long as it lives.
pub struct InFlightPermit {
    reserved: Arc<Mutex<HashMap<Endpoint, u64>>>,
    endpoint: Endpoint,
    id: u64,
}

impl Drop for InFlightPermit {
    fn drop(&mut self) {
        if let Entry::Occupied(entry) = self.reserved.lock().unwrap().entry(self.endpoint) {
            if *entry.get() == self.id {
                entry.remove();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(s: &str) -> Endpoint {
        Endpoint::new(s.parse().unwrap())
    }

    #[test]
    fn second_reserve_of_same_endpoint_fails_while_first_lives() {
        let set = InFlightSet::new();
        let a = set.reserve(ep("1.2.3.4:100")).unwrap();
        assert!(set.reserve(ep("1.2.3.4:100")).is_none());
        drop(a);
        assert!(set.reserve(ep("1.2.3.4:100")).is_some());
    }

    #[test]
    fn distinct_endpoints_reserve_independently() {
        let set = InFlightSet::new();
        let _a = set.reserve(ep("1.2.3.4:100")).unwrap();
        assert!(set.reserve(ep("1.2.3.4:200")).is_some());
    }

    #[test]
    fn contains_reflects_live_reservations() {
        let set = InFlightSet::new();
        assert!(!set.contains(ep("1.2.3.4:100")));
        let permit = set.reserve(ep("1.2.3.4:100")).unwrap();
        assert!(set.contains(ep("1.2.3.4:100")));
        drop(permit);
        assert!(!set.contains(ep("1.2.3.4:100")));
    }

    #[test]
    fn stale_permit_drop_does_not_release_newer_reservation() {
        let set = InFlightSet::new();
        let first = set.reserve(ep("1.2.3.4:100")).unwrap();
        drop(first);
        let second = set.reserve(ep("1.2.3.4:100")).unwrap();
        // Simulate a stale permit whose id no longer matches the live reservation.
        let stale = InFlightPermit {
            reserved: set.reserved.clone(),
            endpoint: ep("1.2.3.4:100"),
            id: 999_999,
        };
        drop(stale);
        assert!(set.contains(ep("1.2.3.4:100")));
        drop(second);
    }
}
