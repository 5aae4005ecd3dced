//! Registry operation counters.

use serde::Serialize;

/// Mutable counters, owned by one registry and guarded by its mutex.
#[derive(Debug, Default, Clone)]
pub(crate) struct RegistryCounters {
    pub registrations: u64,
    pub rejected_registrations: u64,
    pub unregistrations: u64,
    pub lookups: u64,
    pub renewals: u64,
    pub renewal_failures: u64,
    pub watch_events: u64,
    pub watch_reconnects: u64,
}

/// Point-in-time view of registry activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    /// Successful `register_user` calls (including rebinds).
    pub registrations: u64,
    /// Registrations refused by the device cap.
    pub rejected_registrations: u64,
    /// `unregister_user` calls that reached the store.
    pub unregistrations: u64,
    /// `lookup_user` calls that reached the store.
    pub lookups: u64,
    /// Successful lease renewals.
    pub renewals: u64,
    /// Renewals rejected by the store.
    pub renewal_failures: u64,
    /// Events delivered to watch callbacks.
    pub watch_events: u64,
    /// Times a watch loop re-subscribed after losing its stream.
    pub watch_reconnects: u64,
    /// Currently running watch loops.
    pub active_watches: usize,
}

impl RegistryCounters {
    pub(crate) fn snapshot(&self, active_watches: usize) -> RegistryStats {
        RegistryStats {
            registrations: self.registrations,
            rejected_registrations: self.rejected_registrations,
            unregistrations: self.unregistrations,
            lookups: self.lookups,
            renewals: self.renewals,
            renewal_failures: self.renewal_failures,
            watch_events: self.watch_events,
            watch_reconnects: self.watch_reconnects,
            active_watches,
        }
    }
}
