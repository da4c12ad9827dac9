//! Service availability observation.

use courier_wire::{Availability, ServiceId};

/// Liveness an observer reports back from a notification. A defunct observer
/// is removed from the list by the notifier; nothing is thrown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverHealth {
    Alive,
    Defunct,
}

/// Observes availability transitions of one service.
///
/// Notifications are delivered outside the requester's observer lock, so an
/// observer may re-enter the requester freely.
pub trait ServiceStatusObserver: Send + Sync {
    fn on_service_status_changed(
        &self,
        service_id: &ServiceId,
        old: Availability,
        new: Availability,
    ) -> ObserverHealth;
}

/// Closure adapter so simple observers need no named type.
impl<F> ServiceStatusObserver for F
where
    F: Fn(&ServiceId, Availability, Availability) -> ObserverHealth + Send + Sync,
{
    fn on_service_status_changed(
        &self,
        service_id: &ServiceId,
        old: Availability,
        new: Availability,
    ) -> ObserverHealth {
        self(service_id, old, new)
    }
}
