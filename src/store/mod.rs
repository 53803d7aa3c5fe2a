//! Persistence layer — patient-scoped storage for captured records, the
//! session transcript, and the coarse status side-channel.

pub mod libsql_backend;
pub mod migrations;
pub mod retry;
pub mod traits;

pub use libsql_backend::LibSqlStore;
pub use retry::{PendingWrites, RetryPolicy, save_record_with_retry};
pub use traits::ProgressStore;

use crate::session::WidgetType;

/// Coarse patient status written alongside every record save.
///
/// Deliberately coupled side channel consumed by other parts of the system;
/// writes are at-least-once and duplicate values are harmless.
pub fn coarse_status(widget: WidgetType) -> &'static str {
    match widget {
        WidgetType::Vitals | WidgetType::MedicalHistory => "Assessment In Progress",
        WidgetType::Psychographic => "Assessment Review",
        WidgetType::LabScheduling => "Labs Scheduled",
        WidgetType::Profile => "Profile Complete",
        WidgetType::Payment => "Awaiting Shipment",
        WidgetType::ConsultationScheduling => "Consultation Scheduled",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_widget_maps_to_a_status() {
        for widget in WidgetType::ALL {
            assert!(!coarse_status(widget).is_empty());
        }
        assert_eq!(coarse_status(WidgetType::Payment), "Awaiting Shipment");
    }
}
