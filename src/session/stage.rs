//! Static stage definitions for the intake flow.

use serde::{Deserialize, Serialize};

/// The data-capture form bound to a stage. Closed enum: stages never
/// reference a widget outside this set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WidgetType {
    Vitals,
    MedicalHistory,
    Psychographic,
    LabScheduling,
    Profile,
    Payment,
    ConsultationScheduling,
}

impl WidgetType {
    pub const ALL: [WidgetType; 7] = [
        WidgetType::Vitals,
        WidgetType::MedicalHistory,
        WidgetType::Psychographic,
        WidgetType::LabScheduling,
        WidgetType::Profile,
        WidgetType::Payment,
        WidgetType::ConsultationScheduling,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vitals => "vitals",
            Self::MedicalHistory => "medical_history",
            Self::Psychographic => "psychographic",
            Self::LabScheduling => "lab_scheduling",
            Self::Profile => "profile",
            Self::Payment => "payment",
            Self::ConsultationScheduling => "consultation_scheduling",
        }
    }

    pub fn parse(s: &str) -> Option<WidgetType> {
        Self::ALL.iter().copied().find(|w| w.as_str() == s)
    }
}

impl std::fmt::Display for WidgetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One step in the fixed intake sequence. Immutable configuration; only the
/// pointer into the list is ever persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    pub id: &'static str,
    pub display_label: &'static str,
    pub widget: WidgetType,
}

/// The fixed, ordered intake flow.
static STAGES: [Stage; 7] = [
    Stage {
        id: "vitals",
        display_label: "Vitals",
        widget: WidgetType::Vitals,
    },
    Stage {
        id: "medical_history",
        display_label: "Medical History",
        widget: WidgetType::MedicalHistory,
    },
    Stage {
        id: "psychographic",
        display_label: "Lifestyle Questionnaire",
        widget: WidgetType::Psychographic,
    },
    Stage {
        id: "lab_scheduling",
        display_label: "Lab Scheduling",
        widget: WidgetType::LabScheduling,
    },
    Stage {
        id: "profile",
        display_label: "Your Profile",
        widget: WidgetType::Profile,
    },
    Stage {
        id: "payment",
        display_label: "Payment",
        widget: WidgetType::Payment,
    },
    Stage {
        id: "consultation_scheduling",
        display_label: "Consultation Scheduling",
        widget: WidgetType::ConsultationScheduling,
    },
];

/// The static stage list, in order.
pub fn intake_stages() -> &'static [Stage] {
    &STAGES
}

/// Index of a stage by id, if it exists.
pub fn stage_index(stage_id: &str) -> Option<usize> {
    STAGES.iter().position(|s| s.id == stage_id)
}
