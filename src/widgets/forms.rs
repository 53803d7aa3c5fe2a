//! Widget definitions and submission validation.
//!
//! Each widget enforces its own minimal completeness rule before a
//! submission becomes a `CapturedRecord`. Validation failures stay inside
//! the widget layer; they are never session failures.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::WidgetError;
use crate::session::WidgetType;

/// The validated output of one widget submission.
///
/// Immutable once created. Re-submitting a widget produces a new record that
/// replaces the old one wholesale; there is no field-wise merging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedRecord {
    pub widget: WidgetType,
    pub fields: Map<String, Value>,
    pub captured_at: DateTime<Utc>,
}

/// Static definition of one widget's capture form.
#[derive(Debug, Clone, Copy)]
pub struct WidgetDefinition {
    pub widget: WidgetType,
    /// Fields that must be present and non-empty before submission.
    pub required: &'static [&'static str],
}

impl WidgetDefinition {
    /// Validate submitted fields and mint a `CapturedRecord`.
    ///
    /// Required fields must be present, non-null, and non-empty; widgets with
    /// stronger rules (numeric vitals, payment success) check those too.
    pub fn validate(&self, fields: Map<String, Value>) -> Result<CapturedRecord, WidgetError> {
        for field in self.required {
            let value = fields.get(*field).ok_or_else(|| self.missing(field))?;
            if value.is_null() {
                return Err(self.missing(field));
            }
            if let Some(s) = value.as_str()
                && s.trim().is_empty()
            {
                return Err(self.missing(field));
            }
        }

        match self.widget {
            WidgetType::Vitals => {
                self.require_positive_number(&fields, "weight_kg")?;
                self.require_positive_number(&fields, "age")?;
            }
            WidgetType::Payment => {
                let status = fields
                    .get("status")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                if status != "success" {
                    return Err(self.invalid(
                        "status",
                        format!("payment must reach terminal success, got {status:?}"),
                    ));
                }
            }
            _ => {}
        }

        Ok(CapturedRecord {
            widget: self.widget,
            fields,
            captured_at: Utc::now(),
        })
    }

    fn require_positive_number(
        &self,
        fields: &Map<String, Value>,
        field: &str,
    ) -> Result<(), WidgetError> {
        let n = fields
            .get(field)
            .and_then(|v| v.as_f64())
            .ok_or_else(|| self.invalid(field, "not a number".to_string()))?;
        if n <= 0.0 {
            return Err(self.invalid(field, format!("must be positive, got {n}")));
        }
        Ok(())
    }

    fn missing(&self, field: &str) -> WidgetError {
        WidgetError::MissingField {
            widget: self.widget.to_string(),
            field: field.to_string(),
        }
    }

    fn invalid(&self, field: &str, reason: String) -> WidgetError {
        WidgetError::InvalidField {
            widget: self.widget.to_string(),
            field: field.to_string(),
            reason,
        }
    }
}

/// All widget definitions. Order matches `WidgetType::ALL`.
pub(crate) static DEFINITIONS: [WidgetDefinition; 7] = [
    WidgetDefinition {
        widget: WidgetType::Vitals,
        required: &["weight_kg", "age", "sex"],
    },
    WidgetDefinition {
        widget: WidgetType::MedicalHistory,
        required: &["conditions", "medications", "allergies"],
    },
    WidgetDefinition {
        widget: WidgetType::Psychographic,
        required: &["motivation", "eating_pattern", "activity_level"],
    },
    WidgetDefinition {
        widget: WidgetType::LabScheduling,
        required: &["date", "slot"],
    },
    WidgetDefinition {
        widget: WidgetType::Profile,
        required: &["name", "phone"],
    },
    WidgetDefinition {
        widget: WidgetType::Payment,
        required: &["order_id", "status"],
    },
    WidgetDefinition {
        widget: WidgetType::ConsultationScheduling,
        required: &["date", "slot"],
    },
];
