//! Registry mapping widget types to their capture-form definitions.

use crate::error::WidgetError;
use crate::session::WidgetType;
use crate::widgets::forms::{DEFINITIONS, WidgetDefinition};

/// Fixed mapping from `WidgetType` to its form definition.
pub struct WidgetRegistry {
    definitions: &'static [WidgetDefinition],
}

static REGISTRY: WidgetRegistry = WidgetRegistry {
    definitions: &DEFINITIONS,
};

impl WidgetRegistry {
    /// The process-wide registry. Definitions are static configuration.
    pub fn global() -> &'static WidgetRegistry {
        &REGISTRY
    }

    /// Look up the definition for a widget type. Total for the closed enum.
    pub fn get(&self, widget: WidgetType) -> &WidgetDefinition {
        self.definitions
            .iter()
            .find(|d| d.widget == widget)
            .expect("every WidgetType has a definition")
    }

    /// Look up by wire name (tool calls reference widgets by string).
    /// Defensive: should be unreachable for names coming from static stages.
    pub fn get_by_name(&self, name: &str) -> Result<&WidgetDefinition, WidgetError> {
        let widget =
            WidgetType::parse(name).ok_or_else(|| WidgetError::UnknownWidget(name.to_string()))?;
        Ok(self.get(widget))
    }
}
