//! Data-capture widgets — one strictly-typed form per intake stage.

pub mod forms;
pub mod registry;

pub use forms::{CapturedRecord, WidgetDefinition};
pub use registry::WidgetRegistry;
