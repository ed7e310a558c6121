//! Embedded command scripting.
//!
//! User-authored command scripts run inside an embedded engine reached
//! through the [`Evaluator`] interface; the rest of the crate only sees
//! [`ScriptValue`] tagged variants.

pub mod engine;
pub mod value;

pub use engine::{rename_script_fn, Evaluator, RhaiEvaluator, ScriptHost};
pub use value::ScriptValue;
