//! Code generator seam.
//!
//! The store never interprets generated source. It only needs the text, the
//! companion style, and the free names the code refers to, which it maps to
//! the modules that declare them.

use serde::Serialize;
use serde_json::Value;

use crate::mirror::{MirrorClass, SyncMode};

/// Output of a [`CodeGenerator`] for one class.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GeneratedCode {
    /// Source text declaring the class
    pub source: String,
    /// Companion style text (possibly empty)
    pub css: String,
    /// Names the source refers to but does not declare
    pub free_names: Vec<String>,
}

/// Turns a class into remote code.
pub trait CodeGenerator {
    /// Generate the remote declaration of `class`.
    ///
    /// # Errors
    ///
    /// A human-readable reason; the store wraps it in
    /// `AssetError::Generator`.
    fn generate(&self, class: &'static MirrorClass) -> Result<GeneratedCode, String>;
}

/// Attribute row of the emitted class table.
#[derive(Serialize)]
struct AttributeRow<'a> {
    name: &'a str,
    sync: SyncMode,
    default: Value,
}

/// Built-in generator for mirror classes.
///
/// Emits a stub that registers the class with the remote runtime and carries
/// its synced attribute table. Local attributes never leave the host, so
/// they are not part of the table. The base class is reported as a free name
/// and referenced through `tether.*`, where the loader exports every module's
/// declarations.
#[derive(Debug, Clone, Copy, Default)]
pub struct MirrorClassGenerator;

impl CodeGenerator for MirrorClassGenerator {
    fn generate(&self, class: &'static MirrorClass) -> Result<GeneratedCode, String> {
        let rows: Vec<AttributeRow<'_>> = class
            .attributes
            .iter()
            .filter(|attr| attr.sync.is_syncable())
            .map(|attr| AttributeRow { name: attr.name, sync: attr.sync, default: attr.initial_value() })
            .collect();
        let table = serde_json::to_string(&rows).map_err(|e| e.to_string())?;

        let (base_expr, free_names) = match class.base {
            Some(base) => (format!("tether.{}", base.name), vec![base.name.to_string()]),
            None => ("tether.Mirror".to_string(), Vec::new()),
        };

        let source = format!(
            "var {name} = tether.mirrorClass({name:?}, {base_expr}, {table});",
            name = class.name,
        );
        Ok(GeneratedCode { source, css: class.css.to_string(), free_names })
    }
}
