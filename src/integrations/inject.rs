//! Injection snippet for loading an app class into the live kernel
//!
//! The module source is embedded as a JSON string literal, which is also a
//! valid Python string literal, so no escaping rules of our own are
//! involved. The snippet compiles it under a `<app:ID>` file name (so
//! tracebacks point at the app) and then checks that the class exists.

use super::manifest::AppEntry;
use super::IntegrationError;

/// Python code that defines `entry.class_name` in the kernel's globals
pub fn injection_snippet(entry: &AppEntry, source: &str) -> Result<String, IntegrationError> {
    if !is_identifier(&entry.class_name) {
        return Err(IntegrationError::InvalidApp(format!(
            "class name `{}` is not a Python identifier",
            entry.class_name
        )));
    }

    let source_literal = serde_json::to_string(source)?;
    let filename_literal = serde_json::to_string(&format!("<app:{}>", entry.app_id))?;
    let class_literal = serde_json::to_string(&entry.class_name)?;
    let message_literal = serde_json::to_string(&format!(
        "app '{}' did not define class {}",
        entry.app_id, entry.class_name
    ))?;

    Ok(format!(
        "exec(compile({source}, {filename}, \"exec\"), globals())\n\
         if {class} not in globals():\n    raise NameError({message})\n",
        source = source_literal,
        filename = filename_literal,
        class = class_literal,
        message = message_literal,
    ))
}

/// ASCII Python identifier check
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
