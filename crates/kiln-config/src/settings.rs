//! Service settings parsing.
//!
//! ```kdl
//! app-id "kiln-dev"
//! logs-hostname "logs.example.com"
//! result-store-hostname "results.example.com"
//! global-cache "vpython" path="vpython"
//! ```

use kdl::KdlDocument;
use kiln_core::builder::Settings;
use std::path::Path;

use crate::ConfigResult;
use crate::builders::parse_cache;
use crate::nodes::required_string_arg;

pub fn parse_settings(kdl: &str) -> ConfigResult<Settings> {
    let doc: KdlDocument = kdl.parse()?;
    let mut settings = Settings::default();

    for node in doc.nodes() {
        match node.name().value() {
            "app-id" => settings.app_id = required_string_arg(node)?,
            "logs-hostname" => settings.logs_hostname = required_string_arg(node)?,
            "result-store-hostname" => {
                settings.result_store_hostname = required_string_arg(node)?
            }
            "global-cache" => settings.global_caches.push(parse_cache(node)?),
            _ => {}
        }
    }

    Ok(settings)
}

pub fn load_settings(path: impl AsRef<Path>) -> ConfigResult<Settings> {
    let text = std::fs::read_to_string(path)?;
    parse_settings(&text)
}
