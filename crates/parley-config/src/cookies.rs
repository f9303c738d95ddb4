use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// One entry of a browser cookie export. Only name and value matter here.
#[derive(Debug, Deserialize)]
struct ExportedCookie {
    name: String,
    value: String,
}

/// Reads a browser cookie export (a JSON array of cookie objects) into a
/// name -> value map for the Sydney transport. A missing file yields an empty
/// map; a malformed one is an error.
pub fn load_cookies_file<P: AsRef<Path>>(path: P) -> Result<HashMap<String, String>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read cookie file: {:?}", path))?;
    let cookies: Vec<ExportedCookie> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse cookie file: {:?}", path))?;
    Ok(cookies.into_iter().map(|c| (c.name, c.value)).collect())
}
