//! External data sources: the item catalog and labeled example files.

use anyhow::{Context, Result};
use medfed_core::{Candidate, LabeledQuery};
use std::collections::HashSet;
use std::path::Path;
use tracing::info;

/// Catalog file: `[{name, description, stock_level, usage_frequency}]`.
pub fn load_catalog(path: &Path) -> Result<Vec<Candidate>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading catalog {}", path.display()))?;
    let entries: Vec<Candidate> = serde_json::from_str(&text).with_context(|| format!("parsing catalog {}", path.display()))?;
    let mut seen = HashSet::new();
    let catalog: Vec<Candidate> = entries.into_iter().filter(|c| seen.insert(c.id.clone())).collect();
    info!(items = catalog.len(), path=%path.display(), "catalog_loaded");
    Ok(catalog)
}

/// Labeled examples: `[{query, items: [..]}]`.
pub fn load_examples(path: &Path) -> Result<Vec<LabeledQuery>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading examples {}", path.display()))?;
    let examples: Vec<LabeledQuery> = serde_json::from_str(&text).with_context(|| format!("parsing examples {}", path.display()))?;
    info!(examples = examples.len(), path=%path.display(), "examples_loaded");
    Ok(examples)
}

/// Empty when `path` is absent.
pub fn load_optional<T>(path: Option<&Path>, load: impl FnOnce(&Path) -> Result<Vec<T>>) -> Result<Vec<T>> {
    path.map_or_else(|| Ok(Vec::new()), load)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn catalog_rows_become_candidates() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, r#"[{{"name":"Paracetamol","description":"fever","usage_frequency":4}},{{"name":"Paracetamol"}},{{"name":"Zinc"}}]"#).unwrap();
        let c = load_catalog(f.path()).unwrap();
        assert_eq!(c.len(), 2);
        assert_eq!(c[0].usage_frequency, 4);
        assert_eq!(c[1].description, "");
    }

    #[test]
    fn examples_accept_legacy_field_names() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, r#"[{{"symptoms":"fever","medicines":["Paracetamol"]}},{{"query":"cough","items":["Syrup"]}}]"#).unwrap();
        let e = load_examples(f.path()).unwrap();
        assert_eq!(e[0].query, "fever");
        assert_eq!(e[1].items, vec!["Syrup"]);
    }

    #[test]
    fn missing_file_has_context() {
        let err = load_catalog(Path::new("/nonexistent/catalog.json")).unwrap_err();
        assert!(format!("{err:#}").contains("reading catalog"));
    }
}
