//! Identifier normalization
//!
//! Every identifier is normalized before it is stored or compared, so that
//! `https://doi.org/10.1000/ABC` and `doi:10.1000/abc` resolve to the same
//! registry entry.

const DOI_PREFIXES: &[&str] = &[
    "https://doi.org/",
    "http://doi.org/",
    "https://dx.doi.org/",
    "http://dx.doi.org/",
    "doi:",
];

/// Normalize a DOI: lowercase, resolver prefixes stripped.
///
/// Returns `None` when the value does not look like a DOI (`10.<prefix>/<suffix>`).
#[must_use]
pub fn normalize_doi(raw: &str) -> Option<String> {
    let lower = raw.trim().to_lowercase();
    let stripped = DOI_PREFIXES
        .iter()
        .find_map(|prefix| lower.strip_prefix(*prefix))
        .unwrap_or(lower.as_str())
        .trim();

    let (prefix, suffix) = stripped.split_once('/')?;
    if !prefix.starts_with("10.") || prefix.len() < 4 || suffix.is_empty() {
        return None;
    }
    Some(stripped.to_string())
}

/// Normalize a provider-assigned id of the form `namespace:value`.
///
/// The namespace is lowercased; the value is kept verbatim apart from
/// surrounding whitespace, since provider ids are frequently case-sensitive.
#[must_use]
pub fn normalize_provider_id(raw: &str) -> Option<String> {
    let (namespace, value) = raw.trim().split_once(':')?;
    let namespace = namespace.trim().to_ascii_lowercase();
    let value = value.trim();
    if namespace.is_empty() || value.is_empty() {
        return None;
    }
    Some(format!("{namespace}:{value}"))
}

/// Normalize a title for fuzzy matching.
///
/// Lowercases, replaces punctuation with spaces and collapses whitespace.
/// Returns `None` for titles with no alphanumeric content.
#[must_use]
pub fn normalize_title(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doi_prefixes_are_stripped() {
        let expected = Some("10.1000/xyz123".to_string());
        assert_eq!(normalize_doi("10.1000/XYZ123"), expected);
        assert_eq!(normalize_doi("https://doi.org/10.1000/xyz123"), expected);
        assert_eq!(normalize_doi("  doi:10.1000/xyz123 "), expected);
        assert_eq!(normalize_doi("http://dx.doi.org/10.1000/xyz123"), expected);
    }

    #[test]
    fn doi_rejects_non_doi_values() {
        assert_eq!(normalize_doi(""), None);
        assert_eq!(normalize_doi("arxiv:2401.00001"), None);
        assert_eq!(normalize_doi("10.1000/"), None);
        assert_eq!(normalize_doi("11.1000/abc"), None);
    }

    #[test]
    fn provider_id_namespace_is_lowercased() {
        assert_eq!(
            normalize_provider_id(" ArXiv:2401.00001v2 "),
            Some("arxiv:2401.00001v2".to_string())
        );
        assert_eq!(
            normalize_provider_id("openalex:W2741809807"),
            Some("openalex:W2741809807".to_string())
        );
        assert_eq!(normalize_provider_id("no-namespace"), None);
        assert_eq!(normalize_provider_id(":value"), None);
    }

    #[test]
    fn title_normalization_collapses_punctuation() {
        assert_eq!(
            normalize_title("  Attention Is All You Need!  "),
            Some("attention is all you need".to_string())
        );
        assert_eq!(
            normalize_title("BERT: Pre-training of Deep\tBidirectional Transformers"),
            Some("bert pre training of deep bidirectional transformers".to_string())
        );
        assert_eq!(normalize_title(" -- "), None);
    }
}
