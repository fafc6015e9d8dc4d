/// Canonical form of a category label: invisible characters stripped, whitespace runs
/// collapsed to `_`, ASCII lowercase.
pub(crate) fn normalize_label(value: &str) -> String {
    let cleaned = value.replace(['\u{feff}', '\u{200b}'], "");
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join("_");
    collapsed.to_ascii_lowercase()
}
