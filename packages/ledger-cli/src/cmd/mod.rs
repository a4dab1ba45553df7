//! Command implementations

pub mod cleanup;
pub mod inspect;
pub mod jobs;

/// Collapse sorted page numbers into `1-3, 5, 7-9`.
pub fn page_ranges(pages: &[u32]) -> String {
    let mut parts = Vec::new();
    let mut iter = pages.iter().copied().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end += 1;
            iter.next();
        }
        parts.push(if start == end {
            start.to_string()
        } else {
            format!("{start}-{end}")
        });
    }
    if parts.is_empty() {
        "none".to_string()
    } else {
        parts.join(", ")
    }
}
