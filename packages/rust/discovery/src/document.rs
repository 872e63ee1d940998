//! Search a rendered page for the PDF it wraps.
//!
//! Indirect gazette links open a viewer page instead of the file. The viewer
//! either links the PDF, or embeds it through `<embed>`, `<object>`, or a frame.

use std::sync::LazyLock;

use domharvest_shared::mentions_pdf;
use scraper::{Html, Selector};
use url::Url;

/// Candidate elements in priority order, with the attribute holding the target.
static CANDIDATES: LazyLock<Vec<(Selector, &'static str)>> = LazyLock::new(|| {
    [
        ("a[href]", "href"),
        ("embed[src]", "src"),
        ("object[data]", "data"),
        ("iframe[src]", "src"),
        ("frame[src]", "src"),
    ]
    .into_iter()
    .map(|(css, attr)| (Selector::parse(css).expect("candidate selector"), attr))
    .collect()
});

/// First PDF reference in `html`, resolved against `page_url`.
///
/// HTML attribute names are case-folded by the parser, so `SRC=` and `src=`
/// match alike; the ".pdf" test on the value is case-insensitive.
pub fn find_pdf_reference(html: &str, page_url: &Url) -> Option<String> {
    let doc = Html::parse_document(html);

    for (selector, attr) in CANDIDATES.iter() {
        let hit = doc
            .select(selector)
            .filter_map(|el| el.value().attr(attr))
            .map(str::trim)
            .find(|value| mentions_pdf(value));

        if let Some(value) = hit {
            return Some(
                page_url
                    .join(value)
                    .map(|u| u.to_string())
                    .unwrap_or_else(|_| value.to_string()),
            );
        }
    }

    None
}
