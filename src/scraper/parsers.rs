use super::FetchError;
use ::scraper::{Html, Selector};

/// Text of the first element matching any of `selectors`, tried in order.
/// Elements with only whitespace are treated as not yet rendered.
pub fn first_text(html: &str, selectors: &[String]) -> Result<Option<String>, FetchError> {
    let doc = Html::parse_document(html);

    for sel_str in selectors {
        let sel = Selector::parse(sel_str)
            .map_err(|e| FetchError::BadSelector(format!("{}: {:?}", sel_str, e)))?;

        let found = doc
            .select(&sel)
            .map(|el| el.text().collect::<String>().trim().to_string())
            .find(|text| !text.is_empty());

        if found.is_some() {
            return Ok(found);
        }
    }

    Ok(None)
}
