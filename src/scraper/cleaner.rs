use super::FetchError;

// ── Price text ────────────────────────────────────────────────────────────────

/// Strip everything except digits, dot, minus.
/// "$1,234.56" → "1234.56" | "-0.50" → "-0.50"
pub fn clean_price_text(s: &str) -> String {
    s.trim()
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect()
}

/// Parse scraped price text into a strictly positive, finite price.
/// "$0.00", "N/A", "-3.10" are all failures, never valid quotes.
pub fn parse_price(raw: &str) -> Result<f64, FetchError> {
    let cleaned = clean_price_text(raw);
    let invalid = || FetchError::InvalidPrice { raw: raw.trim().to_string() };

    let value: f64 = cleaned.parse().map_err(|_| invalid())?;
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(invalid())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
