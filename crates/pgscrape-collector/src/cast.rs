//! Coercion of raw text values into label strings and sample values.

/// Label value for a raw column value; null becomes the empty string.
pub fn cast_string(raw: Option<&str>) -> String {
    raw.unwrap_or_default().to_string()
}

/// Numeric value of a raw column value, multiplied by `scale`.
///
/// Booleans in postgres text form (`t`/`f`) map to 1 and 0. Nulls and
/// unparsable values yield `default` unscaled, or NaN without one.
pub fn cast_f64(raw: Option<&str>, scale: f64, default: Option<f64>) -> f64 {
    let fallback = default.unwrap_or(f64::NAN);
    let Some(raw) = raw else {
        return fallback;
    };
    let value = match raw.trim() {
        "t" | "true" => 1.0,
        "f" | "false" => 0.0,
        text => match text.parse::<f64>() {
            Ok(v) => v,
            Err(_) => return fallback,
        },
    };
    value * scale
}
