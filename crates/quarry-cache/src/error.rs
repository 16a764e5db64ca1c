/// Errors produced by store-directory management and fingerprinting.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {message}")]
    Json { message: String },

    #[error("storage error: {0}")]
    Storage(#[from] quarry_storage::StorageError),
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        // `serde_json::Error` display strings can include user-provided
        // scalar values (e.g. `invalid type: string "..."`). Manifests can
        // contain user paths; avoid echoing string values in errors.
        let message = sanitize_json_error_message(&err.to_string());
        Self::Json { message }
    }
}

/// Redacts double-quoted substrings (and the first backticked segment) from a
/// `serde_json` error message, keeping the structure and line/column info.
pub fn sanitize_json_error_message(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    let mut rest = message;
    while let Some(start) = rest.find('"') {
        // Include the opening quote.
        out.push_str(&rest[..start + 1]);
        rest = &rest[start + 1..];

        let mut end = None;
        let bytes = rest.as_bytes();
        for (idx, &b) in bytes.iter().enumerate() {
            if b != b'"' {
                continue;
            }

            // Quotes preceded by an odd number of backslashes are escaped.
            let mut backslashes = 0usize;
            let mut k = idx;
            while k > 0 && bytes[k - 1] == b'\\' {
                backslashes += 1;
                k -= 1;
            }
            if backslashes % 2 == 0 {
                end = Some(idx);
                break;
            }
        }

        let Some(end) = end else {
            // Unterminated quote: redact the remainder and stop.
            out.push_str("<redacted>");
            rest = "";
            break;
        };
        out.push_str("<redacted>\"");
        rest = &rest[end + 1..];
    }
    out.push_str(rest);

    // `serde` wraps unknown fields/variants in backticks; redact only the
    // first backticked segment so the expected-value list stays actionable.
    if let Some(start) = out.find('`') {
        if let Some(end_rel) = out[start + 1..].find('`') {
            let end = start + 1 + end_rel;
            out.replace_range(start + 1..end, "<redacted>");
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_error_json_does_not_echo_string_values() {
        let secret_suffix = "quarry-cache-secret-token";
        let secret = format!("prefix\"{secret_suffix}");
        let err = serde_json::from_value::<bool>(serde_json::json!(secret))
            .expect_err("expected type error");

        let cache_err = CacheError::from(err);
        let message = cache_err.to_string();
        assert!(
            !message.contains(secret_suffix),
            "expected CacheError json message to omit string values: {message}"
        );
        assert!(
            message.contains("<redacted>"),
            "expected CacheError json message to include redaction marker: {message}"
        );
    }
}
