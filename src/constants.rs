use rand::Rng;

/// Expected database schema version
/// Client and server databases must both use this version
pub const EXPECTED_DB_VERSION: &str = "1";

/// Chunk id reserved for the init segment in the `chunks` table
pub const INIT_CHUNK_ID: i64 = -1;

/// Delay between a room entering `recording` and the instant guests start encoding
pub const DEFAULT_LEAD_TIME_MS: i64 = 3000;

/// Default number of chunks in flight per recording
pub const DEFAULT_MAX_CONCURRENCY: usize = 3;

/// Upper bound for the per-recording worker pool
pub const MAX_CONCURRENCY_CEILING: usize = 10;

/// Default retry budget per chunk before it is marked failed
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base retry delay, doubled per attempt
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 500;

/// Cap for a single retry delay
pub const MAX_RETRY_BACKOFF_MS: u64 = 5000;

/// Lifetime of a direct-upload grant
pub const DEFAULT_DIRECT_UPLOAD_TTL_SECS: i64 = 300;

/// Header carrying the sender-computed SHA-256 of a chunk body
pub const CONTENT_HASH_HEADER: &str = "x-content-sha256";

/// Header carrying a room's access token for privileged actions
pub const ACCESS_TOKEN_HEADER: &str = "x-access-token";

/// Retry delay for the given attempt (1-based), exponential with jitter
pub fn backoff_ms(base_ms: u64, attempt: u32) -> u64 {
    let exp = base_ms.saturating_mul(1u64 << attempt.saturating_sub(1).min(16));
    let capped = exp.min(MAX_RETRY_BACKOFF_MS.max(base_ms));
    let jitter = if capped >= 4 {
        rand::thread_rng().gen_range(0..=capped / 4)
    } else {
        0
    };
    capped - jitter
}

/// Generate an opaque access token for a room
pub fn generate_access_token() -> String {
    format!(
        "tok_{}",
        rand::thread_rng()
            .sample_iter(&rand::distributions::Alphanumeric)
            .take(32)
            .map(char::from)
            .collect::<String>()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        assert!(backoff_ms(100, 1) <= 100);
        assert!(backoff_ms(100, 2) <= 200);
        assert!(backoff_ms(100, 3) >= 300);
        assert!(backoff_ms(100, 30) <= MAX_RETRY_BACKOFF_MS);
        assert_eq!(backoff_ms(0, 5), 0);
    }

    #[test]
    fn test_access_token_shape() {
        let token = generate_access_token();
        assert!(token.starts_with("tok_"));
        assert_eq!(token.len(), 36);
        assert_ne!(token, generate_access_token());
    }
}
