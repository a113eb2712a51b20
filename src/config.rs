use std::env;

use dotenvy::dotenv;

/// CORS policy for the caller-facing `/v1` surface.
#[derive(Debug, Clone)]
pub enum CorsMode {
    /// Allow any origin (default when CORS_ALLOWED_ORIGINS is unset).
    AllowAll,
    /// Allow specific origins (comma-separated list).
    AllowList(Vec<String>),
}

impl CorsMode {
    /// Header value for `Access-Control-Allow-Origin` given a request origin.
    pub fn allow_origin_value(&self, origin: Option<&str>) -> Option<String> {
        match self {
            CorsMode::AllowAll => Some("*".to_string()),
            CorsMode::AllowList(allowed) => origin
                .filter(|o| allowed.iter().any(|a| a == o))
                .map(|o| o.to_string()),
        }
    }
}

pub struct Config {
    pub site_url: String,
    pub client_urls: Vec<String>,
    /// 32-byte AEAD key decoded from the 64-hex-char ENCRYPTION_KEY.
    pub encryption_key: [u8; 32],
    pub store_url: String,
    pub store_admin_key: String,
    pub cors_mode: CorsMode,
    pub host: String,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv().ok();

        let site_url = env::var("SITE_URL").expect("SITE_URL must be set");
        url::Url::parse(&site_url).expect("SITE_URL must be a valid URL");
        let site_url = site_url.trim_end_matches('/').to_string();

        let client_urls: Vec<String> = env::var("CLIENT_URLS")
            .expect("CLIENT_URLS must be set")
            .split(',')
            .map(|s| s.trim().trim_end_matches('/').to_string())
            .filter(|s| !s.is_empty())
            .collect();
        for client_url in &client_urls {
            url::Url::parse(client_url).expect("CLIENT_URLS entries must be valid URLs");
        }

        let encryption_key = parse_encryption_key(
            &env::var("ENCRYPTION_KEY").expect("ENCRYPTION_KEY must be set"),
        )
        .expect("ENCRYPTION_KEY must be 64 hex characters");

        let store_url = env::var("STORE_URL")
            .expect("STORE_URL must be set")
            .trim_end_matches('/')
            .to_string();
        let store_admin_key = env::var("STORE_ADMIN_KEY").expect("STORE_ADMIN_KEY must be set");

        let cors_mode = match env::var("CORS_ALLOWED_ORIGINS").as_deref() {
            Ok(origins) if !origins.trim().is_empty() && origins.trim() != "*" => {
                CorsMode::AllowList(
                    origins
                        .split(',')
                        .map(|s| s.trim().trim_end_matches('/').to_string())
                        .filter(|s| !s.is_empty())
                        .collect(),
                )
            }
            _ => CorsMode::AllowAll,
        };

        let host = env::var("MODELGATE_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("MODELGATE_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8787);

        Self {
            site_url,
            client_urls,
            encryption_key,
            store_url,
            store_admin_key,
            cors_mode,
            host,
            port,
        }
    }
}

/// Decode a 64-char hex string into the 32-byte process-wide AEAD key.
pub fn parse_encryption_key(hex: &str) -> Option<[u8; 32]> {
    let hex = hex.trim();
    if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let mut key = [0u8; 32];
    for (i, byte) in key.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_encryption_key() {
        let hex = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";
        let key = parse_encryption_key(hex).unwrap();
        assert_eq!(key[0], 0x00);
        assert_eq!(key[1], 0x11);
        assert_eq!(key[31], 0xff);
    }

    #[test]
    fn test_parse_encryption_key_rejects_bad_input() {
        assert!(parse_encryption_key("short").is_none());
        assert!(parse_encryption_key(&"zz".repeat(32)).is_none());
        assert!(parse_encryption_key(&"00".repeat(31)).is_none());
    }

    #[test]
    fn test_cors_allow_list() {
        let mode = CorsMode::AllowList(vec!["https://app.example.com".to_string()]);
        assert_eq!(
            mode.allow_origin_value(Some("https://app.example.com")),
            Some("https://app.example.com".to_string())
        );
        assert_eq!(mode.allow_origin_value(Some("https://evil.example.com")), None);
        assert_eq!(mode.allow_origin_value(None), None);
    }

    #[test]
    fn test_cors_allow_all() {
        let mode = CorsMode::AllowAll;
        assert_eq!(mode.allow_origin_value(None), Some("*".to_string()));
    }
}
