use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_API_URL: &str = "http://127.0.0.1:8001";

#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub api_url: String,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub log_dir: Option<PathBuf>,
    pub push_enabled: bool,
    pub enrichment_enabled: bool,
    pub enrichment_turbo: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            request_timeout: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(6),
            log_dir: None,
            push_enabled: true,
            enrichment_enabled: true,
            enrichment_turbo: false,
        }
    }
}

impl CoreConfig {
    pub fn from_env() -> Self {
        let api_url = read_env_string("LAUNCHER_API_URL")
            .map(|value| value.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());

        Self {
            api_url,
            request_timeout: Duration::from_secs(read_env_u64(
                "LAUNCHER_HTTP_TIMEOUT_SECS",
                20,
                1,
                300,
            )),
            connect_timeout: Duration::from_secs(read_env_u64(
                "LAUNCHER_CONNECT_TIMEOUT_SECS",
                6,
                1,
                60,
            )),
            log_dir: read_env_string("LAUNCHER_LOG_DIR").map(PathBuf::from),
            push_enabled: read_env_bool("LAUNCHER_PUSH_ENABLED", true),
            enrichment_enabled: read_env_bool("LAUNCHER_ENRICHMENT_ENABLED", true),
            enrichment_turbo: read_env_bool("LAUNCHER_ENRICHMENT_TURBO", false),
        }
    }
}

fn read_env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|value| parse_bool(&value))
        .unwrap_or(default)
}

fn read_env_u64(key: &str, default: u64, min: u64, max: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
        .clamp(min, max)
}

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_truthy_values() {
        assert!(parse_bool("1"));
        assert!(parse_bool(" Yes "));
        assert!(parse_bool("ON"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("off"));
        assert!(!parse_bool(""));
    }

    #[test]
    fn defaults_point_at_local_backend() {
        let config = CoreConfig::default();
        assert_eq!(config.api_url, "http://127.0.0.1:8001");
        assert_eq!(config.request_timeout, Duration::from_secs(20));
        assert!(config.push_enabled);
        assert!(!config.enrichment_turbo);
    }
}
