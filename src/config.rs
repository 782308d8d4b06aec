use crate::domain::{ChainId, Denom, TokenDecimals};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub database_path: String,
    pub chain_id: ChainId,
    pub event_feed_url: Option<String>,
    pub price_feed_url: Option<String>,
    pub refresh_interval_ms: u64,
    pub refresh_batch_blocks: i64,
    pub late_event_lookback_blocks: i64,
    /// Run a full rebuild every N scheduled refreshes; 0 disables.
    pub full_rebuild_every: u64,
    pub refresh_concurrency: usize,
    pub freshness_threshold_secs: i64,
    pub token_decimals: TokenDecimals,
    pub max_page_size: usize,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_map(std::env::vars().collect())
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn from_env_map(env_map: HashMap<String, String>) -> Result<Self, ConfigError> {
        let port = parse_or(&env_map, "PORT", 8080u16, "must be a valid u16")?;

        let database_path = env_map
            .get("DATABASE_PATH")
            .cloned()
            .ok_or_else(|| ConfigError::MissingEnv("DATABASE_PATH".to_string()))?;

        let chain_id = env_map
            .get("CHAIN_ID")
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(ChainId::new)
            .ok_or_else(|| ConfigError::MissingEnv("CHAIN_ID".to_string()))?;

        let event_feed_url = optional(&env_map, "EVENT_FEED_URL");
        let price_feed_url = optional(&env_map, "PRICE_FEED_URL");

        let refresh_interval_ms = parse_or(
            &env_map,
            "REFRESH_INTERVAL_MS",
            60_000u64,
            "must be a valid u64",
        )?;
        let refresh_batch_blocks = parse_or(
            &env_map,
            "REFRESH_BATCH_BLOCKS",
            10_000i64,
            "must be a valid i64",
        )?;
        if refresh_batch_blocks <= 0 {
            return Err(ConfigError::InvalidValue(
                "REFRESH_BATCH_BLOCKS".to_string(),
                "must be positive".to_string(),
            ));
        }
        let late_event_lookback_blocks = parse_or(
            &env_map,
            "LATE_EVENT_LOOKBACK_BLOCKS",
            100i64,
            "must be a valid i64",
        )?;
        if late_event_lookback_blocks < 0 {
            return Err(ConfigError::InvalidValue(
                "LATE_EVENT_LOOKBACK_BLOCKS".to_string(),
                "must not be negative".to_string(),
            ));
        }
        let full_rebuild_every =
            parse_or(&env_map, "FULL_REBUILD_EVERY", 0u64, "must be a valid u64")?;
        let refresh_concurrency = parse_or(
            &env_map,
            "REFRESH_CONCURRENCY",
            4usize,
            "must be a valid usize",
        )?;
        if refresh_concurrency == 0 {
            return Err(ConfigError::InvalidValue(
                "REFRESH_CONCURRENCY".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        let freshness_threshold_secs = parse_or(
            &env_map,
            "FRESHNESS_THRESHOLD_SECS",
            600i64,
            "must be a valid i64",
        )?;
        let default_decimals = parse_or(
            &env_map,
            "DEFAULT_TOKEN_DECIMALS",
            6u32,
            "must be a valid u32",
        )?;
        let overrides = parse_token_decimals_from_map(&env_map)?;
        let max_page_size = parse_or(&env_map, "MAX_PAGE_SIZE", 100usize, "must be a valid usize")?;
        if max_page_size == 0 {
            return Err(ConfigError::InvalidValue(
                "MAX_PAGE_SIZE".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        Ok(Config {
            port,
            database_path,
            chain_id,
            event_feed_url,
            price_feed_url,
            refresh_interval_ms,
            refresh_batch_blocks,
            late_event_lookback_blocks,
            full_rebuild_every,
            refresh_concurrency,
            freshness_threshold_secs,
            token_decimals: TokenDecimals::new(default_decimals, overrides),
            max_page_size,
        })
    }
}

fn optional(env_map: &HashMap<String, String>, key: &str) -> Option<String> {
    env_map
        .get(key)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn parse_or<T: FromStr>(
    env_map: &HashMap<String, String>,
    key: &str,
    default: T,
    expectation: &str,
) -> Result<T, ConfigError> {
    match env_map.get(key).map(|s| s.trim()) {
        None | Some("") => Ok(default),
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue(key.to_string(), expectation.to_string())),
    }
}

/// Parse `TOKEN_DECIMALS` as `denom:decimals` pairs separated by commas.
fn parse_token_decimals_from_map(
    env_map: &HashMap<String, String>,
) -> Result<BTreeMap<Denom, u32>, ConfigError> {
    let Some(raw) = env_map.get("TOKEN_DECIMALS") else {
        return Ok(BTreeMap::new());
    };

    let mut overrides = BTreeMap::new();
    for entry in raw.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()) {
        // Split on the last ':' so denoms containing ':' survive.
        let (denom, decimals) = entry.rsplit_once(':').ok_or_else(|| {
            ConfigError::InvalidValue(
                "TOKEN_DECIMALS".to_string(),
                format!("expected denom:decimals, got {}", entry),
            )
        })?;
        let decimals = decimals.trim().parse::<u32>().map_err(|_| {
            ConfigError::InvalidValue(
                "TOKEN_DECIMALS".to_string(),
                format!("invalid decimals in {}", entry),
            )
        })?;
        overrides.insert(Denom::new(denom.trim()), decimals);
    }
    Ok(overrides)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_required_env() -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("DATABASE_PATH".to_string(), "/tmp/test.db".to_string());
        map.insert("CHAIN_ID".to_string(), "phoenix-1".to_string());
        map
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_env_map(setup_required_env()).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.chain_id, ChainId::new("phoenix-1"));
        assert_eq!(config.event_feed_url, None);
        assert_eq!(config.refresh_interval_ms, 60_000);
        assert_eq!(config.refresh_batch_blocks, 10_000);
        assert_eq!(config.late_event_lookback_blocks, 100);
        assert_eq!(config.full_rebuild_every, 0);
        assert_eq!(config.refresh_concurrency, 4);
        assert_eq!(config.freshness_threshold_secs, 600);
        assert_eq!(config.token_decimals, TokenDecimals::default());
        assert_eq!(config.max_page_size, 100);
    }

    #[test]
    fn test_missing_database_path() {
        let mut env_map = setup_required_env();
        env_map.remove("DATABASE_PATH");
        let result = Config::from_env_map(env_map);
        match result {
            Err(ConfigError::MissingEnv(s)) => assert_eq!(s, "DATABASE_PATH"),
            _ => panic!("Expected MissingEnv error"),
        }
    }

    #[test]
    fn test_missing_chain_id() {
        let mut env_map = setup_required_env();
        env_map.insert("CHAIN_ID".to_string(), "  ".to_string());
        let result = Config::from_env_map(env_map);
        match result {
            Err(ConfigError::MissingEnv(s)) => assert_eq!(s, "CHAIN_ID"),
            _ => panic!("Expected MissingEnv error"),
        }
    }

    #[test]
    fn test_invalid_port() {
        let mut env_map = setup_required_env();
        env_map.insert("PORT".to_string(), "not_a_number".to_string());
        let result = Config::from_env_map(env_map);
        match result {
            Err(ConfigError::InvalidValue(k, _)) => assert_eq!(k, "PORT"),
            _ => panic!("Expected InvalidValue error"),
        }
    }

    #[test]
    fn test_zero_batch_rejected() {
        let mut env_map = setup_required_env();
        env_map.insert("REFRESH_BATCH_BLOCKS".to_string(), "0".to_string());
        match Config::from_env_map(env_map) {
            Err(ConfigError::InvalidValue(k, _)) => assert_eq!(k, "REFRESH_BATCH_BLOCKS"),
            _ => panic!("Expected InvalidValue error"),
        }
    }

    #[test]
    fn test_token_decimals_overrides() {
        let mut env_map = setup_required_env();
        env_map.insert("DEFAULT_TOKEN_DECIMALS".to_string(), "8".to_string());
        env_map.insert(
            "TOKEN_DECIMALS".to_string(),
            "astro:6, ibc/ABC:18,".to_string(),
        );
        let config = Config::from_env_map(env_map).unwrap();

        let mut expected = BTreeMap::new();
        expected.insert(Denom::new("astro"), 6);
        expected.insert(Denom::new("ibc/ABC"), 18);
        assert_eq!(config.token_decimals, TokenDecimals::new(8, expected));
    }

    #[test]
    fn test_invalid_token_decimals() {
        let mut env_map = setup_required_env();
        env_map.insert("TOKEN_DECIMALS".to_string(), "astro".to_string());
        match Config::from_env_map(env_map) {
            Err(ConfigError::InvalidValue(k, _)) => assert_eq!(k, "TOKEN_DECIMALS"),
            _ => panic!("Expected InvalidValue error"),
        }
    }

    #[test]
    fn test_feed_urls() {
        let mut env_map = setup_required_env();
        env_map.insert(
            "EVENT_FEED_URL".to_string(),
            "https://feed.example/api".to_string(),
        );
        env_map.insert("PRICE_FEED_URL".to_string(), "".to_string());
        let config = Config::from_env_map(env_map).unwrap();
        assert_eq!(
            config.event_feed_url.as_deref(),
            Some("https://feed.example/api")
        );
        assert_eq!(config.price_feed_url, None);
    }
}
