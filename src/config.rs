use std::env;
use std::time::Duration;

/// Service configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub db_max_connections: u32,
    pub db_acquire_timeout: Duration,
    pub host: String,
    pub port: u16,

    pub stripe_secret_key: String,
    pub stripe_webhook_secret: String,
    pub stripe_api_base: String,
    pub stripe_timeout: Duration,

    pub webhook_tolerance_secs: i64,
    pub webhook_max_attempts: i32,
    pub webhook_retry_initial: Duration,
    pub webhook_retry_max: Duration,
    pub sweeper_interval: Duration,
    pub sweeper_batch_size: i64,

    pub default_platform_percentage: i32,

    pub connect_return_url: String,
    pub connect_refresh_url: String,
    pub checkout_success_url: String,
    pub checkout_cancel_url: String,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        dotenvy::dotenv().ok();

        let default_platform_percentage: i32 = parse_or("DEFAULT_PLATFORM_PERCENTAGE", 10)?;
        if !(0..=100).contains(&default_platform_percentage) {
            return Err(format!(
                "DEFAULT_PLATFORM_PERCENTAGE must be between 0 and 100, got {}",
                default_platform_percentage
            ));
        }

        let webhook_max_attempts: i32 = parse_or("WEBHOOK_MAX_ATTEMPTS", 5)?;
        if webhook_max_attempts < 1 {
            return Err("WEBHOOK_MAX_ATTEMPTS must be at least 1".to_string());
        }

        let db_max_connections: u32 = parse_or("DB_MAX_CONNECTIONS", 10)?;
        if db_max_connections < 1 {
            return Err("DB_MAX_CONNECTIONS must be at least 1".to_string());
        }

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            db_max_connections,
            db_acquire_timeout: Duration::from_secs(parse_or("DB_ACQUIRE_TIMEOUT_SECS", 3)?),
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: parse_or("PORT", 8095)?,

            stripe_secret_key: required("STRIPE_SECRET_KEY")?,
            stripe_webhook_secret: required("STRIPE_WEBHOOK_SECRET")?,
            stripe_api_base: env::var("STRIPE_API_BASE")
                .unwrap_or_else(|_| "https://api.stripe.com".to_string()),
            stripe_timeout: Duration::from_secs(parse_or("STRIPE_TIMEOUT_SECS", 10)?),

            webhook_tolerance_secs: parse_or("WEBHOOK_TOLERANCE_SECS", 300)?,
            webhook_max_attempts,
            webhook_retry_initial: Duration::from_secs(parse_or("WEBHOOK_RETRY_INITIAL_SECS", 30)?),
            webhook_retry_max: Duration::from_secs(parse_or("WEBHOOK_RETRY_MAX_SECS", 3600)?),
            sweeper_interval: Duration::from_secs(parse_or("SWEEPER_INTERVAL_SECS", 30)?),
            sweeper_batch_size: parse_or("SWEEPER_BATCH_SIZE", 50)?,

            default_platform_percentage,

            connect_return_url: env::var("CONNECT_RETURN_URL")
                .unwrap_or_else(|_| "http://localhost:3000/connect/return".to_string()),
            connect_refresh_url: env::var("CONNECT_REFRESH_URL")
                .unwrap_or_else(|_| "http://localhost:3000/connect/refresh".to_string()),
            checkout_success_url: env::var("CHECKOUT_SUCCESS_URL")
                .unwrap_or_else(|_| "http://localhost:3000/checkout/success".to_string()),
            checkout_cancel_url: env::var("CHECKOUT_CANCEL_URL")
                .unwrap_or_else(|_| "http://localhost:3000/checkout/cancel".to_string()),
        })
    }
}

fn required(key: &str) -> Result<String, String> {
    env::var(key).map_err(|_| format!("{} must be set", key))
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T, String> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| format!("{} has an invalid value: {}", key, raw)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn set_required() {
        env::set_var("DATABASE_URL", "postgres://localhost/reconciliation_test");
        env::set_var("STRIPE_SECRET_KEY", "sk_test_config");
        env::set_var("STRIPE_WEBHOOK_SECRET", "whsec_config");
    }

    fn clear_pool_vars() {
        env::remove_var("DB_MAX_CONNECTIONS");
        env::remove_var("DB_ACQUIRE_TIMEOUT_SECS");
    }

    #[test]
    #[serial]
    fn test_pool_settings_default() {
        set_required();
        clear_pool_vars();

        let config = Config::from_env().unwrap();
        assert_eq!(config.db_max_connections, 10);
        assert_eq!(config.db_acquire_timeout, Duration::from_secs(3));
    }

    #[test]
    #[serial]
    fn test_invalid_pool_settings_fail_startup() {
        set_required();

        clear_pool_vars();
        env::set_var("DB_MAX_CONNECTIONS", "lots");
        let err = Config::from_env().unwrap_err();
        assert!(err.contains("DB_MAX_CONNECTIONS"), "{}", err);

        env::set_var("DB_MAX_CONNECTIONS", "0");
        assert!(Config::from_env().is_err());

        clear_pool_vars();
        env::set_var("DB_ACQUIRE_TIMEOUT_SECS", "-1");
        let err = Config::from_env().unwrap_err();
        assert!(err.contains("DB_ACQUIRE_TIMEOUT_SECS"), "{}", err);

        clear_pool_vars();
    }
}
