use std::time::Duration;

use crate::error::ConfigError;

const MIN_SECRET_LENGTH: usize = 32;

#[derive(serde::Deserialize, Clone)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub application: ApplicationSettings,
    pub auth: AuthSettings,
}

#[derive(serde::Deserialize, Clone)]
pub struct ApplicationSettings {
    pub host: String,
    pub port: u16,
}

#[derive(serde::Deserialize, Clone)]
pub struct DatabaseSettings {
    pub username: String,
    pub password: String,
    pub port: u16,
    pub host: String,
    pub database_name: String,
}

impl DatabaseSettings {
    pub fn connection_string(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, self.database_name
        )
    }
}

/// Session core settings
///
/// Every field is required; a missing key fails deserialization and
/// aborts startup.
#[derive(serde::Deserialize, Clone)]
pub struct AuthSettings {
    pub access_secret: String,
    pub refresh_secret: String,
    pub issuer: String,
    pub access_token_expiry: i64,   // seconds (e.g., 900 for 15 minutes)
    pub refresh_token_expiry: i64,  // seconds (e.g., 604800 for 7 days)
    pub csrf_token_expiry: i64,     // seconds, normally equal to access_token_expiry
    pub bcrypt_cost: u32,
    pub store_timeout_ms: u64,
    pub ledger_sweep_interval: u64, // seconds, 0 disables the sweeper
}

impl AuthSettings {
    /// Check the invariants the session core relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, secret) in [
            ("auth.access_secret", &self.access_secret),
            ("auth.refresh_secret", &self.refresh_secret),
        ] {
            if secret.is_empty() {
                return Err(ConfigError::MissingRequired(name.to_string()));
            }
            if secret.len() < MIN_SECRET_LENGTH {
                return Err(ConfigError::InvalidValue(format!(
                    "{} must be at least {} bytes",
                    name, MIN_SECRET_LENGTH
                )));
            }
        }

        // A leaked access secret must not be able to mint refresh tokens.
        if self.access_secret == self.refresh_secret {
            return Err(ConfigError::InvalidValue(
                "auth.access_secret and auth.refresh_secret must differ".to_string(),
            ));
        }

        if self.issuer.trim().is_empty() {
            return Err(ConfigError::MissingRequired("auth.issuer".to_string()));
        }

        for (name, ttl) in [
            ("auth.access_token_expiry", self.access_token_expiry),
            ("auth.refresh_token_expiry", self.refresh_token_expiry),
            ("auth.csrf_token_expiry", self.csrf_token_expiry),
        ] {
            if ttl <= 0 {
                return Err(ConfigError::InvalidValue(format!("{} must be positive", name)));
            }
        }

        if self.refresh_token_expiry < self.access_token_expiry {
            return Err(ConfigError::InvalidValue(
                "auth.refresh_token_expiry must not be shorter than auth.access_token_expiry"
                    .to_string(),
            ));
        }

        if !(4..=31).contains(&self.bcrypt_cost) {
            return Err(ConfigError::InvalidValue(
                "auth.bcrypt_cost must be between 4 and 31".to_string(),
            ));
        }

        if self.store_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "auth.store_timeout_ms must be positive".to_string(),
            ));
        }

        Ok(())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.ledger_sweep_interval > 0).then(|| Duration::from_secs(self.ledger_sweep_interval))
    }
}

/// Load settings from `configuration.{yaml,toml,json}` overlaid by
/// `APP_`-prefixed environment variables (`APP_AUTH__ACCESS_SECRET`).
pub fn get_configuration() -> Result<Settings, ConfigError> {
    let settings = config::Config::builder()
        .add_source(config::File::with_name("configuration").required(false))
        .add_source(
            config::Environment::with_prefix("APP")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;
    let settings = settings.try_deserialize::<Settings>()?;
    settings.auth.validate()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_settings() -> AuthSettings {
        AuthSettings {
            access_secret: "access-secret-key-at-least-32-characters".to_string(),
            refresh_secret: "refresh-secret-key-at-least-32-characters".to_string(),
            issuer: "test".to_string(),
            access_token_expiry: 900,
            refresh_token_expiry: 604800,
            csrf_token_expiry: 900,
            bcrypt_cost: 4,
            store_timeout_ms: 2000,
            ledger_sweep_interval: 0,
        }
    }

    #[test]
    fn test_valid_settings_pass() {
        assert!(valid_settings().validate().is_ok());
    }

    #[test]
    fn test_identical_secrets_rejected() {
        let mut settings = valid_settings();
        settings.refresh_secret = settings.access_secret.clone();
        assert!(matches!(settings.validate(), Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_empty_secret_rejected() {
        let mut settings = valid_settings();
        settings.access_secret = String::new();
        assert!(matches!(settings.validate(), Err(ConfigError::MissingRequired(_))));
    }

    #[test]
    fn test_short_secret_rejected() {
        let mut settings = valid_settings();
        settings.refresh_secret = "short".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_non_positive_ttl_rejected() {
        let mut settings = valid_settings();
        settings.csrf_token_expiry = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_bcrypt_cost_bounds() {
        let mut settings = valid_settings();
        settings.bcrypt_cost = 3;
        assert!(settings.validate().is_err());
        settings.bcrypt_cost = 32;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_sweep_interval_zero_disables() {
        let mut settings = valid_settings();
        assert!(settings.sweep_interval().is_none());
        settings.ledger_sweep_interval = 60;
        assert_eq!(settings.sweep_interval(), Some(Duration::from_secs(60)));
    }
}
