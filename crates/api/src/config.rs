//! Server configuration loaded from the environment

use std::net::IpAddr;
use std::time::Duration;

use sessionward_shared::RateLimitConfig;
use thiserror::Error;

use crate::auth::login_attempts::LoginThrottleConfig;

const MIN_SECRET_LENGTH: usize = 16;
const MAX_ACTIVE_SESSIONS_LIMIT: usize = 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Tunables of the auth engine
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub access_secret: String,
    pub refresh_secret: String,
    pub access_token_ttl: Duration,
    pub refresh_token_ttl: Duration,
    pub max_active_sessions: usize,
    pub login_throttle: LoginThrottleConfig,
    pub login_sweep_interval: Duration,
    /// General per-IP limit on auth routes
    pub rate_limit: RateLimitConfig,
    /// Stricter per-IP limit on login
    pub login_rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub database_url: String,
    pub run_migrations: bool,
    pub allowed_origins: Vec<String>,
    /// Peers whose forwarding headers name the real client
    pub trusted_proxies: Vec<IpAddr>,
    /// Mark auth cookies `Secure`. Off only for plain-HTTP development.
    pub cookie_secure: bool,
    pub auth: AuthConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env { lookup: &lookup };

        let access_secret = env.required("JWT_ACCESS_SECRET")?;
        let refresh_secret = env.required("JWT_REFRESH_SECRET")?;
        check_secret("JWT_ACCESS_SECRET", &access_secret)?;
        check_secret("JWT_REFRESH_SECRET", &refresh_secret)?;
        if access_secret == refresh_secret {
            return Err(ConfigError::Invalid {
                key: "JWT_REFRESH_SECRET",
                reason: "must differ from JWT_ACCESS_SECRET".to_string(),
            });
        }

        let max_active_sessions: usize = env.parsed("AUTH_MAX_ACTIVE_SESSIONS", 5)?;
        if !(1..=MAX_ACTIVE_SESSIONS_LIMIT).contains(&max_active_sessions) {
            return Err(ConfigError::Invalid {
                key: "AUTH_MAX_ACTIVE_SESSIONS",
                reason: format!("must be between 1 and {MAX_ACTIVE_SESSIONS_LIMIT}"),
            });
        }

        let login_throttle = LoginThrottleConfig {
            delay_after_failures: env.parsed("AUTH_LOGIN_DELAY_AFTER_FAILURES", 3)?,
            base_delay: Duration::from_millis(env.parsed("AUTH_LOGIN_DELAY_MS", 250)?),
            lock_after_failures: env.parsed("AUTH_LOGIN_LOCK_AFTER_FAILURES", 7)?,
            lock_for: Duration::from_secs(env.parsed("AUTH_LOGIN_LOCK_FOR_SECONDS", 300)?),
            attempt_ttl: Duration::from_secs(env.parsed("AUTH_LOGIN_ATTEMPT_TTL_SECONDS", 1800)?),
        };

        let auth = AuthConfig {
            access_secret,
            refresh_secret,
            access_token_ttl: env.duration("ACCESS_TOKEN_TTL", "15m")?,
            refresh_token_ttl: env.duration("REFRESH_TOKEN_TTL", "7d")?,
            max_active_sessions,
            login_throttle,
            login_sweep_interval: Duration::from_secs(
                env.positive("AUTH_LOGIN_SWEEP_INTERVAL_SECONDS", 60)?.into(),
            ),
            rate_limit: RateLimitConfig {
                points: env.positive("AUTH_RATE_LIMIT_POINTS", 100)?,
                duration: Duration::from_secs(env.positive("AUTH_RATE_LIMIT_DURATION", 60)?.into()),
                block_duration: Duration::ZERO,
            },
            login_rate_limit: RateLimitConfig {
                points: env.positive("AUTH_LOGIN_LIMIT_POINTS", 10)?,
                duration: Duration::from_secs(env.positive("AUTH_LOGIN_LIMIT_DURATION", 60)?.into()),
                block_duration: Duration::from_secs(
                    env.parsed("AUTH_LOGIN_LIMIT_BLOCK_DURATION", 300)?,
                ),
            },
        };

        Ok(Self {
            bind_address: env.or("BIND_ADDRESS", "0.0.0.0:5000"),
            database_url: env.required("DATABASE_URL")?,
            run_migrations: env.parsed("RUN_MIGRATIONS", true)?,
            allowed_origins: env
                .or("ALLOWED_ORIGINS", "http://localhost:3000")
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(String::from)
                .collect(),
            trusted_proxies: env.ip_list("TRUSTED_PROXIES")?,
            cookie_secure: env.parsed("COOKIE_SECURE", true)?,
            auth,
        })
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.get(key).ok_or(ConfigError::Missing(key))
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn parsed<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                reason: e.to_string(),
            }),
        }
    }

    fn positive(&self, key: &'static str, default: u32) -> Result<u32, ConfigError> {
        let value: u32 = self.parsed(key, default)?;
        if value == 0 {
            return Err(ConfigError::Invalid {
                key,
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(value)
    }

    /// Comma-separated IP addresses, empty when unset
    fn ip_list(&self, key: &'static str) -> Result<Vec<IpAddr>, ConfigError> {
        self.or(key, "")
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                entry.parse::<IpAddr>().map_err(|_| ConfigError::Invalid {
                    key,
                    reason: format!("'{entry}' is not an IP address"),
                })
            })
            .collect()
    }

    fn duration(&self, key: &'static str, default: &str) -> Result<Duration, ConfigError> {
        let raw = self.or(key, default);
        parse_duration(&raw).map_err(|reason| ConfigError::Invalid { key, reason })
    }
}

fn check_secret(key: &'static str, secret: &str) -> Result<(), ConfigError> {
    if secret.len() < MIN_SECRET_LENGTH {
        return Err(ConfigError::Invalid {
            key,
            reason: format!("must be at least {MIN_SECRET_LENGTH} characters"),
        });
    }
    Ok(())
}

/// Parse `<n><unit>` with unit one of `ms`, `s`, `m`, `h`, `d`. A bare number
/// is seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);

    let value: u64 = digits
        .parse()
        .map_err(|_| format!("'{raw}' is not a duration"))?;
    let duration = match unit {
        "ms" => Duration::from_millis(value),
        "" | "s" => Duration::from_secs(value),
        "m" => Duration::from_secs(value.saturating_mul(60)),
        "h" => Duration::from_secs(value.saturating_mul(3600)),
        "d" => Duration::from_secs(value.saturating_mul(86_400)),
        other => return Err(format!("unknown duration unit '{other}'")),
    };

    if duration.is_zero() {
        return Err("duration must be greater than zero".to_string());
    }
    Ok(duration)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let mut vars: HashMap<String, String> = [
            ("DATABASE_URL", "postgres://localhost/sessionward"),
            ("JWT_ACCESS_SECRET", "access-secret-0123456789"),
            ("JWT_REFRESH_SECRET", "refresh-secret-0123456789"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        for (k, v) in pairs {
            vars.insert(k.to_string(), v.to_string());
        }
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();

        assert_eq!(config.bind_address, "0.0.0.0:5000");
        assert!(config.run_migrations);
        assert_eq!(config.auth.access_token_ttl, Duration::from_secs(900));
        assert_eq!(config.auth.refresh_token_ttl, Duration::from_secs(7 * 86_400));
        assert_eq!(config.auth.max_active_sessions, 5);
        assert_eq!(config.auth.login_throttle, LoginThrottleConfig::default());
        assert_eq!(config.auth.login_rate_limit.points, 10);
        assert_eq!(
            config.auth.login_rate_limit.block_duration,
            Duration::from_secs(300)
        );
        assert!(config.auth.rate_limit.block_duration.is_zero());
        assert_eq!(config.allowed_origins, vec!["http://localhost:3000"]);
        assert!(config.trusted_proxies.is_empty());
        assert!(config.cookie_secure);
    }

    #[test]
    fn test_trusted_proxies_parsed() {
        let config = Config::from_lookup(lookup(&[
            ("TRUSTED_PROXIES", "10.0.0.1, ::1"),
            ("COOKIE_SECURE", "false"),
        ]))
        .unwrap();
        let expected: Vec<IpAddr> = vec!["10.0.0.1".parse().unwrap(), "::1".parse().unwrap()];
        assert_eq!(config.trusted_proxies, expected);
        assert!(!config.cookie_secure);

        let err = Config::from_lookup(lookup(&[("TRUSTED_PROXIES", "10.0.0.0/8")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "TRUSTED_PROXIES", .. }));
    }

    #[test]
    fn test_missing_secret() {
        let err = Config::from_lookup(lookup(&[("JWT_ACCESS_SECRET", "")])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("JWT_ACCESS_SECRET"));
    }

    #[test]
    fn test_secrets_must_differ_and_be_long_enough() {
        let same = Config::from_lookup(lookup(&[
            ("JWT_ACCESS_SECRET", "same-secret-0123456789"),
            ("JWT_REFRESH_SECRET", "same-secret-0123456789"),
        ]));
        assert!(matches!(same, Err(ConfigError::Invalid { key: "JWT_REFRESH_SECRET", .. })));

        let short = Config::from_lookup(lookup(&[("JWT_ACCESS_SECRET", "short")]));
        assert!(matches!(short, Err(ConfigError::Invalid { key: "JWT_ACCESS_SECRET", .. })));
    }

    #[test]
    fn test_session_cap_bounds() {
        assert!(Config::from_lookup(lookup(&[("AUTH_MAX_ACTIVE_SESSIONS", "0")])).is_err());
        assert!(Config::from_lookup(lookup(&[("AUTH_MAX_ACTIVE_SESSIONS", "21")])).is_err());
        let config = Config::from_lookup(lookup(&[("AUTH_MAX_ACTIVE_SESSIONS", "20")])).unwrap();
        assert_eq!(config.auth.max_active_sessions, 20);
    }

    #[test]
    fn test_origins_are_split_and_trimmed() {
        let config = Config::from_lookup(lookup(&[(
            "ALLOWED_ORIGINS",
            "https://a.example, https://b.example,",
        )]))
        .unwrap();
        assert_eq!(
            config.allowed_origins,
            vec!["https://a.example", "https://b.example"]
        );
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("15m").unwrap(), Duration::from_secs(900));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(604_800));
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("m").is_err());
        assert!(parse_duration("5w").is_err());
    }
}
