use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Production => "production",
        }
    }

    /// Read `ENVIRONMENT`; anything other than production is development.
    pub fn from_env() -> Self {
        env_string("ENVIRONMENT", "development")
            .parse()
            .unwrap_or(Environment::Development)
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "production" | "prod" => Ok(Environment::Production),
            "development" | "dev" => Ok(Environment::Development),
            other => Err(format!("unknown environment '{other}'")),
        }
    }
}

/// `key` from the environment, or `default` when unset.
pub fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// `key` parsed as `T`. Unset or unparsable values fall back to `default`;
/// the latter is logged since it usually means a typo in a deployment.
pub fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "Ignoring unparsable environment value");
            default
        }),
        Err(_) => default,
    }
}

pub fn env_millis(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_parse(key, default_ms))
}

/// Unset or empty means `None`.
pub fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_environment_from_env() {
        unsafe { env::set_var("ENVIRONMENT", "PROD") };
        assert_eq!(Environment::from_env(), Environment::Production);

        unsafe { env::set_var("ENVIRONMENT", "staging") };
        assert_eq!(Environment::from_env(), Environment::Development);

        unsafe { env::remove_var("ENVIRONMENT") };
        assert_eq!(Environment::from_env(), Environment::Development);
    }

    #[test]
    #[serial]
    fn test_env_parse_falls_back() {
        unsafe { env::set_var("COMMON_TEST_INTERVAL", "250") };
        assert_eq!(env_millis("COMMON_TEST_INTERVAL", 10), Duration::from_millis(250));

        unsafe { env::set_var("COMMON_TEST_INTERVAL", "soon") };
        assert_eq!(env_parse("COMMON_TEST_INTERVAL", 10u64), 10);

        unsafe { env::remove_var("COMMON_TEST_INTERVAL") };
        assert_eq!(env_parse("COMMON_TEST_INTERVAL", 7u32), 7);
    }

    #[test]
    #[serial]
    fn test_env_optional_treats_empty_as_unset() {
        unsafe { env::set_var("COMMON_TEST_ENDPOINT", "") };
        assert_eq!(env_optional("COMMON_TEST_ENDPOINT"), None);

        unsafe { env::set_var("COMMON_TEST_ENDPOINT", "http://collector:4317") };
        assert_eq!(
            env_optional("COMMON_TEST_ENDPOINT").as_deref(),
            Some("http://collector:4317")
        );
        unsafe { env::remove_var("COMMON_TEST_ENDPOINT") };
    }
}
