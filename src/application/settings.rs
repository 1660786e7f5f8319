use crate::domain::ports::ConfigRef;
use crate::error::Result;
use rust_decimal::Decimal;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

pub const MAX_RETRIES: &str = "max_retries";
pub const RETRY_DELAY_SECONDS: &str = "retry_delay_seconds";
pub const RETRY_DELAY_MAX_SECONDS: &str = "retry_delay_max_seconds";
pub const FRAUD_MANUAL_REVIEW_THRESHOLD: &str = "fraud_manual_review_threshold";
pub const FRAUD_DENY_THRESHOLD: &str = "fraud_deny_threshold";
pub const SESSION_TTL_SECONDS: &str = "session_ttl_seconds";
pub const CANDIDATE_POOL_SIZE: &str = "candidate_pool_size";

/// Typed view over a `ConfigProvider`.
///
/// Operational knobs fall back to their defaults when the provider fails or
/// holds an unparsable value; fraud thresholds surface provider errors so the
/// fraud gate can decide what to do with them.
#[derive(Clone)]
pub struct Settings {
    provider: ConfigRef,
}

/// Amount thresholds for the fraud gate. Unset means disabled.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FraudThresholds {
    pub manual_review: Option<Decimal>,
    pub deny: Option<Decimal>,
}

impl Settings {
    pub fn new(provider: ConfigRef) -> Self {
        Self { provider }
    }

    async fn get_or<T>(&self, key: &str, default: T) -> T
    where
        T: FromStr + Display + Copy,
    {
        match self.provider.get(key).await {
            Ok(Some(raw)) => raw.trim().parse().unwrap_or_else(|_| {
                warn!(key, value = %raw, %default, "Unparsable setting, using default");
                default
            }),
            Ok(None) => default,
            Err(e) => {
                warn!(key, error = %e, %default, "Config lookup failed, using default");
                default
            }
        }
    }

    pub async fn max_retries(&self) -> u32 {
        self.get_or(MAX_RETRIES, 3).await
    }

    pub async fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.get_or(RETRY_DELAY_SECONDS, 60).await)
    }

    pub async fn retry_delay_max(&self) -> Duration {
        Duration::from_secs(self.get_or(RETRY_DELAY_MAX_SECONDS, 600).await)
    }

    pub async fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.get_or(SESSION_TTL_SECONDS, 900i64).await)
    }

    pub async fn candidate_pool_size(&self) -> usize {
        self.get_or(CANDIDATE_POOL_SIZE, 5usize).await.max(1)
    }

    pub async fn fraud_thresholds(&self) -> Result<FraudThresholds> {
        Ok(FraudThresholds {
            manual_review: self.threshold(FRAUD_MANUAL_REVIEW_THRESHOLD).await?,
            deny: self.threshold(FRAUD_DENY_THRESHOLD).await?,
        })
    }

    async fn threshold(&self, key: &str) -> Result<Option<Decimal>> {
        let Some(raw) = self.provider.get(key).await? else {
            return Ok(None);
        };
        match raw.trim().parse::<Decimal>() {
            Ok(value) => Ok(Some(value)),
            Err(_) => {
                warn!(key, value = %raw, "Unparsable fraud threshold, treating as unset");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::support::StaticConfig;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_defaults_when_unset() {
        let settings = Settings::new(Arc::new(StaticConfig::default()));
        assert_eq!(settings.max_retries().await, 3);
        assert_eq!(settings.retry_delay().await, Duration::from_secs(60));
        assert_eq!(settings.candidate_pool_size().await, 5);
        assert_eq!(
            settings.fraud_thresholds().await.unwrap(),
            FraudThresholds::default()
        );
    }

    #[tokio::test]
    async fn test_values_are_parsed() {
        let config = StaticConfig::default()
            .with(MAX_RETRIES, "5")
            .with(FRAUD_DENY_THRESHOLD, "100000")
            .with(RETRY_DELAY_SECONDS, "not-a-number");
        let settings = Settings::new(Arc::new(config));
        assert_eq!(settings.max_retries().await, 5);
        assert_eq!(settings.retry_delay().await, Duration::from_secs(60));
        assert_eq!(
            settings.fraud_thresholds().await.unwrap().deny,
            Some(dec!(100000))
        );
    }

    #[tokio::test]
    async fn test_unavailable_provider() {
        let settings = Settings::new(Arc::new(StaticConfig::unavailable()));
        assert_eq!(settings.max_retries().await, 3);
        assert!(settings.fraud_thresholds().await.is_err());
    }
}
