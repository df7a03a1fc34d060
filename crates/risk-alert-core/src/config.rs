use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{AlertError, DEFAULT_LOOKBACK_MONTHS};

/// Retry schedule for webhook delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct RetryPolicy {
    /// Additional attempts after the first one.
    pub max_retries: u32,
    pub initial_delay_secs: f64,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_secs: 1.0,
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Exponential delay for a 0-based attempt index.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let seconds = self.initial_delay_secs * self.backoff_factor.powi(exponent);
        Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
    }

    /// Validates retry bounds.
    ///
    /// # Errors
    /// Returns [`AlertError::Configuration`] for negative or non-finite
    /// delays and backoff factors below 1.0.
    pub fn validate(&self) -> Result<(), AlertError> {
        if !self.initial_delay_secs.is_finite() || self.initial_delay_secs < 0.0 {
            return Err(AlertError::Configuration(
                "retry.initial_delay_secs MUST be a finite value >= 0".to_string(),
            ));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(AlertError::Configuration(
                "retry.backoff_factor MUST be a finite value >= 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Explicit configuration handed to the engine and the delivery pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct AlertConfig {
    pub arr_threshold: i64,
    pub lookback_months: u32,
    pub region_channels: BTreeMap<String, String>,
    pub details_base_url: String,
    pub webhook_base_url: Option<String>,
    pub webhook_url: Option<String>,
    pub support_contact: String,
    pub retry: RetryPolicy,
    pub request_timeout_ms: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        let region_channels = [
            ("AMER", "amer-risk-alerts"),
            ("EMEA", "emea-risk-alerts"),
            ("APAC", "apac-risk-alerts"),
        ]
        .into_iter()
        .map(|(region, channel)| (region.to_string(), channel.to_string()))
        .collect();

        Self {
            arr_threshold: 10_000,
            lookback_months: DEFAULT_LOOKBACK_MONTHS,
            region_channels,
            details_base_url: "https://app.yourcompany.com/accounts".to_string(),
            webhook_base_url: None,
            webhook_url: None,
            support_contact: "support@yourcompany.com".to_string(),
            retry: RetryPolicy::default(),
            request_timeout_ms: 10_000,
        }
    }
}

impl AlertConfig {
    /// Validates the full configuration.
    ///
    /// # Errors
    /// Returns [`AlertError::Configuration`] naming the first invalid field.
    pub fn validate(&self) -> Result<(), AlertError> {
        if self.lookback_months == 0 {
            return Err(AlertError::Configuration(
                "lookback_months MUST be >= 1".to_string(),
            ));
        }

        if self.request_timeout_ms == 0 {
            return Err(AlertError::Configuration(
                "request_timeout_ms MUST be >= 1".to_string(),
            ));
        }

        for (region, channel) in &self.region_channels {
            if region.trim().is_empty() {
                return Err(AlertError::Configuration(
                    "region_channels keys cannot be empty".to_string(),
                ));
            }
            if channel.trim().is_empty() {
                return Err(AlertError::Configuration(format!(
                    "region_channels[{region}] cannot be empty"
                )));
            }
        }

        if self.details_base_url.trim().is_empty() {
            return Err(AlertError::Configuration(
                "details_base_url MUST be provided".to_string(),
            ));
        }

        self.retry.validate()
    }

    /// Decodes and validates a configuration from JSON. Missing fields take
    /// their defaults.
    ///
    /// # Errors
    /// Returns [`AlertError::Configuration`] when decoding fails or the
    /// decoded values violate constraints.
    pub fn from_json(value: &Value) -> Result<Self, AlertError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            AlertError::Configuration(format!("invalid configuration JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Channel for a region; `None` for a missing or unmapped region.
    #[must_use]
    pub fn channel_for_region(&self, region: Option<&str>) -> Option<&str> {
        let region = region.filter(|value| !value.is_empty())?;
        self.region_channels.get(region).map(String::as_str)
    }

    #[must_use]
    pub fn details_url(&self, account_id: &str) -> String {
        format!(
            "{}/{account_id}",
            self.details_base_url.trim_end_matches('/')
        )
    }

    /// Webhook URL for a channel: the base URL joined with the channel when
    /// configured, otherwise the single webhook URL.
    #[must_use]
    pub fn webhook_url_for_channel(&self, channel: &str) -> Option<String> {
        if let Some(base) = self.webhook_base_url.as_deref().filter(|v| !v.is_empty()) {
            return Some(format!("{}/{channel}", base.trim_end_matches('/')));
        }
        self.webhook_url.clone().filter(|value| !value.is_empty())
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_validate() {
        assert!(AlertConfig::default().validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = match AlertConfig::from_json(&json!({
            "arr_threshold": 25000,
            "retry": {"max_retries": 5}
        })) {
            Ok(value) => value,
            Err(err) => panic!("expected valid config: {err}"),
        };

        assert_eq!(config.arr_threshold, 25_000);
        assert_eq!(config.retry.max_retries, 5);
        assert!((config.retry.backoff_factor - 2.0).abs() < f64::EPSILON);
        assert_eq!(
            config.channel_for_region(Some("AMER")),
            Some("amer-risk-alerts")
        );
    }

    #[test]
    fn unknown_fields_and_bad_bounds_are_rejected() {
        assert!(AlertConfig::from_json(&json!({"arr_treshold": 1})).is_err());
        assert!(AlertConfig::from_json(&json!({"retry": {"backoff_factor": 0.5}})).is_err());
        assert!(AlertConfig::from_json(&json!({"lookback_months": 0})).is_err());
        assert!(AlertConfig::from_json(&json!({"region_channels": {"AMER": " "}})).is_err());
    }

    #[test]
    fn region_lookup_treats_missing_and_unmapped_alike() {
        let config = AlertConfig::default();
        assert_eq!(config.channel_for_region(None), None);
        assert_eq!(config.channel_for_region(Some("")), None);
        assert_eq!(config.channel_for_region(Some("LATAM")), None);
        assert_eq!(config.channel_for_region(Some("amer")), None);
    }

    #[test]
    fn webhook_base_url_takes_precedence_over_single_url() {
        let mut config = AlertConfig {
            webhook_url: Some("https://hooks.example.com/single".to_string()),
            ..AlertConfig::default()
        };
        assert_eq!(
            config.webhook_url_for_channel("amer-risk-alerts").as_deref(),
            Some("https://hooks.example.com/single")
        );

        config.webhook_base_url = Some("http://localhost:8080/hooks/".to_string());
        assert_eq!(
            config.webhook_url_for_channel("amer-risk-alerts").as_deref(),
            Some("http://localhost:8080/hooks/amer-risk-alerts")
        );
    }

    #[test]
    fn exponential_delays_follow_attempt_index() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
    }

    #[test]
    fn details_url_joins_account_id() {
        let config = AlertConfig {
            details_base_url: "https://crm.example.com/accounts/".to_string(),
            ..AlertConfig::default()
        };
        assert_eq!(
            config.details_url("ACC-7"),
            "https://crm.example.com/accounts/ACC-7"
        );
    }
}
