use std::time::Duration;

use risk_alert_core::{Alert, AlertConfig};

use crate::message::format_alert_message;
use crate::transport::{Sleeper, WebhookTransport};

pub const NO_WEBHOOK_CONFIGURED: &str = "no webhook configured";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendResult {
    pub success: bool,
    pub error: Option<String>,
}

impl SendResult {
    #[must_use]
    pub fn sent() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

#[must_use]
pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || status >= 500
}

/// Posts alert messages to a channel webhook with retry and backoff.
pub struct ChannelSender<'a> {
    config: &'a AlertConfig,
    transport: &'a dyn WebhookTransport,
    sleeper: &'a dyn Sleeper,
}

impl<'a> ChannelSender<'a> {
    #[must_use]
    pub fn new(
        config: &'a AlertConfig,
        transport: &'a dyn WebhookTransport,
        sleeper: &'a dyn Sleeper,
    ) -> Self {
        Self {
            config,
            transport,
            sleeper,
        }
    }

    /// Sends one alert. Only HTTP 200 counts as delivered.
    #[must_use]
    pub fn send(&self, alert: &Alert, channel: &str) -> SendResult {
        let Some(url) = self.config.webhook_url_for_channel(channel) else {
            tracing::error!(account_id = %alert.account_id, channel, "no webhook configured");
            return SendResult::failed(NO_WEBHOOK_CONFIGURED);
        };

        let payload = format_alert_message(alert, self.config);
        let policy = &self.config.retry;
        let mut attempt = 0_u32;

        loop {
            let is_last = attempt >= policy.max_retries;
            let delay = match self.transport.post_json(&url, &payload) {
                Ok(response) if response.status == 200 => {
                    tracing::info!(account_id = %alert.account_id, channel, "alert delivered");
                    return SendResult::sent();
                }
                Ok(response) if is_retryable_status(response.status) => {
                    if is_last {
                        let error = format!("max retries exceeded, last status: {}", response.status);
                        tracing::error!(account_id = %alert.account_id, channel, "{error}");
                        return SendResult::failed(error);
                    }
                    let delay = response
                        .retry_after
                        .and_then(|seconds| Duration::try_from_secs_f64(seconds).ok())
                        .unwrap_or_else(|| policy.delay_for_attempt(attempt));
                    tracing::warn!(
                        account_id = %alert.account_id,
                        channel,
                        status = response.status,
                        attempt = attempt + 1,
                        max_retries = policy.max_retries,
                        delay_secs = delay.as_secs_f64(),
                        "webhook returned retryable status, retrying"
                    );
                    delay
                }
                Ok(response) => {
                    let error = format!("webhook returned {}: {}", response.status, response.body);
                    tracing::error!(account_id = %alert.account_id, channel, "{error}");
                    return SendResult::failed(error);
                }
                Err(err) => {
                    let error = format!("request failed: {err}");
                    if is_last {
                        tracing::error!(account_id = %alert.account_id, channel, "{error}, max retries exceeded");
                        return SendResult::failed(error);
                    }
                    let delay = policy.delay_for_attempt(attempt);
                    tracing::warn!(
                        account_id = %alert.account_id,
                        channel,
                        attempt = attempt + 1,
                        delay_secs = delay.as_secs_f64(),
                        "{error}, retrying"
                    );
                    delay
                }
            };

            self.sleeper.sleep(delay);
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{TransportError, TransportResponse};
    use risk_alert_core::{RetryPolicy, AT_RISK_STATUS};
    use serde_json::Value;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use time::macros::date;

    #[derive(Default)]
    struct ScriptedTransport {
        responses: RefCell<VecDeque<Result<TransportResponse, TransportError>>>,
        calls: RefCell<Vec<(String, Value)>>,
    }

    impl ScriptedTransport {
        fn with(responses: Vec<Result<TransportResponse, TransportError>>) -> Self {
            Self {
                responses: RefCell::new(responses.into()),
                calls: RefCell::new(Vec::new()),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.borrow().len()
        }
    }

    impl WebhookTransport for ScriptedTransport {
        fn post_json(&self, url: &str, body: &Value) -> Result<TransportResponse, TransportError> {
            self.calls.borrow_mut().push((url.to_string(), body.clone()));
            self.responses
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| Ok(TransportResponse::new(200)))
        }
    }

    #[derive(Default)]
    struct RecordingSleeper {
        delays: RefCell<Vec<Duration>>,
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, duration: Duration) {
            self.delays.borrow_mut().push(duration);
        }
    }

    fn fixture_config() -> AlertConfig {
        AlertConfig {
            webhook_base_url: Some("http://hooks.test".to_string()),
            ..AlertConfig::default()
        }
    }

    fn fixture_alert() -> Alert {
        Alert {
            account_id: "A-1".to_string(),
            account_name: "Acme".to_string(),
            account_region: Some("AMER".to_string()),
            month: date!(2024 - 03 - 01),
            status: AT_RISK_STATUS.to_string(),
            duration_months: 2,
            risk_start_month: date!(2024 - 02 - 01),
            renewal_date: None,
            account_owner: None,
            arr: Some(50_000),
        }
    }

    fn status_with_retry_after(status: u16, seconds: f64) -> Result<TransportResponse, TransportError> {
        Ok(TransportResponse {
            status,
            retry_after: Some(seconds),
            body: String::new(),
        })
    }

    #[test]
    fn retry_after_takes_precedence_over_backoff() {
        let config = fixture_config();
        let transport = ScriptedTransport::with(vec![
            status_with_retry_after(429, 3.0),
            Ok(TransportResponse::new(200)),
        ]);
        let sleeper = RecordingSleeper::default();

        let result = ChannelSender::new(&config, &transport, &sleeper).send(&fixture_alert(), "amer-risk-alerts");

        assert_eq!(result, SendResult::sent());
        assert_eq!(transport.call_count(), 2);
        assert_eq!(*sleeper.delays.borrow(), vec![Duration::from_secs(3)]);
        assert_eq!(transport.calls.borrow()[0].0, "http://hooks.test/amer-risk-alerts");
    }

    #[test]
    fn server_errors_back_off_exponentially_without_final_sleep() {
        let config = fixture_config();
        let transport = ScriptedTransport::with(vec![
            Ok(TransportResponse::new(500)),
            Ok(TransportResponse::new(502)),
            Ok(TransportResponse::new(503)),
            Ok(TransportResponse::new(503)),
        ]);
        let sleeper = RecordingSleeper::default();

        let result = ChannelSender::new(&config, &transport, &sleeper).send(&fixture_alert(), "amer-risk-alerts");

        assert_eq!(
            result,
            SendResult::failed("max retries exceeded, last status: 503")
        );
        assert_eq!(transport.call_count(), 4);
        assert_eq!(
            *sleeper.delays.borrow(),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
    }

    #[test]
    fn client_errors_fail_immediately_with_body() {
        let config = fixture_config();
        let transport = ScriptedTransport::with(vec![Ok(TransportResponse {
            status: 404,
            retry_after: None,
            body: "channel_not_found".to_string(),
        })]);
        let sleeper = RecordingSleeper::default();

        let result = ChannelSender::new(&config, &transport, &sleeper).send(&fixture_alert(), "amer-risk-alerts");

        assert_eq!(result, SendResult::failed("webhook returned 404: channel_not_found"));
        assert_eq!(transport.call_count(), 1);
        assert!(sleeper.delays.borrow().is_empty());
    }

    #[test]
    fn transport_errors_retry_then_report_last_error() {
        let config = AlertConfig {
            retry: RetryPolicy {
                max_retries: 1,
                initial_delay_secs: 0.5,
                backoff_factor: 2.0,
            },
            ..fixture_config()
        };
        let transport = ScriptedTransport::with(vec![
            Err(TransportError("connection refused".to_string())),
            Err(TransportError("connection reset".to_string())),
        ]);
        let sleeper = RecordingSleeper::default();

        let result = ChannelSender::new(&config, &transport, &sleeper).send(&fixture_alert(), "amer-risk-alerts");

        assert_eq!(result, SendResult::failed("request failed: connection reset"));
        assert_eq!(*sleeper.delays.borrow(), vec![Duration::from_millis(500)]);
    }

    #[test]
    fn missing_webhook_fails_without_calling_transport() {
        let config = AlertConfig::default();
        let transport = ScriptedTransport::default();
        let sleeper = RecordingSleeper::default();

        let result = ChannelSender::new(&config, &transport, &sleeper).send(&fixture_alert(), "amer-risk-alerts");

        assert_eq!(result, SendResult::failed(NO_WEBHOOK_CONFIGURED));
        assert_eq!(transport.call_count(), 0);
    }

    #[test]
    fn single_webhook_url_ignores_channel() {
        let config = AlertConfig {
            webhook_url: Some("https://hooks.example.com/T000/B000".to_string()),
            ..AlertConfig::default()
        };
        let transport = ScriptedTransport::default();
        let sleeper = RecordingSleeper::default();

        let result = ChannelSender::new(&config, &transport, &sleeper).send(&fixture_alert(), "emea-risk-alerts");

        assert!(result.success);
        assert_eq!(transport.calls.borrow()[0].0, "https://hooks.example.com/T000/B000");
        assert!(transport.calls.borrow()[0].1["text"]
            .as_str()
            .is_some_and(|text| text.contains("Acme (A-1)")));
    }

    #[test]
    fn non_200_success_codes_are_not_delivery() {
        let config = fixture_config();
        let transport = ScriptedTransport::with(vec![Ok(TransportResponse::new(204))]);
        let sleeper = RecordingSleeper::default();

        let result = ChannelSender::new(&config, &transport, &sleeper).send(&fixture_alert(), "amer-risk-alerts");
        assert_eq!(result, SendResult::failed("webhook returned 204: "));
    }
}
