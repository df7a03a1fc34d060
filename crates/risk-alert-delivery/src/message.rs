use risk_alert_core::{Alert, AlertConfig};
use serde_json::{json, Value};

/// Builds the `{"text": ...}` webhook payload for an alert.
#[must_use]
pub fn format_alert_message(alert: &Alert, config: &AlertConfig) -> Value {
    json!({ "text": alert_text(alert, config) })
}

#[must_use]
pub fn alert_text(alert: &Alert, config: &AlertConfig) -> String {
    let region = non_empty(alert.account_region.as_deref()).unwrap_or("Unknown");
    let owner = non_empty(alert.account_owner.as_deref()).unwrap_or("Unassigned");
    let arr = alert.arr.map_or_else(|| "Unknown".to_string(), format_arr);
    let renewal = alert
        .renewal_date
        .map_or_else(|| "Unknown".to_string(), |date| date.to_string());
    let plural = if alert.duration_months == 1 { "" } else { "s" };

    format!(
        "\u{1f6a9} *At Risk: {name} ({id})*\n\
         \u{2022} *Region:* {region}\n\
         \u{2022} *At Risk for:* {duration} month{plural} (since {start})\n\
         \u{2022} *ARR:* {arr}\n\
         \u{2022} *Renewal Date:* {renewal}\n\
         \u{2022} *Owner:* {owner}\n\
         \u{2022} *Details:* {details}",
        name = alert.account_name,
        id = alert.account_id,
        duration = alert.duration_months,
        start = alert.risk_start_month,
        details = config.details_url(&alert.account_id),
    )
}

/// Formats ARR as whole dollars with thousands separators, e.g. `$50,000`.
#[must_use]
pub fn format_arr(arr: i64) -> String {
    let digits = arr.unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (index, digit) in digits.chars().enumerate() {
        if index > 0 && (digits.len() - index) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }
    let sign = if arr < 0 { "-" } else { "" };
    format!("{sign}${grouped}")
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|value| !value.is_empty())
}
