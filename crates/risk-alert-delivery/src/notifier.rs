use risk_alert_core::{Alert, RunId};
use time::Date;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownRegionAccount {
    pub account_id: String,
    pub account_name: String,
    pub account_region: Option<String>,
}

impl From<&Alert> for UnknownRegionAccount {
    fn from(alert: &Alert) -> Self {
        Self {
            account_id: alert.account_id.clone(),
            account_name: alert.account_name.clone(),
            account_region: alert.account_region.clone(),
        }
    }
}

/// Aggregated notice for alerts that could not be routed to a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownRegionNotice {
    pub run_id: RunId,
    pub month: Date,
    pub accounts: Vec<UnknownRegionAccount>,
}

impl UnknownRegionNotice {
    #[must_use]
    pub fn render(&self, support_contact: &str) -> String {
        let mut body = format!(
            "To: {support_contact}\n\
             Subject: Risk Alert - Unknown Regions Detected\n\n\
             Run ID: {}\n\
             Month: {}\n\n\
             The following {} accounts have unknown or null regions and could not be routed:\n\n",
            self.run_id,
            self.month,
            self.accounts.len()
        );
        for account in &self.accounts {
            let region = account.account_region.as_deref().unwrap_or("None");
            body.push_str(&format!(
                "  - {} ({}): region='{region}'\n",
                account.account_id, account.account_name
            ));
        }
        body.push_str("\nPlease update the account regions or the region channel mapping.\n");
        body
    }
}

/// Out-of-band operator channel for unroutable alerts.
pub trait OperatorNotifier {
    fn notify_unknown_regions(&self, notice: &UnknownRegionNotice);
}

/// Emits the notice through `tracing` at warn level.
#[derive(Debug, Clone)]
pub struct LogNotifier {
    support_contact: String,
}

impl LogNotifier {
    #[must_use]
    pub fn new(support_contact: &str) -> Self {
        Self {
            support_contact: support_contact.to_string(),
        }
    }
}

impl OperatorNotifier for LogNotifier {
    fn notify_unknown_regions(&self, notice: &UnknownRegionNotice) {
        tracing::warn!(
            run_id = %notice.run_id,
            month = %notice.month,
            accounts = notice.accounts.len(),
            support_contact = %self.support_contact,
            "unknown region notice:\n{}",
            notice.render(&self.support_contact)
        );
    }
}
