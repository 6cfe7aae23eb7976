use std::{sync::Arc, time::Duration};

use anyhow::anyhow;
use serde::Serialize;

use super::{core::AppConfig, metrics::record_side_effect_failure};

const MAIL_REQUEST_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Serialize)]
struct OutboundMail<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    text: String,
}

struct MailEndpoint {
    url: String,
    api_key: Option<String>,
}

/// Sends transactional mail through an HTTP mail API.
///
/// Without a configured endpoint, deliveries are only logged.
#[derive(Clone)]
pub(crate) struct Mailer {
    client: reqwest::Client,
    endpoint: Option<Arc<MailEndpoint>>,
    from: Arc<str>,
    log_verification_codes: bool,
}

impl Mailer {
    pub(crate) fn new(config: &AppConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(MAIL_REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| anyhow!("mail client init failed: {e}"))?;
        let endpoint = config
            .mail_api_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(|url| {
                Arc::new(MailEndpoint {
                    url: url.to_owned(),
                    api_key: config.mail_api_key.clone(),
                })
            });
        Ok(Self {
            client,
            endpoint,
            from: Arc::from(config.mail_from.as_str()),
            log_verification_codes: config.log_verification_codes,
        })
    }

    /// Queues delivery of a signup code. Never fails the caller.
    pub(crate) fn dispatch_verification_code(&self, email: &str, code: &str) {
        if self.log_verification_codes {
            tracing::info!(event = "mail.verification_code", email = %email, code = %code);
        }
        let Some(endpoint) = self.endpoint.clone() else {
            tracing::info!(event = "mail.verification_code", outcome = "not_configured");
            return;
        };
        let client = self.client.clone();
        let from = Arc::clone(&self.from);
        let email = email.to_owned();
        let text = verification_text(code);
        tokio::spawn(async move {
            let mail = OutboundMail {
                from: &from,
                to: [&email],
                subject: "Your TalentHub verification code",
                text,
            };
            if let Err(e) = send(&client, &endpoint, &mail).await {
                record_side_effect_failure("mailer", "verification_code");
                tracing::warn!(event = "mail.verification_code", outcome = "failed", error = %e);
            }
        });
    }
}

async fn send(
    client: &reqwest::Client,
    endpoint: &MailEndpoint,
    mail: &OutboundMail<'_>,
) -> anyhow::Result<()> {
    let mut request = client.post(&endpoint.url).json(mail);
    if let Some(api_key) = &endpoint.api_key {
        request = request.bearer_auth(api_key);
    }
    let response = request.send().await?;
    if !response.status().is_success() {
        return Err(anyhow!("mail api responded with {}", response.status()));
    }
    Ok(())
}

fn verification_text(code: &str) -> String {
    format!(
        "Your verification code is {code}. It expires in {} minutes.",
        super::core::VERIFICATION_CODE_TTL_SECS / 60
    )
}

#[cfg(test)]
mod tests {
    use super::{verification_text, Mailer};
    use crate::server::core::AppConfig;

    #[test]
    fn blank_endpoint_disables_delivery() {
        let mailer = Mailer::new(&AppConfig {
            mail_api_url: Some(String::from("  ")),
            ..AppConfig::default()
        })
        .expect("mailer should initialize");
        assert!(mailer.endpoint.is_none());
        mailer.dispatch_verification_code("a@example.com", "123456");
    }

    #[test]
    fn verification_text_names_code_and_expiry() {
        assert_eq!(
            verification_text("042913"),
            "Your verification code is 042913. It expires in 5 minutes."
        );
    }
}
