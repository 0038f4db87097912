//! The Notification Dispatcher: per-`listId` recipient lists, severity/method
//! filtering, and the LOG/MAIL/SMS delivery backends. Recipient maps are built
//! once at startup from the config's `notificationList` and never mutated
//! afterwards, so lookups need no lock.

use crate::config::{Config, MailConfig, Method, NotificationListEntry, Severity, SmsConfig};
use crate::error::WatchError;
use chrono::Local;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

const NOTIFICATION_SUBJECT: &str = "Notification Event";

#[derive(Debug, Clone)]
pub struct Recipient {
    pub method: Method,
    pub address: String,
    pub min_severity: Severity,
}

/// Either filter recipients by severity, or by an explicit set of methods,
/// or send to everyone on the list.
pub enum SendFilter {
    Severity(Severity),
    Methods(HashSet<Method>),
    All,
}

pub struct NotificationDispatcher {
    recipients: HashMap<String, Vec<Recipient>>,
    mail: MailConfig,
    sms: Option<SmsConfig>,
    mailer: Option<AsyncSmtpTransport<Tokio1Executor>>,
    http: reqwest::Client,
}

impl NotificationDispatcher {
    pub fn new(config: &Config) -> Self {
        let mut dispatcher = Self {
            recipients: HashMap::new(),
            mail: config.message_service.mail.clone(),
            sms: config.message_service.sms.clone(),
            mailer: build_mailer(&config.message_service.mail),
            http: reqwest::Client::new(),
        };

        if let Some(entries) = &config.notification_list {
            for entry in entries {
                dispatcher.load_entry(entry);
            }
        }

        match &dispatcher.sms {
            Some(sms) if sms.enabled && sms.sid.is_some() && sms.token.is_some() => {
                info!("SMS delivery configured and enabled");
            }
            _ => info!("{}", WatchError::SmsUnavailable("missing credentials or disabled".to_string())),
        }

        dispatcher
    }

    fn load_entry(&mut self, entry: &NotificationListEntry) {
        for recipient in &entry.recipients {
            if !recipient.enabled {
                continue;
            }
            self.add_recipient(
                recipient.method,
                &entry.id,
                &recipient.recipient,
                recipient.min_severity,
            );
        }
    }

    pub fn add_recipient(
        &mut self,
        method: Method,
        list_id: &str,
        address: &str,
        min_severity: Severity,
    ) {
        self.recipients
            .entry(list_id.to_string())
            .or_default()
            .push(Recipient {
                method,
                address: address.to_string(),
                min_severity,
            });
    }

    /// Dispatch `message` to `listId`'s recipients, filtered per `filter`.
    /// Every delivery is offloaded to its own task so a slow or failing send
    /// never stalls the watcher that triggered it.
    pub fn send_notifications(self: &std::sync::Arc<Self>, list_id: &str, message: &str, filter: SendFilter) {
        let Some(recipients) = self.recipients.get(list_id) else {
            return;
        };

        for recipient in recipients {
            let deliver = match &filter {
                SendFilter::Severity(message_severity) => {
                    message_severity.rank() >= recipient.min_severity.rank()
                }
                SendFilter::Methods(methods) => methods.contains(&recipient.method),
                SendFilter::All => true,
            };
            if !deliver {
                continue;
            }

            let dispatcher = self.clone();
            let method = recipient.method;
            let address = recipient.address.clone();
            let message = message.to_string();
            tokio::spawn(async move {
                dispatcher.send_notification(method, &message, &address).await;
            });
        }
    }

    /// Send one message through one method. Never propagates a failure: it
    /// is logged and the caller moves on.
    pub async fn send_notification(&self, method: Method, message: &str, address: &str) {
        let timestamped = format!("{} {message}", Local::now().format("%Y-%m-%d %H:%M:%S"));

        match method {
            Method::Log => info!(target: "notify", "{timestamped}"),
            Method::Mail => self.send_mail(address, &timestamped).await,
            Method::Sms => self.send_sms(address, &timestamped).await,
        }
    }

    async fn send_mail(&self, to: &str, body: &str) {
        let Some(mailer) = &self.mailer else {
            warn!(to, "mail delivery unavailable: transport not built");
            return;
        };

        let from: Mailbox = match self.mail.from.parse() {
            Ok(mailbox) => mailbox,
            Err(err) => {
                warn!(%err, from = %self.mail.from, "invalid 'from' address");
                return;
            }
        };
        let to_mailbox: Mailbox = match to.parse() {
            Ok(mailbox) => mailbox,
            Err(err) => {
                warn!(%err, to, "invalid mail recipient address");
                return;
            }
        };

        let email = match Message::builder()
            .from(from)
            .to(to_mailbox)
            .subject(NOTIFICATION_SUBJECT)
            .body(body.to_string())
        {
            Ok(email) => email,
            Err(err) => {
                warn!(%err, "failed to build mail message");
                return;
            }
        };

        if let Err(err) = mailer.send(email).await {
            warn!(%err, to, "mail delivery failed");
        }
    }

    async fn send_sms(&self, to: &str, body: &str) {
        let Some(sms) = &self.sms else {
            warn!(to, "{}", WatchError::SmsUnavailable("not configured".to_string()));
            return;
        };
        if !sms.enabled {
            warn!(to, "{}", WatchError::SmsUnavailable("disabled".to_string()));
            return;
        }
        let (Some(sid), Some(token)) = (&sms.sid, &sms.token) else {
            warn!(to, "{}", WatchError::SmsUnavailable("missing credentials".to_string()));
            return;
        };
        let Some(service) = &sms.service else {
            warn!(to, "{}", WatchError::SmsUnavailable("missing messaging service sid".to_string()));
            return;
        };

        let url = format!("https://api.twilio.com/2010-04-01/Accounts/{sid}/Messages.json");
        let form = [
            ("Body", body),
            ("MessagingServiceSid", service.as_str()),
            ("To", to),
        ];

        let result = self
            .http
            .post(&url)
            .basic_auth(sid, Some(token))
            .form(&form)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => warn!(to, status = %response.status(), "sms gateway returned an error"),
            Err(err) => warn!(%err, to, "sms delivery failed"),
        }
    }
}

fn build_mailer(mail: &MailConfig) -> Option<AsyncSmtpTransport<Tokio1Executor>> {
    let mut builder = if mail.require_tls {
        match AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&mail.host) {
            Ok(builder) => builder,
            Err(err) => {
                warn!(%err, host = %mail.host, "failed to build TLS mail transport");
                return None;
            }
        }
    } else {
        AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&mail.host)
    };

    builder = builder.port(mail.port);

    if let Some(auth) = &mail.auth {
        builder = builder.credentials(Credentials::new(auth.user.clone(), auth.pass.clone()));
    }

    Some(builder.build())
}

// ===========================================================================
// Tests
// ===========================================================================
