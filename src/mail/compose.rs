use lettre::message::header::ContentType;
use lettre::message::Mailbox as Address;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use tracing::{info, instrument};

use super::MailError;
use crate::config::SmtpConfig;
use crate::model::Message;

fn address(raw: &str) -> Result<Address, MailError> {
    raw.trim()
        .parse::<Address>()
        .map_err(|e| MailError::Compose(format!("invalid address '{}': {}", raw, e)))
}

fn reply_subject(subject: &str) -> String {
    let trimmed = subject.trim();
    if trimmed
        .get(..3)
        .map_or(false, |prefix| prefix.eq_ignore_ascii_case("re:"))
    {
        trimmed.to_string()
    } else {
        format!("Re: {}", trimmed)
    }
}

/// Plain-text reply to `original`, threaded through In-Reply-To/References
/// when the original carried a Message-ID. The reply gets its own Message-ID
/// so the copy appended to the sent folder can be found again.
pub fn build_reply(from: &str, original: &Message, body: &str) -> Result<lettre::Message, MailError> {
    let mut builder = lettre::Message::builder()
        .from(address(from)?)
        .to(address(&original.sender)?)
        .subject(reply_subject(&original.subject))
        .message_id(None)
        .header(ContentType::TEXT_PLAIN);
    if let Some(id) = original.message_id.as_ref().filter(|id| !id.is_empty()) {
        builder = builder.in_reply_to(id.clone()).references(id.clone());
    }
    builder
        .body(body.to_string())
        .map_err(|e| MailError::Compose(e.to_string()))
}

pub fn build_notice(from: &str, to: &str, subject: &str, body: &str) -> Result<lettre::Message, MailError> {
    lettre::Message::builder()
        .from(address(from)?)
        .to(address(to)?)
        .subject(subject)
        .header(ContentType::TEXT_PLAIN)
        .body(body.to_string())
        .map_err(|e| MailError::Compose(e.to_string()))
}

#[instrument(skip_all, fields(host = %smtp.host, port = smtp.port))]
pub async fn send_via_relay(smtp: &SmtpConfig, message: lettre::Message) -> Result<(), MailError> {
    let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&smtp.host)
        .map_err(|e| MailError::Relay(e.to_string()))?
        .port(smtp.port)
        .credentials(Credentials::new(smtp.username.clone(), smtp.password.clone()))
        .build();
    transport
        .send(message)
        .await
        .map_err(|e| MailError::Relay(e.to_string()))?;
    info!("message relayed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn original(subject: &str, message_id: Option<&str>) -> Message {
        Message {
            id: 1,
            mailbox_id: 1,
            uid: 42,
            message_id: message_id.map(str::to_string),
            subject: subject.to_string(),
            sender: "Bob <bob@example.org>".to_string(),
            date: None,
            seen: false,
            flagged: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn reply_prefixes_subject_once() {
        assert_eq!(reply_subject("Lunch"), "Re: Lunch");
        assert_eq!(reply_subject("RE: Lunch"), "RE: Lunch");
        assert_eq!(reply_subject(""), "Re: ");
        assert_eq!(reply_subject("No€ updates"), "Re: No€ updates");
        assert_eq!(reply_subject("€"), "Re: €");
        assert_eq!(reply_subject("re:€"), "re:€");
    }

    #[test]
    fn reply_threads_on_message_id() {
        let msg = build_reply("me@example.org", &original("Lunch", Some("<abc@example.org>")), "sure")
            .unwrap();
        let raw = String::from_utf8(msg.formatted()).unwrap();
        assert!(raw.contains("Subject: Re: Lunch"));
        assert!(raw.contains("In-Reply-To: <abc@example.org>"));
        assert!(raw.contains("References: <abc@example.org>"));
        assert!(raw.contains("bob@example.org"));
        assert!(raw.contains("\r\n\r\nsure"));
        assert!(raw.contains("Message-ID: <"));
    }

    #[test]
    fn reply_to_non_ascii_subject() {
        let msg = build_reply("me@example.org", &original("No€ updates", None), "ok").unwrap();
        assert!(!msg.formatted().is_empty());
    }

    #[test]
    fn reply_rejects_bad_sender() {
        let mut orig = original("x", None);
        orig.sender = "not an address".into();
        let err = build_reply("me@example.org", &orig, "hi").unwrap_err();
        assert!(matches!(err, MailError::Compose(_)));
    }
}
