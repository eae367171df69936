//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (jobs reference configured messengers)
//! - Validate value ranges (deadlines > 0, addresses parse)
//! - Reject duplicate or reserved messenger names
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: AppConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use url::Url;

use crate::config::schema::{AppConfig, SmtpAuth, SmtpTls};
use crate::messenger::EMAIL_MESSENGER;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Validate a parsed configuration, collecting every error.
pub fn validate_config(config: &AppConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.app.address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "app.address",
            format!("`{}` is not a socket address", config.app.address),
        ));
    }
    if config.app.check_updates {
        if Url::parse(&config.app.update_url).is_err() {
            errors.push(ValidationError::new("app.update_url", "not a valid URL"));
        }
        if config.app.update_interval_secs == 0 {
            errors.push(ValidationError::new("app.update_interval_secs", "must be > 0"));
        }
    }
    for (i, email) in config.app.notify_emails.iter().enumerate() {
        if !email.contains('@') {
            errors.push(ValidationError::new(
                format!("app.notify_emails[{}]", i),
                format!("`{}` is not an email address", email),
            ));
        }
    }

    if config.db.path.trim().is_empty() {
        errors.push(ValidationError::new("db.path", "must not be empty"));
    }
    if config.db.max_open == 0 {
        errors.push(ValidationError::new("db.max_open", "must be >= 1"));
    }

    let smtp = &config.smtp;
    if smtp.enabled {
        if smtp.host.trim().is_empty() {
            errors.push(ValidationError::new("smtp.host", "must not be empty"));
        }
        if smtp.port == 0 {
            errors.push(ValidationError::new("smtp.port", "must not be 0"));
        }
        if !smtp.from.contains('@') || smtp.from.contains(['\r', '\n']) {
            errors.push(ValidationError::new("smtp.from", "must be an email address"));
        }
        if smtp.hello_hostname.contains(['\r', '\n', ' ']) {
            errors.push(ValidationError::new("smtp.hello_hostname", "must be a single host name"));
        }
        if smtp.auth != SmtpAuth::None && smtp.username.is_empty() {
            errors.push(ValidationError::new(
                "smtp.username",
                "required when smtp.auth is set",
            ));
        }
        if smtp.auth != SmtpAuth::None && smtp.tls == SmtpTls::None {
            errors.push(ValidationError::new(
                "smtp.tls",
                "must be starttls or tls when smtp.auth is set",
            ));
        }
    }

    let mut messenger_names = HashSet::new();
    if smtp.enabled {
        messenger_names.insert(EMAIL_MESSENGER.to_string());
    }
    for (i, m) in config.messengers.iter().enumerate() {
        let field = format!("messengers[{}]", i);
        if m.name.trim().is_empty() {
            errors.push(ValidationError::new(format!("{}.name", field), "must not be empty"));
        } else if m.name == EMAIL_MESSENGER {
            errors.push(ValidationError::new(
                format!("{}.name", field),
                format!("`{}` is reserved for the SMTP messenger", EMAIL_MESSENGER),
            ));
        } else if m.enabled && !messenger_names.insert(m.name.clone()) {
            errors.push(ValidationError::new(
                format!("{}.name", field),
                format!("duplicate messenger name `{}`", m.name),
            ));
        }
        match Url::parse(&m.url) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
            _ => errors.push(ValidationError::new(
                format!("{}.url", field),
                "must be an http(s) URL",
            )),
        }
    }

    if config.campaign.queue_size == 0 {
        errors.push(ValidationError::new("campaign.queue_size", "must be >= 1"));
    }
    if config.campaign.max_send_attempts == 0 {
        errors.push(ValidationError::new("campaign.max_send_attempts", "must be >= 1"));
    }
    if config.importer.queue_size == 0 {
        errors.push(ValidationError::new("importer.queue_size", "must be >= 1"));
    }
    if config.bounce.enabled && config.bounce.queue_size == 0 {
        errors.push(ValidationError::new("bounce.queue_size", "must be >= 1"));
    }

    let mut job_names = HashSet::new();
    for (i, job) in config.jobs.iter().enumerate() {
        let field = format!("jobs[{}]", i);
        if !job_names.insert(job.name.as_str()) {
            errors.push(ValidationError::new(
                format!("{}.name", field),
                format!("duplicate job name `{}`", job.name),
            ));
        }
        if let Err(message) = job.schedule.validate() {
            errors.push(ValidationError::new(format!("{}.schedule", field), message));
        }
        if job.enabled && !messenger_names.contains(&job.messenger) {
            errors.push(ValidationError::new(
                format!("{}.messenger", field),
                format!("no enabled messenger named `{}`", job.messenger),
            ));
        }
    }

    let deadlines = [
        ("shutdown.scheduler_secs", config.shutdown.scheduler_secs),
        ("shutdown.listener_secs", config.shutdown.listener_secs),
        ("shutdown.workers_secs", config.shutdown.workers_secs),
        ("shutdown.messengers_secs", config.shutdown.messengers_secs),
        ("shutdown.storage_secs", config.shutdown.storage_secs),
    ];
    for (field, secs) in deadlines {
        if secs == 0 {
            errors.push(ValidationError::new(field, "must be > 0"));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::PostbackConfig;
    use crate::scheduler::{JobConfig, JobSchedule};

    fn postback(name: &str) -> PostbackConfig {
        PostbackConfig {
            name: name.to_string(),
            url: "http://127.0.0.1:8080/hook".to_string(),
            username: String::new(),
            password: String::new(),
            timeout_secs: 5,
            enabled: true,
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&AppConfig::default()).is_ok());
    }

    #[test]
    fn test_collects_every_error() {
        let mut config = AppConfig::default();
        config.app.address = "nowhere".into();
        config.db.max_open = 0;
        config.shutdown.listener_secs = 0;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["app.address", "db.max_open", "shutdown.listener_secs"]);
    }

    #[test]
    fn test_rejects_duplicate_and_reserved_messenger_names() {
        let mut config = AppConfig::default();
        config.messengers = vec![postback("webhook"), postback("webhook"), postback("email")];

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].message.contains("duplicate"));
        assert!(errors[1].message.contains("reserved"));
    }

    #[test]
    fn test_job_must_reference_enabled_messenger() {
        let mut config = AppConfig::default();
        config.jobs.push(JobConfig {
            name: "weekly-digest".into(),
            schedule: JobSchedule::Every { secs: 60 },
            messenger: "email".into(),
            subject: "Digest".into(),
            body: "Hello".into(),
            enabled: true,
        });
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].field, "jobs[0].messenger");

        config.smtp.enabled = true;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_smtp_auth_requires_tls() {
        let mut config = AppConfig::default();
        config.smtp.enabled = true;
        config.smtp.auth = SmtpAuth::Plain;
        config.smtp.username = "sender".into();
        assert!(validate_config(&config).is_ok());

        config.smtp.tls = SmtpTls::None;
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "smtp.tls");
    }

    #[test]
    fn test_out_of_range_interval_is_rejected() {
        let mut config = AppConfig::default();
        config.smtp.enabled = true;
        config.jobs.push(JobConfig {
            name: "forever".into(),
            schedule: JobSchedule::Every {
                secs: 100_000_000_000_000_000,
            },
            messenger: "email".into(),
            subject: "Digest".into(),
            body: "Hello".into(),
            enabled: true,
        });
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].field, "jobs[0].schedule");
    }
}
