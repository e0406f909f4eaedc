use crate::error::{Error, Result};
use crate::field::{DesiredState, Field, Value};
use crate::retry::classify_lock_contention;
use crate::schema::{FieldSpec, ResourceKind, require};

static SMTP_FIELDS: &[FieldSpec] = &[
    FieldSpec::text("server"),
    FieldSpec::integer("port"),
    FieldSpec::text("mode"),
    FieldSpec::text("from-address"),
    FieldSpec::list("mailto"),
    FieldSpec::list("mailto-user"),
    FieldSpec::text("username"),
    FieldSpec::text("password").write_only(),
    FieldSpec::text("author"),
    FieldSpec::boolean("disable"),
    FieldSpec::text("comment"),
];

/// SMTP notification target (`/config/notifications/endpoints/smtp`).
pub static SMTP_TARGET: ResourceKind = ResourceKind {
    name: "notification-smtp",
    collection: "config/notifications/endpoints/smtp",
    id_field: "name",
    fields: SMTP_FIELDS,
    lock_class: None,
    task_backed: false,
    classify: classify_lock_contention,
    validate: validate_smtp,
};

static GOTIFY_FIELDS: &[FieldSpec] = &[
    FieldSpec::text("server"),
    FieldSpec::text("token").write_only(),
    FieldSpec::boolean("disable"),
    FieldSpec::text("comment"),
];

/// Gotify notification target (`/config/notifications/endpoints/gotify`).
pub static GOTIFY_TARGET: ResourceKind = ResourceKind {
    name: "notification-gotify",
    collection: "config/notifications/endpoints/gotify",
    id_field: "name",
    fields: GOTIFY_FIELDS,
    lock_class: None,
    task_backed: false,
    classify: classify_lock_contention,
    validate: validate_gotify,
};

static SENDMAIL_FIELDS: &[FieldSpec] = &[
    FieldSpec::text("from-address"),
    FieldSpec::list("mailto"),
    FieldSpec::list("mailto-user"),
    FieldSpec::text("author"),
    FieldSpec::boolean("disable"),
    FieldSpec::text("comment"),
];

/// Sendmail notification target (`/config/notifications/endpoints/sendmail`).
pub static SENDMAIL_TARGET: ResourceKind = ResourceKind {
    name: "notification-sendmail",
    collection: "config/notifications/endpoints/sendmail",
    id_field: "name",
    fields: SENDMAIL_FIELDS,
    lock_class: None,
    task_backed: false,
    classify: classify_lock_contention,
    validate: validate_sendmail,
};

static WEBHOOK_FIELDS: &[FieldSpec] = &[
    FieldSpec::text("url"),
    FieldSpec::text("method"),
    FieldSpec::text("body"),
    // Each entry is a property string: `name=<header>,value=<value>`.
    FieldSpec::list("header"),
    FieldSpec::text("secret").write_only(),
    FieldSpec::boolean("disable"),
    FieldSpec::text("comment"),
];

/// Webhook notification target (`/config/notifications/endpoints/webhook`).
pub static WEBHOOK_TARGET: ResourceKind = ResourceKind {
    name: "notification-webhook",
    collection: "config/notifications/endpoints/webhook",
    id_field: "name",
    fields: WEBHOOK_FIELDS,
    lock_class: None,
    task_backed: false,
    classify: classify_lock_contention,
    validate: validate_webhook,
};

static MATCHER_FIELDS: &[FieldSpec] = &[
    FieldSpec::list("target"),
    FieldSpec::list("match-severity"),
    FieldSpec::list("match-field"),
    FieldSpec::list("match-calendar"),
    FieldSpec::text("mode"),
    FieldSpec::boolean("invert-match"),
    FieldSpec::boolean("disable"),
    FieldSpec::text("comment"),
];

/// Routes notifications to targets (`/config/notifications/matchers`).
pub static MATCHER: ResourceKind = ResourceKind {
    name: "notification-matcher",
    collection: "config/notifications/matchers",
    id_field: "name",
    fields: MATCHER_FIELDS,
    lock_class: None,
    task_backed: false,
    classify: classify_lock_contention,
    validate: validate_matcher,
};

/// Reject a text field whose value is not one of `allowed`.
fn text_one_of(kind: &str, desired: &DesiredState, name: &str, allowed: &[&str]) -> Result<()> {
    match desired.get(name) {
        Field::Present(Value::Text(v)) if !allowed.contains(&v.as_str()) => {
            Err(Error::Validation(format!(
                "{} '{}': invalid {} '{}' (expected one of: {})",
                kind,
                desired.id,
                name,
                v,
                allowed.join(", ")
            )))
        }
        _ => Ok(()),
    }
}

/// Mail targets need at least one recipient, as an address or a user.
fn require_recipient(kind: &str, desired: &DesiredState) -> Result<()> {
    let has = |name: &str| matches!(desired.get(name), Field::Present(v) if !v.is_empty());
    if has("mailto") || has("mailto-user") {
        return Ok(());
    }
    Err(Error::Validation(format!(
        "{} '{}': mailto or mailto-user is required",
        kind, desired.id
    )))
}

fn validate_smtp(desired: &DesiredState) -> Result<()> {
    require("notification-smtp", desired, "server")?;
    require("notification-smtp", desired, "from-address")?;
    require_recipient("notification-smtp", desired)?;
    text_one_of("notification-smtp", desired, "mode", &["insecure", "starttls", "tls"])
}

fn validate_gotify(desired: &DesiredState) -> Result<()> {
    require("notification-gotify", desired, "server")?;
    require("notification-gotify", desired, "token")
}

fn validate_sendmail(desired: &DesiredState) -> Result<()> {
    require("notification-sendmail", desired, "from-address")?;
    require_recipient("notification-sendmail", desired)
}

fn validate_webhook(desired: &DesiredState) -> Result<()> {
    require("notification-webhook", desired, "url")?;
    text_one_of("notification-webhook", desired, "method", &["post", "put"])
}

fn validate_matcher(desired: &DesiredState) -> Result<()> {
    text_one_of("notification-matcher", desired, "mode", &["all", "any"])?;

    if let Field::Present(Value::List(levels)) = desired.get("match-severity") {
        const LEVELS: &[&str] = &["info", "notice", "warning", "error"];
        if let Some(level) = levels.iter().find(|l| !LEVELS.contains(&l.as_str())) {
            return Err(Error::Validation(format!(
                "notification-matcher '{}': invalid severity '{}' (expected one of: {})",
                desired.id,
                level,
                LEVELS.join(", ")
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(items: &[&str]) -> Value {
        Value::List(items.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_smtp_requires_server_sender_and_recipient() {
        let desired = DesiredState::new("mail")
            .set("server", Value::text("smtp.example.com"))
            .set("from-address", Value::text("pbs@example.com"));
        assert!(validate_smtp(&desired).is_err());

        let desired = desired.set("mailto-user", list(&["root@pam"]));
        assert!(validate_smtp(&desired).is_ok());

        let desired = desired.set("mode", Value::text("ssl"));
        assert!(matches!(validate_smtp(&desired), Err(Error::Validation(msg)) if msg.contains("starttls")));
    }

    #[test]
    fn test_gotify_requires_token() {
        let desired = DesiredState::new("phone").set("server", Value::text("https://gotify.example.com"));
        assert!(validate_gotify(&desired).is_err());
        assert!(validate_gotify(&desired.set("token", Value::text("t0ken"))).is_ok());
    }

    #[test]
    fn test_sendmail_requires_recipient() {
        let desired = DesiredState::new("local").set("from-address", Value::text("pbs@localhost"));
        assert!(validate_sendmail(&desired).is_err());
        assert!(validate_sendmail(&desired.set("mailto", list(&["ops@example.com"]))).is_ok());
    }

    #[test]
    fn test_webhook_method() {
        let desired = DesiredState::new("hook").set("url", Value::text("https://hooks.example.com/pbs"));
        assert!(validate_webhook(&desired).is_ok());
        assert!(validate_webhook(&desired.clone().set("method", Value::text("put"))).is_ok());
        assert!(validate_webhook(&desired.set("method", Value::text("get"))).is_err());
    }

    #[test]
    fn test_matcher_mode_and_severity() {
        let desired = DesiredState::new("errors")
            .set("target", list(&["mail"]))
            .set("match-severity", list(&["warning", "error"]))
            .set("mode", Value::text("any"));
        assert!(validate_matcher(&desired).is_ok());

        assert!(validate_matcher(&desired.clone().set("mode", Value::text("some"))).is_err());
        assert!(validate_matcher(&desired.set("match-severity", list(&["critical"]))).is_err());
    }

    #[test]
    fn test_secrets_are_write_only() {
        for (kind, field) in [
            (&SMTP_TARGET, "password"),
            (&GOTIFY_TARGET, "token"),
            (&WEBHOOK_TARGET, "secret"),
        ] {
            assert!(kind.field(field).is_some_and(|f| f.write_only), "{}.{}", kind.name, field);
        }
        assert!(SENDMAIL_TARGET.fields.iter().all(|f| !f.write_only));
        assert!(MATCHER.fields.iter().all(|f| !f.write_only));
    }
}
