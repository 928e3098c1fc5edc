use serde::{Deserialize, Serialize};
use std::path::Path;

/// Subject and body of one generated mail. Bodies may reference request
/// attributes as `%{name}` placeholders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailTemplate {
    pub subject: String,
    pub body: String,
}

/// The template set loaded from `messages.yml`. Sites usually only
/// override the wording; the placeholders available are the same for
/// every template: `%{sender}`, `%{sender_local}`, `%{sender_domain}`,
/// `%{recipient}`, `%{client_address}`, `%{client_name}`, and (for the
/// whitelist listing only) `%{whitelist}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Messages {
    pub info: MailTemplate,
    pub allow_advice: MailTemplate,
    pub deny_advice: MailTemplate,
    pub footer: String,
}

impl Default for Messages {
    fn default() -> Self {
        Messages {
            info: MailTemplate {
                subject: "Your whitelist".to_string(),
                body: "\
The following senders are currently on the whitelist for %{recipient}:

%{whitelist}

Listing generated %{generated}.
"
                .to_string(),
            },
            allow_advice: MailTemplate {
                subject: "New sender %{sender}".to_string(),
                body: "\
Your whitelist is in learning mode, so the message from %{sender}
(host %{client_name}, address %{client_address}) has been delivered
to you even though %{sender} is not on your whitelist.

Reply to this message to accept all future mail from %{sender_domain}.
"
                .to_string(),
            },
            deny_advice: MailTemplate {
                subject: "Known sender %{sender}".to_string(),
                body: "\
Your whitelist is in learning mode. The message from %{sender}
(host %{client_name}, address %{client_address}) matched an existing
whitelist entry and has been delivered to you.

Reply to this message to remove %{sender_domain} from your whitelist.
"
                .to_string(),
            },
            footer: "\n-- \nThis mail was generated by the postwhite policy daemon.\n"
                .to_string(),
        }
    }
}

impl Messages {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let messages: Messages = serde_yaml::from_str(&content)?;
        Ok(messages)
    }
}

/// Substitute `%{name}` placeholders with the bound values. Unknown
/// placeholders are left in place so a template typo stays visible in
/// the delivered mail instead of vanishing.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (name, value) in vars {
        out = out.replace(&format!("%{{{name}}}"), value);
    }
    out
}
