use crate::mailer::OutboundMail;
use crate::messages::{render, MailTemplate, Messages};
use crate::request::PolicyRequest;
use crate::spool::LearningSpool;
use crate::whitelist::{Method, Whitelist};
use anyhow::Result;

/// The verbs a recipient may embed in their own address. `block` from
/// early deployments is deliberately not here; the decision engine
/// refuses it instead of aliasing it to `deny`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Info,
    Learn,
    Allow,
    Swallow,
    Deny,
}

impl Command {
    pub fn from_verb(verb: &str) -> Option<Command> {
        match verb {
            "info" => Some(Command::Info),
            "learn" => Some(Command::Learn),
            "allow" => Some(Command::Allow),
            "swallow" => Some(Command::Swallow),
            "deny" => Some(Command::Deny),
            _ => None,
        }
    }

    pub fn as_verb(&self) -> &'static str {
        match self {
            Command::Info => "info",
            Command::Learn => "learn",
            Command::Allow => "allow",
            Command::Swallow => "swallow",
            Command::Deny => "deny",
        }
    }
}

/// Run one authorized command against the store and spool. Returns the
/// mail to submit afterwards, if the command produces one. Mutations
/// happen before the mail is built, so a failed mutation surfaces as an
/// error and nothing is sent.
pub fn execute(
    messages: &Messages,
    whitelist: &Whitelist,
    spool: &LearningSpool,
    request: &PolicyRequest,
    command: Command,
    argument: &str,
) -> Result<Option<OutboundMail>> {
    log::info!(
        "executing {} for {} (argument {:?})",
        command.as_verb(),
        request.recipient,
        argument
    );
    match command {
        Command::Info => {
            let mut entries = whitelist.dump(&request.recipient)?;
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let listing = if entries.is_empty() {
                "(no entries)".to_string()
            } else {
                entries
                    .iter()
                    .map(|(pattern, method)| format!("{pattern}\t{}", method.as_str()))
                    .collect::<Vec<_>>()
                    .join("\n")
            };
            let generated = chrono::Utc::now()
                .format("%Y-%m-%d %H:%M:%S UTC")
                .to_string();
            let mut vars = request_vars(request);
            vars.push(("whitelist", listing.as_str()));
            vars.push(("generated", generated.as_str()));
            Ok(Some(build_mail(messages, &messages.info, &vars, request, None)))
        }
        Command::Learn => {
            spool.begin_learning(&request.recipient)?;
            Ok(None)
        }
        Command::Allow => {
            if let Some(pattern) = usable_pattern(argument, command) {
                whitelist.add(&request.recipient, pattern, Method::Allow)?;
                spool.end_learning(&request.recipient)?;
            }
            Ok(None)
        }
        Command::Swallow => {
            if let Some(pattern) = usable_pattern(argument, command) {
                whitelist.add(&request.recipient, pattern, Method::Swallow)?;
                spool.end_learning(&request.recipient)?;
            }
            Ok(None)
        }
        Command::Deny => {
            if let Some(pattern) = usable_pattern(argument, command) {
                whitelist.remove(&request.recipient, pattern)?;
                spool.end_learning(&request.recipient)?;
            }
            Ok(None)
        }
    }
}

/// An empty pattern would prefix-match every sender, so a command that
/// arrives without an argument changes nothing.
fn usable_pattern(argument: &str, command: Command) -> Option<&str> {
    if argument.is_empty() {
        log::warn!("{} command without an argument ignored", command.as_verb());
        None
    } else {
        Some(argument)
    }
}

/// Advisory sent for each delivery while the recipient is learning. An
/// unknown sender gets the allow offer, a whitelisted one the deny
/// offer; the Reply-To is the command address that performs the offer.
pub fn advisory(
    messages: &Messages,
    request: &PolicyRequest,
    matched: Option<Method>,
) -> OutboundMail {
    let (local, domain) = request.recipient_parts();
    let (template, verb) = match matched {
        None => (&messages.allow_advice, "allow"),
        Some(_) => (&messages.deny_advice, "deny"),
    };
    let reply_to = format!("{local}+{verb}-{}@{domain}", request.sender_domain);
    let vars = request_vars(request);
    build_mail(messages, template, &vars, request, Some(reply_to))
}

fn request_vars(request: &PolicyRequest) -> Vec<(&'static str, &str)> {
    vec![
        ("sender", request.sender.as_str()),
        ("sender_local", request.sender_local.as_str()),
        ("sender_domain", request.sender_domain.as_str()),
        ("recipient", request.recipient.as_str()),
        ("client_address", request.client_address.as_str()),
        ("client_name", request.client_name.as_str()),
    ]
}

fn build_mail(
    messages: &Messages,
    template: &MailTemplate,
    vars: &[(&str, &str)],
    request: &PolicyRequest,
    reply_to: Option<String>,
) -> OutboundMail {
    let mut body = render(&template.body, vars);
    body.push_str(&messages.footer);
    OutboundMail {
        to: request.recipient.clone(),
        reply_to,
        subject: render(&template.subject, vars),
        body,
    }
}
