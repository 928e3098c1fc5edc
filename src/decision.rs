use crate::command::{self, Command};
use crate::config::{Config, Registry};
use crate::mailer::OutboundMail;
use crate::messages::Messages;
use crate::request::PolicyRequest;
use crate::spool::LearningSpool;
use crate::whitelist::{Method, Whitelist};
use anyhow::Result;

const NOT_PROTECTED: &str = "not a whitelist protected recipient";

/// MTA-facing verdict. DUNNO passes the decision on, OK accepts inside
/// the learning window, DISCARD accepts at SMTP but drops the message
/// before delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Dunno { message: String },
    Ok { message: String },
    Reject { message: String },
    Discard { message: String },
}

impl Action {
    pub fn verb(&self) -> &'static str {
        match self {
            Action::Dunno { .. } => "DUNNO",
            Action::Ok { .. } => "OK",
            Action::Reject { .. } => "REJECT",
            Action::Discard { .. } => "DISCARD",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Action::Dunno { message }
            | Action::Ok { message }
            | Action::Reject { message }
            | Action::Discard { message } => message,
        }
    }

    /// The exact bytes owed to the MTA: one action line, one empty line.
    pub fn response(&self) -> String {
        if self.message().is_empty() {
            format!("action={}\n\n", self.verb())
        } else {
            format!("action={} {}\n\n", self.verb(), self.message())
        }
    }
}

#[derive(Debug)]
pub struct Decision {
    pub action: Action,
    /// Advisory or listing mail to submit once the response is on the
    /// wire; submission failures never change the action.
    pub mail: Option<OutboundMail>,
}

impl Decision {
    fn action(action: Action) -> Decision {
        Decision { action, mail: None }
    }
}

/// Everything a handler needs to turn one parsed request into a
/// decision. Built once at startup and shared read-only between
/// handlers; all mutable state lives in the store and spool files.
pub struct PolicyEngine {
    config: Config,
    registry: Registry,
    messages: Messages,
    whitelist: Whitelist,
    spool: LearningSpool,
}

impl PolicyEngine {
    pub fn new(config: Config, registry: Registry, messages: Messages) -> Result<Self> {
        let whitelist = Whitelist::open(config.config_dir.clone())?;
        let spool = LearningSpool::open(config.spool_dir.clone(), config.learning_period_secs())?;
        Ok(PolicyEngine {
            config,
            registry,
            messages,
            whitelist,
            spool,
        })
    }

    pub fn decide(&self, request: &PolicyRequest) -> Result<Decision> {
        // Local submission is never policed, so the daemon's own
        // advisory mails cannot loop back into it.
        if request.client_address == "127.0.0.1" || request.client_address == "::1" {
            return Ok(Decision::action(Action::Dunno {
                message: NOT_PROTECTED.to_string(),
            }));
        }

        if !self.registry.contains(&request.recipient) {
            return Ok(Decision::action(Action::Dunno {
                message: NOT_PROTECTED.to_string(),
            }));
        }

        if let Some(parsed) = &request.command {
            if !self.authorized(request) {
                log::warn!(
                    "unauthorized {} command for {} from {} (client {})",
                    parsed.verb,
                    request.recipient,
                    request.sender,
                    request.client_address
                );
                return Ok(Decision::action(Action::Reject {
                    message: "authorization failed".to_string(),
                }));
            }
            let Some(cmd) = Command::from_verb(&parsed.verb) else {
                log::warn!("refusing retired command verb {}", parsed.verb);
                return Ok(Decision::action(Action::Reject {
                    message: "unsupported command".to_string(),
                }));
            };
            let mail = command::execute(
                &self.messages,
                &self.whitelist,
                &self.spool,
                request,
                cmd,
                &parsed.argument,
            )?;
            return Ok(Decision {
                action: Action::Discard {
                    message: "executing command".to_string(),
                },
                mail,
            });
        }

        if self.spool.is_learning(&request.recipient)? {
            let matched = self.whitelist.query(
                &request.recipient,
                &request.sender,
                &request.sender_domain,
            )?;
            let mail = command::advisory(&self.messages, request, matched);
            return Ok(Decision {
                action: Action::Ok {
                    message: "learning mode".to_string(),
                },
                mail: Some(mail),
            });
        }

        let verdict = self.whitelist.query(
            &request.recipient,
            &request.sender,
            &request.sender_domain,
        )?;
        Ok(Decision::action(match verdict {
            Some(Method::Swallow) => Action::Discard {
                message: "found on whitelist with SWALLOW".to_string(),
            },
            Some(Method::Allow) => Action::Dunno {
                message: "found on whitelist with ALLOW".to_string(),
            },
            None => Action::Reject {
                message: self.config.reject_message.clone(),
            },
        }))
    }

    /// A command may only come from the protected recipient themselves,
    /// and with SASL enforcement on, only over the registered identity.
    /// Without the SASL binding anyone who can forge the envelope sender
    /// could rewrite another user's list.
    fn authorized(&self, request: &PolicyRequest) -> bool {
        if !self.registry.contains(&request.sender) {
            return false;
        }
        if request.sender != request.recipient {
            return false;
        }
        if !self.config.require_sasl {
            return true;
        }
        self.registry.expected_sasl(&request.sender) == Some(request.sasl_username.as_str())
    }
}
