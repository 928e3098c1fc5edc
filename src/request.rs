use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;
use std::io::BufRead;
use thiserror::Error;

/// Attribute keys of the Postfix policy-delegation protocol we keep.
/// Anything else in the request block is dropped without comment.
const RECOGNIZED_KEYS: [&str; 16] = [
    "request",
    "protocol_state",
    "protocol_name",
    "client_address",
    "client_name",
    "helo_name",
    "sender",
    "recipient",
    "instance",
    "sasl_method",
    "sasl_username",
    "sasl_sender",
    "size",
    "ccert_subject",
    "ccert_issuer",
    "ccert_fingerprint",
];

lazy_static! {
    // local+verb[-argument]@domain; the greedy tail binds the argument up
    // to the last "@" so "-at-" encoded addresses survive the local part.
    static ref COMMAND_RE: Regex =
        Regex::new(r"^(.+)\+(info|learn|allow|swallow|deny|block)-?(.*)(@.+)$").unwrap();
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("i/o error reading policy request: {0}")]
    Io(#[from] std::io::Error),
    #[error("policy request truncated before the terminating empty line")]
    Truncated,
    #[error("policy request is missing the {0} attribute")]
    MissingAttribute(&'static str),
}

/// A command suffix peeled off the recipient address. The verb is kept as
/// text here; the decision engine decides which verbs it will execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub verb: String,
    pub argument: String,
}

#[derive(Debug, Default, Clone)]
pub struct PolicyRequest {
    pub client_address: String,
    pub client_name: String,
    pub sender: String,
    /// Recipient with any command suffix already stripped; this is the
    /// key for every registry, whitelist, and spool lookup.
    pub recipient: String,
    pub sasl_username: String,
    pub instance: String,
    pub sender_local: String,
    pub sender_domain: String,
    pub command: Option<ParsedCommand>,
}

impl PolicyRequest {
    /// Local part and domain of the stripped recipient, used to build the
    /// command addresses advisory mails point their Reply-To at.
    pub fn recipient_parts(&self) -> (&str, &str) {
        match self.recipient.rsplit_once('@') {
            Some((local, domain)) => (local, domain),
            None => (self.recipient.as_str(), ""),
        }
    }
}

/// Read one `key=value` block terminated by an empty line and distill it
/// into a [`PolicyRequest`]. Returns `Ok(None)` when the peer closed the
/// connection without sending anything.
pub fn read_request<R: BufRead>(reader: &mut R) -> Result<Option<PolicyRequest>, RequestError> {
    let mut attrs: HashMap<&'static str, String> = HashMap::new();
    let mut line = String::new();
    let mut saw_data = false;

    loop {
        line.clear();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            if saw_data {
                return Err(RequestError::Truncated);
            }
            return Ok(None);
        }
        saw_data = true;

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        if let Some((key, value)) = trimmed.split_once('=') {
            if let Some(known) = RECOGNIZED_KEYS.iter().find(|k| **k == key) {
                attrs.insert(*known, value.to_lowercase());
            } else {
                log::debug!("dropping unrecognized request attribute {key}");
            }
        }
    }

    let mut request = PolicyRequest {
        client_address: attrs
            .remove("client_address")
            .ok_or(RequestError::MissingAttribute("client_address"))?,
        recipient: attrs
            .remove("recipient")
            .ok_or(RequestError::MissingAttribute("recipient"))?,
        client_name: attrs.remove("client_name").unwrap_or_default(),
        sender: attrs.remove("sender").unwrap_or_default(),
        sasl_username: attrs.remove("sasl_username").unwrap_or_default(),
        instance: attrs.remove("instance").unwrap_or_default(),
        ..PolicyRequest::default()
    };

    let addressed_to = request.recipient.clone();
    if let Some(caps) = COMMAND_RE.captures(&addressed_to) {
        request.recipient = format!("{}{}", &caps[1], &caps[4]);
        request.command = Some(ParsedCommand {
            verb: caps[2].to_string(),
            argument: caps[3].replace("-at-", "@"),
        });
    }

    match request.sender.rsplit_once('@') {
        Some((local, domain)) => {
            request.sender_local = local.to_string();
            request.sender_domain = domain.to_string();
        }
        None => {
            request.sender_local = request.sender.clone();
        }
    }

    Ok(Some(request))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn parse(block: &str) -> PolicyRequest {
        read_request(&mut Cursor::new(block.as_bytes()))
            .unwrap()
            .expect("expected a request")
    }

    #[test]
    fn test_plain_policy_block() {
        let request = parse(
            "request=smtpd_access_policy\n\
             protocol_state=RCPT\n\
             client_address=203.0.113.5\n\
             client_name=mx.sirius.tld\n\
             sender=Marvin@Sirius.TLD\n\
             recipient=hitchhike@dent.tld\n\
             sasl_username=\n\
             instance=abc123\n\
             \n",
        );
        assert_eq!(request.client_address, "203.0.113.5");
        assert_eq!(request.sender, "marvin@sirius.tld");
        assert_eq!(request.sender_local, "marvin");
        assert_eq!(request.sender_domain, "sirius.tld");
        assert_eq!(request.recipient, "hitchhike@dent.tld");
        assert_eq!(request.instance, "abc123");
        assert!(request.command.is_none());
    }

    #[test]
    fn test_command_suffix_without_argument() {
        let request = parse(
            "client_address=203.0.113.5\n\
             sender=hitchhike@dent.tld\n\
             recipient=hitchhike+learn@dent.tld\n\
             \n",
        );
        assert_eq!(request.recipient, "hitchhike@dent.tld");
        let command = request.command.unwrap();
        assert_eq!(command.verb, "learn");
        assert_eq!(command.argument, "");
    }

    #[test]
    fn test_command_suffix_with_domain_argument() {
        let request = parse(
            "client_address=203.0.113.5\n\
             sender=hitchhike@dent.tld\n\
             recipient=hitchhike+allow-sirius.tld@dent.tld\n\
             \n",
        );
        assert_eq!(request.recipient, "hitchhike@dent.tld");
        let command = request.command.unwrap();
        assert_eq!(command.verb, "allow");
        assert_eq!(command.argument, "sirius.tld");
    }

    #[test]
    fn test_command_argument_at_rewrite() {
        let request = parse(
            "client_address=::1\n\
             recipient=alice+allow-bob-at-example.tld@dom.tld\n\
             \n",
        );
        assert_eq!(request.recipient, "alice@dom.tld");
        let command = request.command.unwrap();
        assert_eq!(command.verb, "allow");
        assert_eq!(command.argument, "bob@example.tld");
    }

    #[test]
    fn test_block_verb_is_captured_not_aliased() {
        let request = parse(
            "client_address=203.0.113.5\n\
             recipient=alice+block-spam.tld@dom.tld\n\
             \n",
        );
        assert_eq!(request.recipient, "alice@dom.tld");
        assert_eq!(request.command.unwrap().verb, "block");
    }

    #[test]
    fn test_plus_suffix_without_known_verb_is_not_a_command() {
        let request = parse(
            "client_address=203.0.113.5\n\
             recipient=alice+folder@dom.tld\n\
             \n",
        );
        assert_eq!(request.recipient, "alice+folder@dom.tld");
        assert!(request.command.is_none());
    }

    #[test]
    fn test_unknown_keys_dropped() {
        let request = parse(
            "client_address=203.0.113.5\n\
             recipient=alice@dom.tld\n\
             stress=\n\
             x_custom_key=whatever\n\
             \n",
        );
        assert_eq!(request.recipient, "alice@dom.tld");
    }

    #[test]
    fn test_missing_recipient_is_an_error() {
        let result = read_request(&mut Cursor::new(
            b"client_address=203.0.113.5\n\n".as_slice(),
        ));
        assert!(matches!(
            result,
            Err(RequestError::MissingAttribute("recipient"))
        ));
    }

    #[test]
    fn test_truncated_stream() {
        let result = read_request(&mut Cursor::new(
            b"client_address=203.0.113.5\nrecipient=alice@dom.tld\n".as_slice(),
        ));
        assert!(matches!(result, Err(RequestError::Truncated)));
    }

    #[test]
    fn test_clean_eof_is_no_request() {
        let result = read_request(&mut Cursor::new(b"".as_slice())).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_empty_sender_splits_empty() {
        let request = parse(
            "client_address=203.0.113.5\n\
             sender=\n\
             recipient=alice@dom.tld\n\
             \n",
        );
        assert_eq!(request.sender, "");
        assert_eq!(request.sender_local, "");
        assert_eq!(request.sender_domain, "");
    }

    #[test]
    fn test_recipient_parts() {
        let request = parse(
            "client_address=203.0.113.5\n\
             recipient=hitchhike@dent.tld\n\
             \n",
        );
        assert_eq!(request.recipient_parts(), ("hitchhike", "dent.tld"));
    }
}
