use crate::config::{Config, Registry};
use crate::decision::{Action, Decision, PolicyEngine};
use crate::mailer::Mailer;
use crate::messages::Messages;
use crate::request;
use anyhow::Context;
use std::io::{BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

/// Drive one policy query over an already-accepted connection: parse,
/// decide, answer, then submit any queued mail. Every failure inside
/// the decision collapses to DUNNO; a daemon bug must not block the
/// MTA's mail flow.
pub fn handle_connection<S: Read + Write>(engine: &PolicyEngine, mailer: &Mailer, mut stream: S) {
    let parsed = {
        let mut reader = BufReader::new(&mut stream);
        request::read_request(&mut reader)
    };

    let decision = match parsed {
        Ok(Some(request)) => match engine.decide(&request) {
            Ok(decision) => {
                log::info!(
                    "instance={} client={} sender={} recipient={} action={} ({})",
                    request.instance,
                    request.client_address,
                    request.sender,
                    request.recipient,
                    decision.action.verb(),
                    decision.action.message()
                );
                decision
            }
            Err(e) => {
                log::error!("decision failed for {}: {e:#}", request.recipient);
                daemon_error()
            }
        },
        Ok(None) => return,
        Err(e) => {
            log::error!("unreadable policy request: {e}");
            daemon_error()
        }
    };

    if let Err(e) = stream.write_all(decision.action.response().as_bytes()) {
        log::error!("failed to write policy response: {e}");
        return;
    }
    let _ = stream.flush();

    if let Some(mail) = decision.mail {
        if let Err(e) = mailer.send(&mail) {
            log::error!("failed to deliver mail to {}: {e}", mail.to);
        }
    }
}

fn daemon_error() -> Decision {
    Decision {
        action: Action::Dunno {
            message: "daemon error".to_string(),
        },
        mail: None,
    }
}

/// Accept loop with a fixed pool of handler threads. Each connection
/// carries exactly one query; the workers share nothing in memory, all
/// coordination goes through the store and spool files.
pub fn run_server(config: Config, registry: Registry, messages: Messages) -> anyhow::Result<()> {
    let engine = Arc::new(PolicyEngine::new(config.clone(), registry, messages)?);
    let mailer = Arc::new(Mailer::new(&config));

    write_pid_file(&config.pid_file);

    let pid_file = config.pid_file.clone();
    ctrlc::set_handler(move || {
        log::info!("received shutdown signal");
        remove_pid_file(&pid_file);
        std::process::exit(0);
    })
    .map_err(|e| anyhow::anyhow!("failed to install shutdown handler: {e}"))?;

    let listener = TcpListener::bind((config.host.as_str(), config.port))
        .with_context(|| format!("failed to bind {}:{}", config.host, config.port))?;
    log::info!(
        "postwhite listening on {}:{} ({} handlers)",
        config.host,
        config.port,
        config.max_connections
    );

    let (sender, receiver) = mpsc::channel::<TcpStream>();
    let receiver = Arc::new(Mutex::new(receiver));

    for id in 0..config.max_connections.max(1) {
        let receiver = Arc::clone(&receiver);
        let engine = Arc::clone(&engine);
        let mailer = Arc::clone(&mailer);
        thread::spawn(move || loop {
            let stream = match receiver.lock() {
                Ok(guard) => guard.recv(),
                Err(_) => break,
            };
            match stream {
                Ok(stream) => {
                    log::debug!("handler {id} took a connection");
                    handle_connection(&engine, &mailer, stream);
                }
                Err(_) => break,
            }
        });
    }

    for incoming in listener.incoming() {
        match incoming {
            Ok(stream) => {
                if sender.send(stream).is_err() {
                    break;
                }
            }
            Err(e) => {
                log::error!("failed to accept connection: {e}");
            }
        }
    }

    remove_pid_file(&config.pid_file);
    Ok(())
}

fn write_pid_file(path: &str) {
    if let Err(e) = std::fs::write(path, format!("{}\n", std::process::id())) {
        log::warn!("failed to write pid file {path}: {e}");
    }
}

fn remove_pid_file(path: &str) {
    if Path::new(path).exists() {
        if let Err(e) = std::fs::remove_file(path) {
            log::error!("failed to remove pid file {path}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::{self, Cursor};
    use tempfile::TempDir;

    struct FakeStream {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl FakeStream {
        fn new(input: &str) -> Self {
            FakeStream {
                input: Cursor::new(input.as_bytes().to_vec()),
                output: Vec::new(),
            }
        }

        fn response(&self) -> String {
            String::from_utf8(self.output.clone()).unwrap()
        }
    }

    impl Read for FakeStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for FakeStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn test_engine(dir: &TempDir) -> (PolicyEngine, Mailer) {
        let config = Config {
            config_dir: dir.path().join("config").to_string_lossy().into_owned(),
            spool_dir: dir.path().join("spool").to_string_lossy().into_owned(),
            require_sasl: false,
            ..Config::default()
        };
        let mut raw = HashMap::new();
        raw.insert("hitchhike@dent.tld".to_string(), None);
        let mailer = Mailer::new(&config);
        let engine =
            PolicyEngine::new(config, Registry::from_map(raw), Messages::default()).unwrap();
        (engine, mailer)
    }

    #[test]
    fn test_handler_answers_one_query_with_framed_response() {
        let dir = TempDir::new().unwrap();
        let (engine, mailer) = test_engine(&dir);

        let mut stream = FakeStream::new(
            "request=smtpd_access_policy\n\
             client_address=203.0.113.5\n\
             sender=marvin@sirius.tld\n\
             recipient=trillian@heart.tld\n\
             \n",
        );
        handle_connection(&engine, &mailer, &mut stream);

        let response = stream.response();
        assert_eq!(
            response,
            "action=DUNNO not a whitelist protected recipient\n\n"
        );
        assert!(response.ends_with("\n\n"));
        assert_eq!(response.matches("action=").count(), 1);
    }

    #[test]
    fn test_handler_converts_parse_failure_to_daemon_error() {
        let dir = TempDir::new().unwrap();
        let (engine, mailer) = test_engine(&dir);

        // Block ends before the terminating empty line.
        let mut stream = FakeStream::new("client_address=203.0.113.5\n");
        handle_connection(&engine, &mailer, &mut stream);

        assert_eq!(stream.response(), "action=DUNNO daemon error\n\n");
    }

    #[test]
    fn test_handler_stays_quiet_on_immediate_close() {
        let dir = TempDir::new().unwrap();
        let (engine, mailer) = test_engine(&dir);

        let mut stream = FakeStream::new("");
        handle_connection(&engine, &mailer, &mut stream);

        assert!(stream.response().is_empty());
    }

    #[test]
    fn test_handler_rejects_unlisted_sender_for_protected_recipient() {
        let dir = TempDir::new().unwrap();
        let (engine, mailer) = test_engine(&dir);

        let mut stream = FakeStream::new(
            "client_address=203.0.113.5\n\
             sender=marvin@sirius.tld\n\
             recipient=hitchhike@dent.tld\n\
             \n",
        );
        handle_connection(&engine, &mailer, &mut stream);

        assert_eq!(
            stream.response(),
            "action=REJECT User unknown in local recipient table\n\n"
        );
    }
}
