pub mod command;
pub mod config;
pub mod decision;
pub mod mailer;
pub mod messages;
pub mod request;
pub mod server;
pub mod spool;
pub mod whitelist;

pub use config::{Config, Registry};
pub use decision::{Action, Decision, PolicyEngine};
pub use mailer::{Mailer, OutboundMail};
pub use request::PolicyRequest;
pub use server::run_server;
pub use whitelist::{Method, Whitelist};
