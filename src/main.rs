use clap::{Arg, Command};
use log::LevelFilter;
use postwhite::messages::Messages;
use postwhite::{run_server, Config, Registry};
use std::process;

fn main() {
    let matches = Command::new("postwhite")
        .version("0.9.0")
        .about("A Postfix policy daemon for per-recipient sender whitelisting")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/postwhite/config.yml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Test the configuration file and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("daemon")
                .short('d')
                .long("daemon")
                .help("Run as a daemon (background process)")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches.get_one::<String>("config").unwrap();
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            process::exit(1);
        }
    };

    init_logger(&config, matches.get_flag("verbose"));

    let registry = load_registry(&config);
    let messages = load_messages(&config);

    if matches.get_flag("test-config") {
        println!("Configuration file is valid!");
        println!("Listen address: {}:{}", config.host, config.port);
        println!("Config dir: {}", config.config_dir);
        println!("Spool dir: {}", config.spool_dir);
        println!("Protected recipients: {}", registry.len());
        println!("Learning period: {} minutes", config.learning_period);
        println!("SASL enforcement: {}", config.require_sasl);
        return;
    }

    if matches.get_flag("daemon") {
        daemonize();
    }

    log::info!("starting postwhite policy daemon");
    if let Err(e) = run_server(config, registry, messages) {
        log::error!("server error: {e:#}");
        process::exit(1);
    }
}

fn init_logger(config: &Config, verbose: bool) {
    let log_level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let mut builder = env_logger::Builder::from_default_env();
    builder.filter_level(log_level);
    if let Some(path) = &config.log_file {
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => {
                eprintln!("Cannot open log file {path}: {e}, logging to stderr");
            }
        }
    }
    builder.init();
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    if std::path::Path::new(path).exists() {
        Config::from_file(path)
    } else {
        eprintln!("Configuration file '{path}' not found, using default configuration");
        Ok(Config::default())
    }
}

fn load_registry(config: &Config) -> Registry {
    let path = config.recipients_path();
    match Registry::from_file(&path) {
        Ok(registry) => {
            log::info!("loaded {} protected recipients", registry.len());
            registry
        }
        Err(e) => {
            log::warn!(
                "cannot load {}: {e}; no recipient is protected",
                path.display()
            );
            Registry::default()
        }
    }
}

fn load_messages(config: &Config) -> Messages {
    let path = config.messages_path();
    match Messages::from_file(&path) {
        Ok(messages) => messages,
        Err(e) => {
            log::warn!("cannot load {}: {e}; using built-in templates", path.display());
            Messages::default()
        }
    }
}

fn daemonize() {
    #[cfg(unix)]
    {
        log::info!("detaching into the background");
        match unsafe { libc::fork() } {
            -1 => {
                log::error!("failed to fork process");
                process::exit(1);
            }
            0 => {
                if unsafe { libc::setsid() } == -1 {
                    log::error!("failed to create new session");
                    process::exit(1);
                }
                if unsafe { libc::chdir(c"/".as_ptr()) } == -1 {
                    log::warn!("failed to change working directory to /");
                }
                unsafe {
                    libc::close(0);
                    libc::close(1);
                    libc::close(2);
                }
            }
            _ => {
                process::exit(0);
            }
        }
    }

    #[cfg(not(unix))]
    {
        log::warn!("daemon mode not supported on this platform, running in foreground");
    }
}

fn generate_default_config(path: &str) {
    let config = Config::default();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {}", path);
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {}", e);
            process::exit(1);
        }
    }
}
