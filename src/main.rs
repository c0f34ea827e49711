use std::{error::Error, process, time::Duration};

use clap::{command, Parser, ValueHint};
use log::{debug, error, info, LevelFilter};
use url::Url;

use remoteslave::{
    config::{self, Config, SinkKind},
    error::ErrorKind,
    remote,
    session::Session,
    signal,
};

/// Profile to display when not built in release mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when built in release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Secrets file
    ///
    /// Holds the user key, authorization key and cookies of the account.
    /// Keep it private: it grants access to the account.
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath, default_value_t = String::from("secrets.toml"), env = "REMOTESLAVE_SECRETS_FILE")]
    secrets_file: String,

    /// Where to send streams: `pipeline` or `mock`
    ///
    /// `mock` only logs what would be played, for use without audio tools.
    #[arg(long, default_value_t = SinkKind::default(), env = "REMOTESLAVE_SINK")]
    sink: SinkKind,

    /// Fetch command
    ///
    /// Writes the stream to stdout. `{host}`, `{app}` and `{surl}` are
    /// substituted with the stream location.
    #[arg(long, value_name = "COMMAND", default_value_t = String::from(Config::DEFAULT_FETCH_COMMAND), env = "REMOTESLAVE_FETCH_COMMAND")]
    fetch_command: String,

    /// Playback command
    ///
    /// Reads the stream from stdin.
    #[arg(long, value_name = "COMMAND", default_value_t = String::from(Config::DEFAULT_PLAY_COMMAND), env = "REMOTESLAVE_PLAY_COMMAND")]
    play_command: String,

    /// Catalog API base URL
    #[arg(long, value_name = "URL", value_hint = ValueHint::Url, default_value_t = String::from(Config::DEFAULT_API_URL))]
    api_url: String,

    /// Connect to the pubsub service over TLS
    #[arg(long, default_value_t = false)]
    secure: bool,

    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,
}

/// Initializes the logger facade.
///
/// The logging level is determined as follows, in order of precedence from
/// highest to lowest:
/// 1. Command line arguments
/// 2. `RUST_LOG` environment variable
/// 3. Hard coded default
///
/// # Panics
///
/// Panics when a logger facade is already initialized.
fn init_logger(config: &Args) {
    let mut logger = env_logger::Builder::from_env(
        // Note: if you change the default logging level here, then you should
        // probably also change the verbosity levels below.
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if config.quiet || config.verbose > 0 {
        let level = match config.verbose {
            0 => {
                // Quiet and verbose are mutually exclusive, and `verbose` is 0
                // by default. So this arm means: quiet mode.
                LevelFilter::Warn
            }
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Filter log messages of external crates.
        logger.filter_module(module_path!(), level);
    }

    logger.init();
}

/// Loads the session secrets from `secrets_file`.
///
/// # Errors
///
/// Returns an error if the file cannot be read or does not hold a valid
/// session.
fn load_session(secrets_file: &str) -> remoteslave::error::Result<Session> {
    let session = Session::from_file(secrets_file);

    if let Err(ref e) = session {
        if e.kind == ErrorKind::NotFound {
            info!("read the documentation on how to set up {secrets_file}");
        }
    }

    session
}

/// Builds a remote client from the command line and the secrets file.
fn load_client(args: &Args) -> Result<remote::Client, Box<dyn Error>> {
    let session = load_session(&args.secrets_file)?;

    let mut config = Config::with_session(session)?;
    config.api_url = Url::parse(&args.api_url)?;
    config.secure_pubsub = args.secure;
    config.sink = args.sink;
    config.fetch_command = config::split_command(&args.fetch_command);
    config.play_command = config::split_command(&args.play_command);

    let client = remote::Client::new(&config)?;
    Ok(client)
}

/// Main application loop.
///
/// Restarts the remote client when it ends with a transient error, and
/// with fresh secrets on SIGHUP.
///
/// # Errors
///
/// Returns an error when the configuration cannot be loaded or the client
/// fails with an error that restarting will not resolve.
async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let mut signals = signal::Handler::new()?;

    let mut client = load_client(&args)?;

    // Restart after sleeping some duration to prevent accidental denial of
    // service attacks on the catalog. The initial connection happens
    // immediately.
    let restart_timer = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(restart_timer);

    loop {
        tokio::select! {
            // Prioritize shutdown signals.
            biased;

            signal = signals.recv() => {
                info!("received {signal}");
                if signal.is_exit() {
                    info!("shutting down gracefully");
                    break Ok(());
                }

                // The running session, and with it its stream, is dropped
                // by now.
                match load_client(&args) {
                    Ok(reloaded) => {
                        client = reloaded;
                        info!("reloaded {}", args.secrets_file);
                    }
                    Err(e) => error!("keeping previous secrets: {e}"),
                }
                restart_timer.as_mut().reset(tokio::time::Instant::now());
            }

            result = client.start(), if restart_timer.is_elapsed() => {
                match result {
                    Ok(evicted) => {
                        info!("evicted by {}; exiting", evicted.by);
                        break Ok(());
                    }
                    Err(e) if e.is_transient() => error!("{e}"),
                    Err(e) => break Err(e.into()),
                }

                // Sleep with jitter to prevent thundering herds. Subsecond
                // precision further prevents that by spreading requests
                // when users are launching this from some crontab.
                let duration = Duration::from_millis(fastrand::u64(5_000..6_000));
                info!("restarting in {:.1}s", duration.as_secs_f32());
                restart_timer.as_mut().reset(tokio::time::Instant::now() + duration);
            }

            () = &mut restart_timer, if !restart_timer.is_elapsed() => {}
        }
    }
}

/// Main entry point of the application.
#[tokio::main]
async fn main() {
    // `clap` handles our command line arguments and help text.
    let args = Args::parse();
    init_logger(&args);

    // Dump command line arguments before we do anything more.
    // This aids in debugging of whatever comes next.
    debug!("Command {:#?}", args);

    let cmd = command!();
    let name = cmd.get_name().to_string();
    let version = cmd.get_version().unwrap_or("UNKNOWN").to_string();

    info!("starting {name}/{version}; {BUILD_PROFILE}");

    if let Err(e) = run(args).await {
        error!("{e}");
        process::exit(1);
    }
}
