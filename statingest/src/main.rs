//! Entrypoint of the statingest binary

use dotenvy::dotenv;
use statingest_clap_blocks::tokio::TokioIoConfig;

mod commands {
    pub(crate) mod serve;
    pub(crate) mod write;
}

enum ReturnCode {
    Failure = 1,
}

#[derive(Debug, clap::Parser)]
#[clap(
    name = "statingest",
    version,
    about = "Time-series ingestion server with incremental rollups",
    long_about = r#"Time-series ingestion server with incremental rollups

Examples:
    # Run the server on the default port
    statingest serve

    # Only accept minute and hour points, with debug logging
    statingest serve -vv --resolutions minute,hour

    # Submit one point to a running server
    statingest write --series test --resolution minute --measurement antall=2
"#
)]
struct Config {
    #[clap(flatten)]
    runtime_config: TokioIoConfig,

    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, clap::Parser)]
enum Command {
    /// Run the ingestion server
    Serve(commands::serve::Config),

    /// Submit one point to a running server
    Write(commands::write::Config),
}

fn main() -> Result<(), std::io::Error> {
    // load all environment variables from .env before doing anything
    load_dotenv();

    let config: Config = clap::Parser::parse();

    let tokio_runtime = config.runtime_config.builder()?.build()?;

    tokio_runtime.block_on(async move {
        match config.command {
            None => println!("command required, -h/--help for help"),
            Some(Command::Serve(config)) => {
                if let Err(e) = config.logging_config.install_global_subscriber() {
                    eprintln!("Initializing logs failed: {e}");
                    std::process::exit(ReturnCode::Failure as _);
                }
                if let Err(e) = commands::serve::command(config).await {
                    eprintln!("Serve command failed: {e}");
                    std::process::exit(ReturnCode::Failure as _)
                }
            }
            Some(Command::Write(config)) => {
                if let Err(e) = commands::write::command(config).await {
                    eprintln!("Write command failed: {e:#}");
                    std::process::exit(ReturnCode::Failure as _)
                }
            }
        }
    });

    Ok(())
}

/// Source the .env file before initialising the Config struct.
///
/// Existing environment variables take precedence.
fn load_dotenv() {
    match dotenv() {
        Ok(_) => {}
        Err(dotenvy::Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            // a missing .env file is fine, defaults apply
        }
        Err(e) => {
            eprintln!("FATAL Error loading config from: {e}");
            eprintln!("Aborting");
            std::process::exit(ReturnCode::Failure as _);
        }
    };
}
