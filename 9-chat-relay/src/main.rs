use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use chat_relay::{
    cli::{Cli, Command},
    client,
    config::RelayConfig,
    relay::Relay,
};

fn init_tracing(command: &Command) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter).with_target(false);
    // The client prints the conversation on stdout, so its own logs go to stderr.
    let _ = match command {
        Command::Serve(_) => builder.try_init(),
        Command::Connect(_) => builder.with_writer(std::io::stderr).try_init(),
    };
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.command);

    match cli.command {
        Command::Serve(args) => {
            let config = RelayConfig::from_args(&args)?;
            let relay = Relay::bind(args.listen.as_str(), config).await?;
            let addr = relay.local_addr()?;
            info!("relay listening on {}", addr);
            if let Err(err) = relay.run_until_ctrl_c().await {
                warn!("relay exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Connect(args) => client::run(args).await?,
    }

    Ok(())
}
