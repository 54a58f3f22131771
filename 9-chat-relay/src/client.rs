use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
    select,
};
use tracing::{debug, info, warn};

use crate::{
    cli::ConnectArgs,
    message::{LineReader, write_line},
};

/// Copies stdin lines to the relay and relay lines to stdout.
///
/// When stdin ends the write half is shut down and everything the relay
/// still sends is printed until it closes the connection.
pub async fn run(args: ConnectArgs) -> Result<()> {
    let stream = TcpStream::connect(&args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;
    info!("connected to {}", args.server);

    let (reader, mut writer) = stream.into_split();
    let mut server = LineReader::new(BufReader::new(reader));
    let mut stdin = LineReader::new(BufReader::new(io::stdin()));

    run_client_loop(&mut server, &mut writer, &mut stdin).await
}

async fn run_client_loop<S, W, I>(
    server: &mut LineReader<S>,
    writer: &mut W,
    stdin: &mut LineReader<I>,
) -> Result<()>
where
    S: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    I: AsyncBufRead + Unpin,
{
    let mut stdin_open = true;

    loop {
        select! {
            server_line = server.next_line() => {
                match server_line.context("failed to read from relay")? {
                    Some(line) => write_stdout(&line).await?,
                    None => {
                        debug!("relay closed the connection");
                        break;
                    }
                }
            }
            input = stdin.next_line(), if stdin_open => {
                match input.context("failed to read stdin")? {
                    Some(text) => write_line(writer, &text)
                        .await
                        .context("failed to send line to relay")?,
                    None => {
                        stdin_open = false;
                        shutdown_connection(writer).await;
                    }
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }

    Ok(())
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection<W>(writer: &mut W)
where
    W: AsyncWrite + Unpin,
{
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shut down connection cleanly");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
