//! dirsync client
//!
//! Connects to a dirsyncd and runs LIST / DIFF / PULL / LEAVE, either from
//! the command line or from an interactive prompt.

use anyhow::{Context, Result};
use clap::Parser;
use std::io::{self, BufRead, Write};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use dirsync::cli::{init_tracing, ClientOpts};
use dirsync::net_async::client::Client;

type TcpClient = Client<OwnedReadHalf, OwnedWriteHalf>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    List,
    Diff,
    Pull,
    Leave,
}

fn parse_command(input: &str) -> Option<Command> {
    match input.trim().to_ascii_uppercase().as_str() {
        "LIST" => Some(Command::List),
        "DIFF" => Some(Command::Diff),
        "PULL" => Some(Command::Pull),
        "LEAVE" => Some(Command::Leave),
        _ => None,
    }
}

fn main() -> Result<()> {
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted by user. Exiting (Ctrl-C)...");
        // Exit immediately with 130 (128 + SIGINT)
        std::process::exit(130);
    })
    .context("Error setting Ctrl-C handler")?;

    let opts = ClientOpts::parse();
    init_tracing(opts.verbose);
    let config = opts.sync_config()?;

    std::fs::create_dir_all(&opts.dir)
        .with_context(|| format!("create local directory {}", opts.dir.display()))?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    let client = rt
        .block_on(Client::connect(&opts.server, opts.dir.clone(), config))
        .with_context(|| format!("connect to {}", opts.server))?
        .with_progress(opts.progress);
    println!("Connected to {}", opts.server);

    let mut scripted = opts.commands.clone().into_iter();
    let interactive = opts.commands.is_empty();
    session_loop(&rt, client, || {
        if interactive {
            prompt()
        } else {
            Ok(scripted.next())
        }
    })
}

fn prompt() -> Result<Option<String>> {
    print!("Enter command (LIST, DIFF, PULL, LEAVE): ");
    io::stdout().flush()?;
    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line))
}

/// Runs commands until LEAVE or until input runs out (treated as LEAVE).
fn session_loop<F>(rt: &tokio::runtime::Runtime, mut client: TcpClient, mut next: F) -> Result<()>
where
    F: FnMut() -> Result<Option<String>>,
{
    loop {
        let line = next()?.unwrap_or_else(|| "LEAVE".to_string());
        let Some(cmd) = parse_command(&line) else {
            println!("Invalid command.");
            continue;
        };
        if cmd == Command::Leave {
            rt.block_on(client.leave())?;
            println!("Disconnected.");
            return Ok(());
        }
        if let Err(e) = rt.block_on(run_command(&mut client, cmd)) {
            if e.is_fatal() {
                return Err(e).context("connection to server lost");
            }
            eprintln!("{} failed: {}", line.trim(), e);
        }
    }
}

async fn run_command(client: &mut TcpClient, cmd: Command) -> dirsync::Result<()> {
    match cmd {
        Command::List => {
            let names = client.list().await?;
            println!("Files on the server:");
            for name in names {
                println!("  {}", name);
            }
        }
        Command::Diff => {
            let report = client.diff().await?;
            if client.missing().is_empty() {
                println!("The client has every file on the server.");
            } else {
                println!("Files on the server but not on the client:");
                for name in client.missing().iter() {
                    println!("  {}", name);
                }
            }
            if report.capacity_exceeded() {
                println!(
                    "Missing-file cache is full ({} entries); {} more not recorded:",
                    client.missing().capacity(),
                    report.dropped.len()
                );
                for name in &report.dropped {
                    println!("  {}", name);
                }
            }
        }
        Command::Pull => {
            if client.missing().is_empty() {
                println!("Nothing to pull. Run DIFF first.");
                return Ok(());
            }
            let report = client.pull().await?;
            for (name, bytes) in &report.fetched {
                println!("  received {} ({} bytes)", name, bytes);
            }
            for name in &report.not_found {
                println!("  {} is no longer on the server", name);
            }
            for (name, why) in &report.failed {
                println!("  {} failed: {}", name, why);
            }
            if !report.skipped.is_empty() {
                println!("  {} files not requested after an error", report.skipped.len());
            }
            println!(
                "Pulled {} of {} files into {}",
                report.fetched.len(),
                report.fetched.len() + report.not_found.len() + report.failed.len() + report.skipped.len(),
                client.root().display()
            );
        }
        Command::Leave => {}
    }
    Ok(())
}
