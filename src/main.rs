use anyhow::{Context, Result};

use clap::Parser;
use config::ClientConfigModule;
use log::{info, error};
use session::Session;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::{wrappers::LinesStream, StreamExt};

mod api;
mod capture;
mod config;
mod feed;
mod session;
mod workflow;

#[derive(Parser, Debug)]
struct CommandLineFlags {
    #[arg(long, short)]
    pub config_path: String,
}

/// One line of user input.
#[derive(Debug, PartialEq)]
enum UserCommand<'a> {
    Capture,
    Interrupt,
    Status,
    Quit,
    Generate(&'a str),
}

impl<'a> UserCommand<'a> {
    fn parse(line: &'a str) -> Self {
        match line.trim() {
            ":capture" => UserCommand::Capture,
            ":interrupt" => UserCommand::Interrupt,
            ":status" => UserCommand::Status,
            ":quit" => UserCommand::Quit,
            // The prompt is passed on untrimmed; the workflow patcher normalizes it.
            _ => UserCommand::Generate(line),
        }
    }
}

async fn handle_command(session: &Session, command: UserCommand<'_>) -> Result<()> {
    match command {
        UserCommand::Capture => {
            // The upload finishes (or logs its failure) on its own.
            session.capture().await.context("capture failed")?;
            Ok(())
        }
        UserCommand::Interrupt => session.interrupt().await,
        UserCommand::Status => {
            let view = session.view().await;
            let image = match &view.image {
                Some(feed::DisplayedImage::Preview(_)) => "captured preview".to_string(),
                Some(feed::DisplayedImage::Remote(url)) => url.to_string(),
                None => "none".to_string(),
            };
            info!("{} | image: {} | input: {:?}", view.generate_label(), image, session.last_upload().await);
            Ok(())
        }
        UserCommand::Generate(prompt) => {
            session.generate(prompt).await?;
            Ok(())
        }
        // The prompt loop stops on its own.
        UserCommand::Quit => Ok(()),
    }
}

/// Reads commands from stdin until it closes or the user quits.
async fn prompt_loop(session: Session) -> Result<()> {
    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    while let Some(line) = lines.next().await {
        let line = line.context("failed to read stdin")?;
        let command = UserCommand::parse(&line);
        if command == UserCommand::Quit {
            break;
        }
        // Errors are logged, and the loop carries on.
        if let Err(e) = handle_command(&session, command).await {
            error!("Error: {:#}", e);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    env_logger::init();
    let args = CommandLineFlags::parse();

    // Immediately crash on panic.
    std::panic::set_hook(Box::new(|panic_info| {
        error!("Panic: {:?}", panic_info);
        std::process::exit(1);
    }));

    // Initialize context.
    let config = ClientConfigModule::new(args.config_path).context("failed to initialize config")?;
    config
        .with_config(|c| info!("Loaded config: {:?}", c))
        .await;

    let session = Session::new(config).await.context("failed to start session")?;
    info!("Type a prompt to generate; :capture, :interrupt, :status, :quit");

    // The feed only reports; the prompt loop decides when we're done.
    let feed = session.spawn_feed();
    let result = prompt_loop(session.clone()).await;
    feed.abort();
    result
}
