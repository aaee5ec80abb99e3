use std::io::{IsTerminal, Read, Write};

use anyhow::{Context, bail};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use usellm_ai::{ChatClient, ClientConfig, StreamError, WireFormat};
use usellm_chat::{build_chat_body, parse_args, print_help};
use usellm_core::types::{ChatStreamUpdate, StreamEnd};

const APP_NAME: &str = "usellm-chat";

fn read_piped_stdin() -> Result<Option<String>, std::io::Error> {
    let stdin = std::io::stdin();
    if stdin.is_terminal() {
        return Ok(None);
    }

    let mut content = String::new();
    stdin.lock().read_to_string(&mut content)?;
    let trimmed = content.trim();
    if trimmed.is_empty() {
        Ok(None)
    } else {
        Ok(Some(trimmed.to_string()))
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run() -> anyhow::Result<()> {
    let raw_args = std::env::args().skip(1).collect::<Vec<_>>();
    let args = parse_args(&raw_args);

    if args.help {
        print_help(APP_NAME);
        return Ok(());
    }
    if args.version {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let mut prompt = args.prompt();
    if let Some(piped) = read_piped_stdin().context("Failed to read stdin")? {
        prompt = if prompt.is_empty() {
            piped
        } else {
            format!("{prompt}\n\n{piped}")
        };
    }
    if prompt.is_empty() {
        print_help(APP_NAME);
        bail!("No message given");
    }

    let mut config = ClientConfig::from_env();
    if let Some(key) = &args.api_key {
        config = config.with_api_key(key.clone());
    }
    if let Some(url) = &args.base_url {
        config = config.with_base_url(url.clone());
    }
    if args.raw {
        config = config.with_wire_format(WireFormat::RawText);
    }
    let client = ChatClient::new(config);

    let cancel = CancellationToken::new();
    let ctrl_c_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_token.cancel();
        }
    });

    let body = build_chat_body(&args, &prompt);
    let mut printed = 0;
    let mut on_update = |update: &ChatStreamUpdate| {
        let content = &update.message.content;
        if content.len() > printed {
            let mut stdout = std::io::stdout().lock();
            let _ = stdout.write_all(content[printed..].as_bytes());
            let _ = stdout.flush();
            printed = content.len();
        }
    };

    match client.stream_chat(&body, Some(&mut on_update), &cancel).await {
        Ok(result) => {
            println!();
            if result.end == StreamEnd::SourceClosed && !args.raw {
                tracing::warn!("Stream ended without [DONE]; output may be truncated");
            }
            Ok(())
        }
        Err(StreamError::Aborted) => {
            println!();
            eprintln!("Aborted");
            Ok(())
        }
        Err(e) => {
            println!();
            Err(e.into())
        }
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
