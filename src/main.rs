use std::io::{Read, Write};

use anyhow::Context;
use futures_util::StreamExt;

use quill::config::Config;
use quill::{CompletionRequest, Coordinator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    dotenvy::dotenv().ok();

    let config = Config::load();
    let coordinator = Coordinator::from_config(&config)?;

    // Prompt comes from the first argument, or stdin when absent.
    let prompt = match std::env::args().nth(1) {
        Some(prompt) => prompt,
        None => {
            let mut prompt = String::new();
            std::io::stdin()
                .read_to_string(&mut prompt)
                .context("failed to read prompt from stdin")?;
            prompt
        }
    };

    let mut generation = coordinator
        .start(CompletionRequest::new(prompt, config.sampling.clone()))
        .await?;
    let context = generation.context().clone();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut stdout = std::io::stdout();
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                coordinator.cancel(&context).await;
                break;
            }
            next = generation.next() => match next {
                Some(Ok(chunk)) => {
                    stdout.write_all(chunk.content.as_bytes())?;
                    stdout.flush()?;
                }
                Some(Err(e)) => {
                    tracing::error!("generation failed: {e}");
                    anyhow::bail!(e.user_message());
                }
                None => break,
            }
        }
    }

    writeln!(stdout)?;
    let tokens = coordinator.preflight().current();
    tracing::info!(state = ?coordinator.state(), tokens, "done");
    Ok(())
}
