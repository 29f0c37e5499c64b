use std::sync::Arc;
use tether::client::Client;
use tether::domain_model::*;
use tether::logger::*;
use tether::settings::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::Notify;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let logger = Logger::new_bootstrap();

    let project_settings = parse_settings(cli.settings.as_deref())?;
    info!(?project_settings);
    let logger_config = LogConfig {
        filter: project_settings.log.filter.clone(),
    };
    logger.reload_from_config(&logger_config)?;

    let client = Client::try_new(&project_settings)?;

    match (cli.access_token, cli.refresh_token) {
        (Some(access_token), Some(refresh_token)) => {
            let role = if cli.manager { Role::Manager } else { Role::User };
            client.login(TokenPair::new(access_token, refresh_token), role)?;
        }
        _ if client.session().is_authenticated() => info!("resuming stored session"),
        _ => {
            return Err(anyhow::anyhow!(
                "no stored session, pass --access-token and --refresh-token"
            ));
        }
    }

    let expired = Arc::new(Notify::new());
    let expired_notify = expired.clone();
    client.on_session_expired(move |event| {
        error!(attempt = event.attempt, "session expired: {}", event.reason);
        expired_notify.notify_one();
    });

    let conversation = ConversationId::from(cli.conversation.as_str());
    let subscription = client.subscribe_to_conversation(&conversation, |message| {
        match message.get("content").and_then(|c| c.as_str()) {
            Some(content) => println!("> {content}"),
            None => println!("> {message}"),
        }
    });
    info!(%conversation, topic = subscription.topic(), "joined conversation, type to send");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => {
                    if let Err(e) = client.publish_to_conversation(&conversation, line.trim()).await {
                        warn!("message not sent: {e}");
                    }
                }
                None => break,
            },
            _ = expired.notified() => {
                client.logout()?;
                break;
            }
            _ = signal::ctrl_c() => break,
        }
    }

    subscription.unsubscribe();
    let shutdown_timeout = std::time::Duration::from_secs(5);
    match tokio::time::timeout(shutdown_timeout, client.shutdown()).await {
        Ok(_) => info!("client shutdown successfully"),
        Err(_) => error!("client shutdown timed out"),
    }

    Ok(())
}
