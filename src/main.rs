use std::sync::Arc;

use gavel::discord::SerenityOperations;
use gavel::moderation::SchedulerRequest;
use gavel::{BotConfig, CONSOLE_TARGET, Data, Error, commands, handlers, logging};
use poise::serenity_prelude::{self as serenity, GatewayIntents, GuildId};
use tracing::{error, info};

/// Prefix for prefix commands, looked up per guild
async fn dynamic_prefix(ctx: poise::PartialContext<'_, Data, Error>) -> Result<Option<String>, Error> {
    let prefix = ctx.data.prefix(ctx.guild_id.map(GuildId::get)).await?;
    Ok(Some(prefix))
}

/// Main function to run the bot
async fn async_main() -> Result<(), Error> {
    logging::init()?;

    let config = BotConfig::load().await?;
    let token = BotConfig::discord_token()?;

    let http = Arc::new(serenity::Http::new(&token));
    let data = Data::new(config, Arc::new(SerenityOperations::new(http)));
    let _listener = data.start_background_tasks().await?;

    let framework_data = data.clone();
    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: commands::all(),
            prefix_options: poise::PrefixFrameworkOptions {
                dynamic_prefix: Some(|ctx| Box::pin(dynamic_prefix(ctx))),
                mention_as_prefix: true,
                ..Default::default()
            },
            command_check: Some(|ctx| Box::pin(commands::command_check(ctx))),
            pre_command: |ctx| {
                Box::pin(async move {
                    logging::log_command_start(ctx);
                })
            },
            post_command: |ctx| {
                Box::pin(async move {
                    logging::log_command_end(ctx);
                })
            },
            on_error: |error| Box::pin(commands::on_error(error)),
            ..Default::default()
        })
        .setup(|ctx, _ready, framework| {
            Box::pin(async move {
                logging::log_console("Registering commands");
                poise::builtins::register_globally(ctx, &framework.options().commands).await?;
                Ok(framework_data)
            })
        })
        .build();

    let intents = GatewayIntents::non_privileged()
        | GatewayIntents::MESSAGE_CONTENT
        | GatewayIntents::GUILD_MEMBERS;
    let mut client = serenity::ClientBuilder::new(&token, intents)
        .event_handler(handlers::Handler::new(data.clone()))
        .framework(framework)
        .await?;

    let shard_manager = Arc::clone(&client.shard_manager);
    let scheduler = Arc::clone(&data.scheduler);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(target: CONSOLE_TARGET, error = %e, "Failed to listen for shutdown signal");
            return;
        }
        info!(target: CONSOLE_TARGET, "Shutting down");
        if let Err(e) = scheduler.notify(SchedulerRequest::Shutdown).await {
            error!(target: CONSOLE_TARGET, error = %e, "Failed to stop the scheduler");
        }
        shard_manager.shutdown_all().await;
    });

    info!(target: CONSOLE_TARGET, "Starting bot...");
    client.start().await?;

    Ok(())
}

fn main() {
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Error: failed to start the runtime: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = runtime.block_on(async_main()) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}
