use crate::moderation::action::{DAY, HOUR, MINUTE, SECOND, YEAR};
use crate::moderation::{
    ActionData, ActionOptions, Entry, ModerationError, TypeVariation, format_duration,
};
use crate::settings::{
    GuildSettings, SettingsError, SettingsStore, find_key, helpers, read_settings, schema,
    with_settings_transaction,
};
use crate::{Context, Data, Error, logging};
use poise::serenity_prelude as serenity;
use poise::{FrameworkError, command};
use tracing::error;

/// Reply for errors that are not the user's fault
const GENERIC_FAILURE: &str = "Something went wrong while running this command.";

/// Every command the bot registers
#[must_use]
pub fn all() -> Vec<poise::Command<Data, Error>> {
    vec![
        ping(),
        ban(),
        unban(),
        kick(),
        softban(),
        mute(),
        unmute(),
        timeout(),
        warn(),
        restrict(),
        unrestrict(),
        archive(),
        prefix(),
        conf(),
    ]
}

/// Parse a duration such as `30m`, `1h30m` or `2w` into milliseconds
#[must_use]
pub fn parse_duration(input: &str) -> Option<u64> {
    let input = input.trim().to_ascii_lowercase();
    if input.is_empty() {
        return None;
    }

    let mut total: u64 = 0;
    let mut digits = String::new();
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }

        let mut unit = c.to_string();
        while let Some(next) = chars.peek().filter(|next| next.is_ascii_alphabetic()) {
            unit.push(*next);
            chars.next();
        }
        let factor = match unit.as_str() {
            "ms" => 1,
            "s" | "sec" | "secs" => SECOND,
            "m" | "min" | "mins" => MINUTE,
            "h" | "hr" | "hrs" => HOUR,
            "d" | "day" | "days" => DAY,
            "w" | "week" | "weeks" => 7 * DAY,
            "y" | "year" | "years" => YEAR,
            _ => return None,
        };
        let amount: u64 = digits.parse().ok()?;
        digits.clear();
        total = total.checked_add(amount.checked_mul(factor)?)?;
    }

    // A trailing number without a unit is not a duration
    if !digits.is_empty() {
        return None;
    }
    Some(total)
}

/// Split prefix arguments into a duration and a reason.
///
/// Prefix parsing hands the first word to the duration slot even when it is
/// part of the reason, so a word that is not a duration moves back.
#[must_use]
pub fn duration_and_reason(duration: Option<String>, reason: Option<String>) -> (Option<u64>, Option<String>) {
    match duration {
        None => (None, reason),
        Some(word) => match parse_duration(&word) {
            Some(ms) => (Some(ms), reason),
            None => {
                let reason = match reason {
                    Some(rest) => format!("{word} {rest}"),
                    None => word,
                };
                (None, Some(reason))
            }
        },
    }
}

/// Whether a command may run in a channel under the guild's settings
#[must_use]
pub fn is_command_allowed(settings: &GuildSettings, command: &str, channel_id: u64) -> bool {
    let disabled = settings.get(schema::DISABLED_COMMANDS);
    let is_disabled = disabled.as_list().is_some_and(|names| {
        names
            .iter()
            .filter_map(|name| name.as_str())
            .any(|name| name.eq_ignore_ascii_case(command))
    });
    let ignored = settings.get(schema::CHANNELS_IGNORE_ALL);
    let is_ignored = ignored
        .as_list()
        .is_some_and(|channels| channels.iter().any(|id| id.as_snowflake() == Some(channel_id)));
    !is_disabled && !is_ignored
}

/// Framework check applying `disabled-commands` and `channels.ignore-all`
///
/// # Errors
/// Returns an error if the guild settings cannot be loaded.
pub async fn command_check(ctx: Context<'_>) -> Result<bool, Error> {
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(true);
    };
    // conf has to stay reachable to undo a mistake
    if ctx.command().qualified_name.starts_with("conf") {
        return Ok(true);
    }
    let settings = read_settings(&ctx.data().settings, guild_id.get()).await?;
    Ok(is_command_allowed(
        &settings,
        &ctx.command().name,
        ctx.channel_id().get(),
    ))
}

/// Message shown to the invoker for a failed command
#[must_use]
pub fn user_message(error: &Error) -> String {
    if let Some(error) = error.downcast_ref::<ModerationError>() {
        if error.is_user_facing() {
            return error.to_string();
        }
    } else if let Some(error) = error.downcast_ref::<SettingsError>() {
        if error.is_user_facing() {
            return error.to_string();
        }
    }
    GENERIC_FAILURE.to_string()
}

/// Framework error handler: log, then tell the user what went wrong
pub async fn on_error(error: FrameworkError<'_, Data, Error>) {
    logging::log_command_error(&error);
    match error {
        FrameworkError::Command { error, ctx, .. } => {
            if let Err(e) = ctx.say(user_message(&error)).await {
                error!(target: crate::ERROR_TARGET, error = %e, "Failed to send error reply");
            }
        }
        other => {
            if let Err(e) = poise::builtins::on_error(other).await {
                error!(target: crate::ERROR_TARGET, error = %e, "Failed to handle framework error");
            }
        }
    }
}

/// Run an action against `user` in the invoking guild
async fn moderate(
    ctx: Context<'_>,
    kind: TypeVariation,
    user: &serenity::User,
    duration: Option<u64>,
    reason: Option<String>,
    undo: bool,
) -> Result<Entry, Error> {
    let guild_id = ctx.guild_id().ok_or("This command only works in servers")?;
    let data = ctx.data();
    let cached_name = ctx.guild().map(|guild| guild.name.clone());
    let guild_name = match cached_name {
        Some(name) => name,
        None => data.ops.guild_name(guild_id.get()).await?,
    };

    let action = data.actions.get(kind)?;
    let action_ctx = data.action_context(guild_id.get(), guild_name);
    let options = ActionOptions {
        user_id: user.id.get(),
        moderator_id: Some(ctx.author().id.get()),
        reason,
        duration: if undo {
            None
        } else {
            action.config().validate_duration(duration)?
        },
        case_id: None,
    };
    let action_data = ActionData {
        send_direct_message: true,
        moderator: Some(ctx.author().name.clone()),
    };

    let entry = if undo {
        action.undo(&action_ctx, options, &action_data).await?
    } else {
        action.apply(&action_ctx, options, &action_data).await?
    };
    Ok(entry)
}

async fn reply_case(ctx: Context<'_>, verb: &str, user: &serenity::User, entry: &Entry) -> Result<(), Error> {
    let content = match entry.duration {
        Some(duration) => format!(
            "{verb} **{}** | Case #{} | {}",
            user.tag(),
            entry.id,
            format_duration(duration)
        ),
        None => format!("{verb} **{}** | Case #{}", user.tag(), entry.id),
    };
    ctx.say(content).await?;
    Ok(())
}

/// Basic ping command
/// This command is used to check if the bot is responsive.
#[command(prefix_command, slash_command, guild_only)]
pub async fn ping(ctx: Context<'_>) -> Result<(), Error> {
    ctx.say("Pong!").await?;
    Ok(())
}

/// Ban a user, optionally for a limited time
#[command(prefix_command, slash_command, guild_only, required_permissions = "BAN_MEMBERS", category = "Moderation")]
pub async fn ban(
    ctx: Context<'_>,
    #[description = "User to ban"] user: serenity::User,
    #[description = "Duration, such as 7d"] duration: Option<String>,
    #[description = "Reason"]
    #[rest]
    reason: Option<String>,
) -> Result<(), Error> {
    let (duration, reason) = duration_and_reason(duration, reason);
    let entry = moderate(ctx, TypeVariation::Ban, &user, duration, reason, false).await?;
    reply_case(ctx, "Banned", &user, &entry).await
}

/// Lift a ban
#[command(prefix_command, slash_command, guild_only, required_permissions = "BAN_MEMBERS", category = "Moderation")]
pub async fn unban(
    ctx: Context<'_>,
    #[description = "User to unban"] user: serenity::User,
    #[description = "Reason"]
    #[rest]
    reason: Option<String>,
) -> Result<(), Error> {
    let entry = moderate(ctx, TypeVariation::Ban, &user, None, reason, true).await?;
    reply_case(ctx, "Unbanned", &user, &entry).await
}

/// Kick a member
#[command(prefix_command, slash_command, guild_only, required_permissions = "KICK_MEMBERS", category = "Moderation")]
pub async fn kick(
    ctx: Context<'_>,
    #[description = "Member to kick"] user: serenity::User,
    #[description = "Reason"]
    #[rest]
    reason: Option<String>,
) -> Result<(), Error> {
    let entry = moderate(ctx, TypeVariation::Kick, &user, None, reason, false).await?;
    reply_case(ctx, "Kicked", &user, &entry).await
}

/// Ban and immediately unban a member to clear their recent messages
#[command(prefix_command, slash_command, guild_only, required_permissions = "BAN_MEMBERS", category = "Moderation")]
pub async fn softban(
    ctx: Context<'_>,
    #[description = "Member to soft ban"] user: serenity::User,
    #[description = "Reason"]
    #[rest]
    reason: Option<String>,
) -> Result<(), Error> {
    let entry = moderate(ctx, TypeVariation::SoftBan, &user, None, reason, false).await?;
    reply_case(ctx, "Soft banned", &user, &entry).await
}

/// Give a member the muted role
#[command(prefix_command, slash_command, guild_only, required_permissions = "MANAGE_ROLES", category = "Moderation")]
pub async fn mute(
    ctx: Context<'_>,
    #[description = "Member to mute"] user: serenity::User,
    #[description = "Duration, such as 1h"] duration: Option<String>,
    #[description = "Reason"]
    #[rest]
    reason: Option<String>,
) -> Result<(), Error> {
    let (duration, reason) = duration_and_reason(duration, reason);
    let entry = moderate(ctx, TypeVariation::Mute, &user, duration, reason, false).await?;
    reply_case(ctx, "Muted", &user, &entry).await
}

/// Remove the muted role
#[command(prefix_command, slash_command, guild_only, required_permissions = "MANAGE_ROLES", category = "Moderation")]
pub async fn unmute(
    ctx: Context<'_>,
    #[description = "Member to unmute"] user: serenity::User,
    #[description = "Reason"]
    #[rest]
    reason: Option<String>,
) -> Result<(), Error> {
    let entry = moderate(ctx, TypeVariation::Mute, &user, None, reason, true).await?;
    reply_case(ctx, "Unmuted", &user, &entry).await
}

/// Time a member out, or lift their timeout with `0`
#[command(prefix_command, slash_command, guild_only, required_permissions = "MODERATE_MEMBERS", category = "Moderation")]
pub async fn timeout(
    ctx: Context<'_>,
    #[description = "Member to time out"] user: serenity::User,
    #[description = "Duration, such as 10m, or 0 to lift"] duration: String,
    #[description = "Reason"]
    #[rest]
    reason: Option<String>,
) -> Result<(), Error> {
    if duration.trim() == "0" {
        let entry = moderate(ctx, TypeVariation::Timeout, &user, None, reason, true).await?;
        return reply_case(ctx, "Lifted the timeout of", &user, &entry).await;
    }
    let milliseconds = parse_duration(&duration)
        .ok_or_else(|| ModerationError::InvalidDuration(format!("`{duration}` is not a duration")))?;
    let entry = moderate(ctx, TypeVariation::Timeout, &user, Some(milliseconds), reason, false).await?;
    reply_case(ctx, "Timed out", &user, &entry).await
}

/// Warn a member
#[command(prefix_command, slash_command, guild_only, required_permissions = "MODERATE_MEMBERS", category = "Moderation")]
pub async fn warn(
    ctx: Context<'_>,
    #[description = "Member to warn"] user: serenity::User,
    #[description = "Duration, such as 30d"] duration: Option<String>,
    #[description = "Reason"]
    #[rest]
    reason: Option<String>,
) -> Result<(), Error> {
    let (duration, reason) = duration_and_reason(duration, reason);
    let entry = moderate(ctx, TypeVariation::Warning, &user, duration, reason, false).await?;
    reply_case(ctx, "Warned", &user, &entry).await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, poise::ChoiceParameter)]
pub enum Restriction {
    Attachment,
    Embed,
    Emoji,
    Reaction,
    Text,
    Voice,
}

impl From<Restriction> for TypeVariation {
    fn from(restriction: Restriction) -> Self {
        match restriction {
            Restriction::Attachment => Self::RestrictedAttachment,
            Restriction::Embed => Self::RestrictedEmbed,
            Restriction::Emoji => Self::RestrictedEmoji,
            Restriction::Reaction => Self::RestrictedReaction,
            Restriction::Text => Self::RestrictedText,
            Restriction::Voice => Self::RestrictedVoice,
        }
    }
}

/// Restrict what a member can do
#[command(prefix_command, slash_command, guild_only, required_permissions = "MANAGE_ROLES", category = "Moderation")]
pub async fn restrict(
    ctx: Context<'_>,
    #[description = "Member to restrict"] user: serenity::User,
    #[description = "What to restrict"] restriction: Restriction,
    #[description = "Duration, such as 1d"] duration: Option<String>,
    #[description = "Reason"]
    #[rest]
    reason: Option<String>,
) -> Result<(), Error> {
    let (duration, reason) = duration_and_reason(duration, reason);
    let kind = TypeVariation::from(restriction);
    let entry = moderate(ctx, kind, &user, duration, reason, false).await?;
    reply_case(ctx, &format!("Applied {kind} to"), &user, &entry).await
}

/// Lift a restriction
#[command(prefix_command, slash_command, guild_only, required_permissions = "MANAGE_ROLES", category = "Moderation")]
pub async fn unrestrict(
    ctx: Context<'_>,
    #[description = "Member to unrestrict"] user: serenity::User,
    #[description = "What to lift"] restriction: Restriction,
    #[description = "Reason"]
    #[rest]
    reason: Option<String>,
) -> Result<(), Error> {
    let kind = TypeVariation::from(restriction);
    let entry = moderate(ctx, kind, &user, None, reason, true).await?;
    reply_case(ctx, &format!("Lifted {kind} from"), &user, &entry).await
}

/// Close a case so it no longer expires or counts as active
#[command(prefix_command, slash_command, guild_only, required_permissions = "MANAGE_GUILD", category = "Moderation")]
pub async fn archive(
    ctx: Context<'_>,
    #[description = "Case number"] case: u64,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("This command only works in servers")?;
    let entry = ctx.data().moderation.get(guild_id.get()).archive(case).await?;
    ctx.say(format!("Archived case #{} ({})", entry.id, entry.kind))
        .await?;
    Ok(())
}

/// Show or change the command prefix
#[command(prefix_command, slash_command, guild_only, required_permissions = "MANAGE_GUILD", category = "Settings")]
pub async fn prefix(
    ctx: Context<'_>,
    #[description = "New prefix"] new_prefix: Option<String>,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("This command only works in servers")?;
    let data = ctx.data();

    let Some(new_prefix) = new_prefix else {
        let current = data.prefix(Some(guild_id.get())).await?;
        ctx.say(format!("The prefix is `{current}`")).await?;
        return Ok(());
    };

    let shown = set_setting(&data.settings, guild_id.get(), schema::PREFIX, &new_prefix).await?;
    ctx.say(format!("The prefix is now {shown}")).await?;
    Ok(())
}

/// Stage `helpers::set` in a transaction and return the stored value for display
///
/// # Errors
/// Returns the key lookup, validation or persistence failure.
pub async fn set_setting(store: &SettingsStore, guild_id: u64, key: &str, input: &str) -> Result<String, SettingsError> {
    let key = find_key(key)?;
    let input = input.to_string();
    with_settings_transaction(store, guild_id, move |transaction| {
        Box::pin(async move {
            let update = helpers::set(transaction.settings(), key, &input)?;
            transaction.write(update);
            Ok(key.stringify(&transaction.settings().get(key.name)))
        })
    })
    .await
}

/// Stage `helpers::remove` in a transaction and return the remaining value for display
///
/// # Errors
/// Returns the key lookup, validation or persistence failure.
pub async fn remove_setting(store: &SettingsStore, guild_id: u64, key: &str, input: &str) -> Result<String, SettingsError> {
    let key = find_key(key)?;
    let input = input.to_string();
    with_settings_transaction(store, guild_id, move |transaction| {
        Box::pin(async move {
            let update = helpers::remove(transaction.settings(), key, &input)?;
            transaction.write(update);
            Ok(key.stringify(&transaction.settings().get(key.name)))
        })
    })
    .await
}

/// Restore a key to its default and return the default for display
///
/// # Errors
/// Returns the key lookup or persistence failure.
pub async fn reset_setting(store: &SettingsStore, guild_id: u64, key: &str) -> Result<String, SettingsError> {
    let key = find_key(key)?;
    with_settings_transaction(store, guild_id, move |transaction| {
        Box::pin(async move {
            transaction.write(helpers::reset(key));
            Ok(key.stringify(&key.default_value()))
        })
    })
    .await
}

/// Render one key, or every key that was changed from its default
///
/// # Errors
/// Returns an unknown key or a load failure.
pub async fn show_settings(store: &SettingsStore, guild_id: u64, key: Option<&str>) -> Result<String, SettingsError> {
    let settings = read_settings(store, guild_id).await?;
    if let Some(name) = key {
        let key = find_key(name)?;
        return Ok(format!("{}: {}", key.name, key.stringify(&settings.get(key.name))));
    }

    let lines: Vec<String> = settings
        .iter()
        .filter_map(|(name, value)| {
            find_key(name)
                .ok()
                .map(|key| format!("{}: {}", key.name, key.stringify(value)))
        })
        .collect();
    if lines.is_empty() {
        return Ok("Every setting has its default value.".to_string());
    }
    Ok(lines.join("\n"))
}

/// View and change server settings
#[command(
    prefix_command,
    slash_command,
    guild_only,
    required_permissions = "MANAGE_GUILD",
    category = "Settings",
    subcommands("conf_show", "conf_set", "conf_remove", "conf_reset"),
    subcommand_required
)]
pub async fn conf(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Show settings
#[command(prefix_command, slash_command, guild_only, rename = "show")]
pub async fn conf_show(
    ctx: Context<'_>,
    #[description = "Setting key"] key: Option<String>,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("This command only works in servers")?;
    let shown = show_settings(&ctx.data().settings, guild_id.get(), key.as_deref()).await?;
    ctx.say(shown).await?;
    Ok(())
}

/// Set a setting, or add to a list setting
#[command(prefix_command, slash_command, guild_only, rename = "set")]
pub async fn conf_set(
    ctx: Context<'_>,
    #[description = "Setting key"] key: String,
    #[description = "Value"]
    #[rest]
    value: String,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("This command only works in servers")?;
    let shown = set_setting(&ctx.data().settings, guild_id.get(), &key, &value).await?;
    ctx.say(format!("Updated {key}: {shown}")).await?;
    Ok(())
}

/// Remove a value from a list setting
#[command(prefix_command, slash_command, guild_only, rename = "remove")]
pub async fn conf_remove(
    ctx: Context<'_>,
    #[description = "Setting key"] key: String,
    #[description = "Value"]
    #[rest]
    value: String,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("This command only works in servers")?;
    let shown = remove_setting(&ctx.data().settings, guild_id.get(), &key, &value).await?;
    ctx.say(format!("Updated {key}: {shown}")).await?;
    Ok(())
}

/// Reset a setting to its default
#[command(prefix_command, slash_command, guild_only, rename = "reset")]
pub async fn conf_reset(
    ctx: Context<'_>,
    #[description = "Setting key"] key: String,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("This command only works in servers")?;
    let shown = reset_setting(&ctx.data().settings, guild_id.get(), &key).await?;
    ctx.say(format!("Reset {key}: {shown}")).await?;
    Ok(())
}
