//! Interactive operator menu.
//!
//! Runs on the control thread. Everything here blocks freely; network work
//! goes through the [`Relay`] facade, which routes it to the network context.

use crate::config::Config;
use crate::relay::{CorrespondentId, DispatchError, Relay, ReloadOutcome};
use crate::util::{clip_line, tail};
use anyhow::Result;
use console::style;
use dialoguer::{Input, Password, Select};
use std::collections::BTreeMap;

/// Why the menu loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Quit,
    /// A new token was saved; the running connection still uses the old one.
    TokenChanged,
}

const ACTIONS: [&str; 6] = [
    "List conversations",
    "Open conversation",
    "New conversation",
    "Reload full history",
    "Change token",
    "Exit",
];

const PREVIEW_CHARS: usize = 60;

pub fn run(relay: &Relay, config: &mut Config) -> Result<SessionEnd> {
    loop {
        relay.drain();
        println!();
        println!("{}", header(&relay.get_status(), relay.get_unread_count()));

        let choice = Select::new()
            .with_prompt("  Choose an action")
            .items(&ACTIONS)
            .default(0)
            .interact()?;

        match choice {
            0 => list_conversations(relay),
            1 => open_conversation(relay, config.relay.display_lines)?,
            2 => new_conversation(relay)?,
            3 => reload(relay),
            4 => {
                if change_token(config)? {
                    return Ok(SessionEnd::TokenChanged);
                }
            }
            _ => return Ok(SessionEnd::Quit),
        }
    }
}

fn list_conversations(relay: &Relay) {
    let counts = relay.list_conversations();
    for line in conversation_lines(&counts) {
        println!("  {line}");
    }
}

fn open_conversation(relay: &Relay, display_lines: usize) -> Result<()> {
    let counts = relay.list_conversations();
    if counts.is_empty() {
        println!("  {} No conversations yet", style("→").dim());
        return Ok(());
    }

    let ids: Vec<CorrespondentId> = counts.keys().copied().collect();
    let items = conversation_lines(&counts);
    let picked = Select::new()
        .with_prompt("  Conversation")
        .items(&items)
        .default(0)
        .interact()?;
    let who = ids[picked];

    let log = relay.get_conversation(who);
    println!();
    println!("  {}", style(format!("Conversation with {who}")).white().bold());
    for line in tail(&log, display_lines) {
        println!("  {line}");
    }
    println!();

    let reply: String = Input::new()
        .with_prompt("  Reply (empty to go back)")
        .allow_empty(true)
        .interact_text()?;
    if !reply.trim().is_empty() {
        println!("  {}", describe_send(&relay.send_to(who, reply.trim())));
    }
    Ok(())
}

fn new_conversation(relay: &Relay) -> Result<()> {
    let raw: String = Input::new()
        .with_prompt("  Recipient user id")
        .interact_text()?;
    let Some(who) = parse_correspondent(&raw) else {
        println!("  {} '{}' is not a user id", style("❌").red().bold(), raw.trim());
        return Ok(());
    };

    let text: String = Input::new()
        .with_prompt("  Message (empty to cancel)")
        .allow_empty(true)
        .interact_text()?;
    if text.trim().is_empty() {
        println!("  {} Cancelled", style("→").dim());
        return Ok(());
    }
    println!("  {}", describe_send(&relay.send_to(who, text.trim())));
    Ok(())
}

fn reload(relay: &Relay) {
    println!("  {} Reloading history...", style("⏳").dim());
    println!("  {}", describe_reload(&relay.trigger_reload()));
}

/// Returns `false` when nothing was entered and the menu should carry on.
fn change_token(config: &mut Config) -> Result<bool> {
    let token: String = Password::new()
        .with_prompt("  New bot token")
        .interact()?;
    if !apply_token(config, &token)? {
        println!("  {} No token entered", style("→").dim());
        return Ok(false);
    }
    println!(
        "  {} Token saved. Restart dmrelay to connect with it.",
        style("✓").green().bold()
    );
    Ok(true)
}

/// Store a trimmed token and save the config. Blank input changes nothing.
fn apply_token(config: &mut Config, raw: &str) -> Result<bool> {
    let token = raw.trim();
    if token.is_empty() {
        return Ok(false);
    }
    config.token = Some(token.to_string());
    config.save()?;
    Ok(true)
}

fn header(status: &str, unread: usize) -> String {
    format!(
        "  {} {}  {}",
        style("dmrelay").white().bold(),
        style(status).dim(),
        if unread > 0 {
            style(format!("[{unread} unread]")).yellow().bold()
        } else {
            style("[no unread]".to_string()).dim()
        }
    )
}

fn conversation_lines(counts: &BTreeMap<CorrespondentId, usize>) -> Vec<String> {
    if counts.is_empty() {
        return vec!["No conversations yet".to_string()];
    }
    counts
        .iter()
        .map(|(who, n)| {
            let noun = if *n == 1 { "message" } else { "messages" };
            clip_line(&format!("{who} ({n} {noun})"), PREVIEW_CHARS)
        })
        .collect()
}

fn parse_correspondent(raw: &str) -> Option<CorrespondentId> {
    raw.parse().ok()
}

fn describe_send(outcome: &Result<(), DispatchError>) -> String {
    match outcome {
        Ok(()) => format!("{} Sent", style("✅").green().bold()),
        Err(e) if e.is_timeout() => format!(
            "{} Timed out; the message may still be delivered. Not retried.",
            style("⏳").yellow().bold()
        ),
        Err(e) => format!("{} Send failed: {e}", style("❌").red().bold()),
    }
}

fn describe_reload(outcome: &ReloadOutcome) -> String {
    match outcome {
        ReloadOutcome::AlreadyRunning => {
            format!("{} A reload is already running", style("⚠").yellow().bold())
        }
        ReloadOutcome::Completed(summary) => {
            let mut text = format!(
                "{} Updated {} of {} conversations, drained {}",
                style("✓").green().bold(),
                summary.updated_count(),
                summary.targets,
                summary.drained
            );
            if !summary.failed.is_empty() {
                text.push_str(&format!(", {} failed", summary.failed.len()));
            }
            if !summary.timed_out.is_empty() {
                text.push_str(&format!(", {} timed out", summary.timed_out.len()));
            }
            text
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::MessengerError;
    use crate::relay::ReloadSummary;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config_in(tmp: &TempDir) -> Config {
        Config {
            config_path: tmp.path().join("config.toml"),
            data_dir: tmp.path().join("data"),
            token: Some("old-token".into()),
            ..Config::default()
        }
    }

    fn plain(s: &str) -> String {
        console::strip_ansi_codes(s).into_owned()
    }

    #[test]
    fn header_shows_status_and_unread() {
        let text = plain(&header("Connected as relay#1", 3));
        assert!(text.contains("Connected as relay#1"));
        assert!(text.contains("[3 unread]"));
        assert!(plain(&header("Not connected", 0)).contains("[no unread]"));
    }

    #[test]
    fn conversation_lines_pluralize_counts() {
        let mut counts = BTreeMap::new();
        counts.insert(CorrespondentId(100), 1);
        counts.insert(CorrespondentId(200), 4);
        assert_eq!(
            conversation_lines(&counts),
            vec!["100 (1 message)", "200 (4 messages)"]
        );
        assert_eq!(
            conversation_lines(&BTreeMap::new()),
            vec!["No conversations yet"]
        );
    }

    #[test]
    fn parse_correspondent_rejects_garbage() {
        assert_eq!(
            parse_correspondent(" 80351110224678912 "),
            Some(CorrespondentId(80_351_110_224_678_912))
        );
        assert_eq!(parse_correspondent("alice"), None);
        assert_eq!(parse_correspondent(""), None);
    }

    #[test]
    fn send_outcomes_are_distinct() {
        assert!(plain(&describe_send(&Ok(()))).contains("Sent"));

        let timeout = describe_send(&Err(DispatchError::Timeout(Duration::from_secs(15))));
        assert!(plain(&timeout).contains("may still be delivered"));

        let failed = describe_send(&Err(DispatchError::Messenger(
            MessengerError::Permission("cannot DM this user".into()),
        )));
        assert!(plain(&failed).contains("Send failed: permission denied"));
    }

    #[test]
    fn reload_outcomes_describe_summary() {
        assert!(plain(&describe_reload(&ReloadOutcome::AlreadyRunning)).contains("already running"));

        let summary = ReloadSummary {
            targets: 3,
            updated: vec![CorrespondentId(1)],
            failed: vec![CorrespondentId(2)],
            timed_out: vec![CorrespondentId(3)],
            drained: 2,
        };
        let text = plain(&describe_reload(&ReloadOutcome::Completed(summary)));
        assert_eq!(
            text,
            "✓ Updated 1 of 3 conversations, drained 2, 1 failed, 1 timed out"
        );
    }

    #[test]
    fn blank_token_keeps_the_current_one() {
        let tmp = TempDir::new().unwrap();
        let mut config = config_in(&tmp);

        assert!(!apply_token(&mut config, "   \t ").unwrap());
        assert_eq!(config.token(), Some("old-token"));
        assert!(!config.config_path.exists());
    }

    #[test]
    fn new_token_is_trimmed_and_saved() {
        let tmp = TempDir::new().unwrap();
        let mut config = config_in(&tmp);

        assert!(apply_token(&mut config, "  fresh-token \n").unwrap());
        assert_eq!(config.token.as_deref(), Some("fresh-token"));
        let saved = std::fs::read_to_string(&config.config_path).unwrap();
        assert!(saved.contains("fresh-token"));
    }
}
