use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;

use crate::config::RuntimeConfig;
use crate::error::format_cli_error;
use crate::request::{FinalAnswer, Provenance};
use crate::workflow::AnswerWorkflow;
use crate::telemetry::TelemetrySink;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Exit,
    Status,
    Help,
    Trail,
    Intent(Option<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedChatCommand {
    NotACommand,
    Command(ChatCommand),
    UnknownCommand(String),
}

pub fn parse_chat_command(input: &str) -> ParsedChatCommand {
    let trimmed = input.trim();

    if ["exit", "quit", "q", "/exit", "/quit"]
        .iter()
        .any(|word| trimmed.eq_ignore_ascii_case(word))
    {
        return ParsedChatCommand::Command(ChatCommand::Exit);
    }

    if !trimmed.starts_with('/') {
        return ParsedChatCommand::NotACommand;
    }

    let slashless = trimmed.trim_start_matches('/');
    if slashless.is_empty() {
        return ParsedChatCommand::UnknownCommand("/".to_string());
    }

    let mut parts = slashless.splitn(2, char::is_whitespace);
    let command = parts
        .next()
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    let arg = parts.next().map(str::trim).unwrap_or_default();

    match command.as_str() {
        "status" => ParsedChatCommand::Command(ChatCommand::Status),
        "help" => ParsedChatCommand::Command(ChatCommand::Help),
        "trail" => ParsedChatCommand::Command(ChatCommand::Trail),
        "intent" => {
            if arg.is_empty() || arg.eq_ignore_ascii_case("auto") {
                ParsedChatCommand::Command(ChatCommand::Intent(None))
            } else {
                ParsedChatCommand::Command(ChatCommand::Intent(Some(arg.to_string())))
            }
        }
        other => ParsedChatCommand::UnknownCommand(format!("/{other}")),
    }
}

pub fn print_chat_help() {
    println!("Chat commands:");
    println!("- /help: show command quick reference");
    println!("- /status: show active profile, search backend and policy");
    println!("- /intent <label>: skip classification and use this intent (auto to reset)");
    println!("- /trail: show the attempt trail of the last answer");
    println!("- /exit (or exit, quit, q): end interactive mode");
}

pub fn render_attempt_trail(answer: &FinalAnswer) -> String {
    if answer.attempts.is_empty() {
        return "  <no retrieval attempts>".to_string();
    }
    answer
        .audit_trail()
        .iter()
        .map(|attempt| {
            format!(
                "  #{} score={:.1} query='{}'",
                attempt.attempt_index, attempt.score, attempt.query_used
            )
        })
        .collect::<Vec<String>>()
        .join("\n")
}

/// Text rendering used by `ask` and interactive mode.
pub fn render_final_answer(answer: &FinalAnswer) -> String {
    let mut rendered = format!(
        "{}\n\n[{} | confidence {:.1}/10 | intent {} | attempts {}]",
        answer.answer_text.trim_end(),
        answer.provenance.label(),
        answer.confidence,
        answer.intent,
        answer.attempts.len()
    );
    if answer.provenance == Provenance::Escalated
        && let Some(reason) = answer.escalation_reason.as_deref()
    {
        rendered.push_str(&format!("\n[escalation: {reason}]"));
    }
    rendered
}

fn print_chat_status(cfg: &RuntimeConfig, workflow: &AnswerWorkflow, intent: Option<&str>) {
    let policy = workflow.policy();
    println!(
        "Profile: {} | search: {:?} | reformulation: {:?}",
        cfg.profile, cfg.search_backend, cfg.reformulation
    );
    println!(
        "Policy: acceptance_floor={:.1} usable_partial_floor={:.1} max_attempts={}",
        policy.acceptance_floor(),
        policy.usable_partial_floor(),
        policy.max_attempts()
    );
    println!("Intent override: {}", intent.unwrap_or("auto"));
}

pub async fn run_chat(
    cfg: &RuntimeConfig,
    workflow: Arc<AnswerWorkflow>,
    initial_intent: Option<String>,
    telemetry: &TelemetrySink,
) -> Result<()> {
    let mut intent = initial_intent;
    let mut last_answer: Option<FinalAnswer> = None;

    telemetry.emit(
        "chat.started",
        json!({
            "profile": cfg.profile.clone(),
            "intent": intent.clone(),
        }),
    );
    println!("Interactive mode started. Type /help for commands or exit to quit.");

    let stdin = io::stdin();
    let mut line = String::new();

    loop {
        print!("evalrag> ");
        io::stdout().flush().context("failed to flush stdout")?;
        line.clear();
        let read = stdin
            .read_line(&mut line)
            .context("failed to read input from stdin")?;
        if read == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        match parse_chat_command(input) {
            ParsedChatCommand::NotACommand => {}
            ParsedChatCommand::UnknownCommand(command) => {
                println!("Unknown command '{command}'. Use /help.");
                continue;
            }
            ParsedChatCommand::Command(command) => {
                match command {
                    ChatCommand::Exit => break,
                    ChatCommand::Help => print_chat_help(),
                    ChatCommand::Status => print_chat_status(cfg, &workflow, intent.as_deref()),
                    ChatCommand::Trail => match last_answer.as_ref() {
                        Some(answer) => println!("{}", render_attempt_trail(answer)),
                        None => println!("No answer yet."),
                    },
                    ChatCommand::Intent(next) => {
                        println!("Intent override: {}", next.as_deref().unwrap_or("auto"));
                        intent = next;
                    }
                }
                continue;
            }
        }

        match workflow.answer(input, intent.as_deref()).await {
            Ok(answer) => {
                println!("{}", render_final_answer(&answer));
                last_answer = Some(answer);
            }
            Err(err) => eprintln!("{}", format_cli_error(&err, cfg.show_sensitive_config)),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_words_end_the_session() {
        for word in ["exit", "QUIT", "q", "/exit"] {
            assert_eq!(
                parse_chat_command(word),
                ParsedChatCommand::Command(ChatCommand::Exit)
            );
        }
        assert_eq!(
            parse_chat_command("quite a question"),
            ParsedChatCommand::NotACommand
        );
    }

    #[test]
    fn intent_command_sets_and_resets_override() {
        assert_eq!(
            parse_chat_command("/intent dosage"),
            ParsedChatCommand::Command(ChatCommand::Intent(Some("dosage".to_string())))
        );
        assert_eq!(
            parse_chat_command("/intent auto"),
            ParsedChatCommand::Command(ChatCommand::Intent(None))
        );
        assert_eq!(
            parse_chat_command("/frobnicate"),
            ParsedChatCommand::UnknownCommand("/frobnicate".to_string())
        );
    }
}
