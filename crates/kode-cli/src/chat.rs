//! Interactive chat mode with readline support.

use std::io::{self, Stdout};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use rustyline::error::ReadlineError;
use rustyline::history::FileHistory;
use rustyline::{Config, Editor};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::warn;

use kode_core::{MemoryType, StoreEvent};

use crate::render::Renderer;
use crate::runner::{AgentRunner, SendOutcome};

/// Chat commands
#[derive(Debug, PartialEq, Eq)]
enum ChatCommand {
    Quit,
    Clear,
    Reset,
    History,
    Help,
    Tools,
    None(String), // Regular message
}

fn parse_command(input: &str) -> ChatCommand {
    let trimmed = input.trim();

    if trimmed.is_empty() {
        return ChatCommand::None(String::new());
    }

    if !trimmed.starts_with('/') {
        return ChatCommand::None(input.to_string());
    }

    let cmd = trimmed
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_lowercase();

    match cmd.as_str() {
        "/quit" | "/exit" | "/q" => ChatCommand::Quit,
        "/clear" | "/c" => ChatCommand::Clear,
        "/reset" => ChatCommand::Reset,
        "/history" | "/h" => ChatCommand::History,
        "/help" | "/?" => ChatCommand::Help,
        "/tools" | "/t" => ChatCommand::Tools,
        _ => {
            eprintln!("Unknown command: {}. Type /help for available commands.", cmd);
            ChatCommand::None(String::new())
        }
    }
}

fn print_help() {
    println!(
        r#"
Chat Commands:
  /help, /?      Show this help message
  /quit, /exit   Exit chat mode
  /clear, /c     Clear the conversation and start a new session
  /reset         Start a new session, keeping the conversation
  /history, /h   Show input history
  /tools, /t     List available tools

Input:
  !<command>     Run a shell command
  #<note>        Save a memory note

Tips:
  - Press Ctrl+C to cancel the current response or command
  - Press Ctrl+D to exit
  - Up/Down arrows navigate history
"#
    );
}

/// Send one input and render the store until the turn ends.
///
/// Ctrl+C aborts the turn (and any shell command) without leaving the loop.
pub async fn run_turn(
    runner: &AgentRunner,
    renderer: &mut Renderer<Stdout>,
    input: &str,
) -> Result<SendOutcome> {
    let mut events = runner.store().subscribe();
    let turn = runner.send_message(input, &[]);
    tokio::pin!(turn);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    let outcome = loop {
        tokio::select! {
            biased;
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                runner.abort_message();
                renderer.finish()?;
                println!("^C");
            }
            event = events.recv() => match event {
                Ok(StoreEvent::Messages(snapshot)) => renderer.render(&snapshot)?,
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Renderer lagged behind store events");
                    renderer.render(&runner.store().messages())?;
                }
                Err(RecvError::Closed) => {}
            },
            outcome = &mut turn => break outcome,
        }
    };

    loop {
        match events.try_recv() {
            Ok(StoreEvent::Messages(snapshot)) => renderer.render(&snapshot)?,
            Ok(_) => {}
            Err(TryRecvError::Lagged(_)) => renderer.render(&runner.store().messages())?,
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
        }
    }
    renderer.finish()?;

    Ok(outcome?)
}

fn ask_memory_type(rl: &mut Editor<(), FileHistory>) -> Option<MemoryType> {
    match rl.readline("save to (p)roject or (u)ser memory? ") {
        Ok(answer) => match answer.trim().to_lowercase().as_str() {
            "p" | "project" => Some(MemoryType::Project),
            "u" | "user" => Some(MemoryType::User),
            _ => None,
        },
        Err(_) => None,
    }
}

/// Run interactive chat mode
pub async fn run_chat(runner: Arc<AgentRunner>) -> Result<()> {
    // Set up readline with history
    let config = Config::builder()
        .history_ignore_space(true)
        .history_ignore_dups(true)?
        .build();

    let history_path = get_history_path();
    let mut rl: Editor<(), FileHistory> = Editor::with_config(config)?;

    // Load history if available
    if let Some(path) = &history_path {
        let _ = rl.load_history(path);
    }

    let mut renderer = Renderer::new(io::stdout());
    renderer.mark_seen(&runner.store().messages());

    println!("Chat mode started. Type /help for commands, /quit to exit.\n");

    loop {
        match rl.readline("you> ") {
            Ok(line) => {
                // Add to readline history
                let _ = rl.add_history_entry(&line);

                match parse_command(&line) {
                    ChatCommand::Quit => {
                        println!("Goodbye!");
                        break;
                    }
                    ChatCommand::Clear => {
                        runner.store().clear_messages();
                        renderer.mark_seen(&[]);
                        println!("Conversation cleared.\n");
                    }
                    ChatCommand::Reset => {
                        runner.store().reset_session();
                        println!("New session {}.\n", runner.store().session_id());
                    }
                    ChatCommand::History => {
                        let history = runner.store().input_history();
                        if history.is_empty() {
                            println!("No input history.\n");
                        } else {
                            for (i, entry) in history.iter().enumerate() {
                                println!("{:>4}  {}", i + 1, entry);
                            }
                            println!();
                        }
                    }
                    ChatCommand::Help => {
                        print_help();
                    }
                    ChatCommand::Tools => {
                        let names = runner.tool_names();
                        if names.is_empty() {
                            println!("No tools registered.\n");
                        } else {
                            println!("\nAvailable tools:");
                            for name in names {
                                println!("  {}", name);
                            }
                            println!();
                        }
                    }
                    ChatCommand::None(text) => {
                        if text.trim().is_empty() {
                            continue;
                        }

                        match run_turn(&runner, &mut renderer, &text).await {
                            Ok(SendOutcome::MemoryPending(note)) => {
                                match ask_memory_type(&mut rl) {
                                    Some(memory_type) => {
                                        runner.save_memory(&note, memory_type);
                                        renderer.render(&runner.store().messages())?;
                                    }
                                    None => println!("Memory discarded.\n"),
                                }
                            }
                            Ok(_) => println!(),
                            Err(e) => eprintln!("\nError: {}\n", e),
                        }
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("Goodbye!");
                break;
            }
            Err(e) => {
                eprintln!("Error reading input: {}", e);
                break;
            }
        }
    }

    // Save history
    if let Some(path) = &history_path {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let _ = rl.save_history(path);
    }

    Ok(())
}

fn get_history_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("kode").join("chat_history"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse_command("/quit"), ChatCommand::Quit);
        assert_eq!(parse_command("/EXIT"), ChatCommand::Quit);
        assert_eq!(parse_command("/clear"), ChatCommand::Clear);
        assert_eq!(parse_command("/reset"), ChatCommand::Reset);
        assert_eq!(parse_command("/h"), ChatCommand::History);
        assert_eq!(parse_command("/tools"), ChatCommand::Tools);
        assert_eq!(parse_command("/?"), ChatCommand::Help);
    }

    #[test]
    fn test_regular_input_passes_through() {
        assert_eq!(
            parse_command("!ls -la"),
            ChatCommand::None("!ls -la".to_string())
        );
        assert_eq!(
            parse_command("# prefer tabs"),
            ChatCommand::None("# prefer tabs".to_string())
        );
        assert_eq!(parse_command("   "), ChatCommand::None(String::new()));
    }

    #[test]
    fn test_unknown_command_is_ignored() {
        assert_eq!(parse_command("/bogus"), ChatCommand::None(String::new()));
    }
}
