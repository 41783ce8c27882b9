//! rpad-cli — headless participant for a collaborative pad.
//!
//! Joins a document, prints what the other participants do and appends
//! every line typed on stdin. Lines starting with `:` are commands:
//! `:lang <name>`, `:name <name>` and `:quit`.

use clap::Parser;
use log::{info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};

use rpad_collab::editor::{local_changes, BufferEditor, EditorAdapter};
use rpad_collab::protocol::UserInfo;
use rpad_collab::session::{Session, SessionEvent};
use rpad_collab::SessionConfig;

#[derive(Parser, Debug)]
#[command(name = "rpad-cli")]
#[command(about = "Join a collaborative pad from the terminal")]
#[command(version)]
struct Cli {
    /// Server origin, e.g. https://pad.example.com
    #[arg(long)]
    server: String,
    /// Document id
    #[arg(long)]
    document: String,
    /// Display name shown to other participants
    #[arg(long, default_value = "Anonymous")]
    name: String,
    /// Cursor hue in degrees (random if omitted)
    #[arg(long)]
    hue: Option<u32>,
}

#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Append(&'a str),
    Language(&'a str),
    Name(&'a str),
    Quit,
}

fn parse_command(line: &str) -> Command<'_> {
    let Some(command) = line.strip_prefix(':') else {
        return Command::Append(line);
    };
    let (verb, arg) = command.split_once(' ').unwrap_or((command, ""));
    match (verb, arg.trim()) {
        ("quit" | "q", _) => Command::Quit,
        ("lang", language) if !language.is_empty() => Command::Language(language),
        ("name", name) if !name.is_empty() => Command::Name(name),
        _ => Command::Append(line),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let mut identity = match cli.hue {
        Some(hue) => UserInfo::new(cli.name, hue),
        None => UserInfo::with_random_hue(cli.name),
    };
    let config = SessionConfig::for_document(&cli.server, &cli.document);
    info!("Joining {}", config.uri);

    let (reporter, changes) = local_changes();
    let (mut session, mut events) = Session::new(config, BufferEditor::new(reporter), changes);
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut shown = String::new();

    loop {
        tokio::select! {
            alive = session.step() => {
                if !alive {
                    break;
                }
            }
            Some(event) = events.recv() => match event {
                SessionEvent::Connected => {
                    println!("* connected");
                    // The server forgets identities between connections.
                    session.set_info(identity.clone());
                }
                SessionEvent::Disconnected => println!("* disconnected, retrying"),
                SessionEvent::Desynchronized => {
                    println!("* lost sync with the server, rejoin to continue");
                }
                SessionEvent::ChangeLanguage(language) => println!("* language: {language}"),
                SessionEvent::ChangeUsers(users) => {
                    let names: Vec<&str> = users.values().map(|u| u.name.as_str()).collect();
                    println!("* online: {}", names.join(", "));
                }
                SessionEvent::ChangeCursors(_) => {}
                SessionEvent::LocalEditsDropped => {
                    println!("* unsent edits were discarded after reconnecting");
                }
            },
            line = stdin.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Failed to read stdin: {e}");
                        break;
                    }
                };
                match parse_command(&line) {
                    Command::Quit => break,
                    Command::Language(language) => {
                        if !session.set_language(language) {
                            println!("* not connected, language unchanged");
                        }
                    }
                    Command::Name(name) => {
                        identity.name = name.to_owned();
                        session.set_info(identity.clone());
                    }
                    Command::Append(text) => {
                        let text = format!("{text}\n");
                        if let Err(e) = session.editor_mut().append(&text) {
                            warn!("Edit rejected: {e}");
                        }
                    }
                }
            }
        }

        let text = session.editor().text();
        if text != shown {
            println!("----\n{text}----");
            shown = text;
        }
    }

    session.dispose();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_line_is_appended() {
        assert_eq!(parse_command("hello"), Command::Append("hello"));
        assert_eq!(parse_command(""), Command::Append(""));
    }

    #[test]
    fn test_commands() {
        assert_eq!(parse_command(":quit"), Command::Quit);
        assert_eq!(parse_command(":q"), Command::Quit);
        assert_eq!(parse_command(":lang rust"), Command::Language("rust"));
        assert_eq!(parse_command(":name  Ada "), Command::Name("Ada"));
    }

    #[test]
    fn test_incomplete_command_is_text() {
        assert_eq!(parse_command(":lang"), Command::Append(":lang"));
        assert_eq!(parse_command(":unknown x"), Command::Append(":unknown x"));
    }

    #[test]
    fn test_cli_args() {
        let cli = Cli::parse_from(["rpad-cli", "--server", "http://localhost:3030", "--document", "abc"]);
        assert_eq!(cli.name, "Anonymous");
        assert_eq!(cli.hue, None);
    }
}
