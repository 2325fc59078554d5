//! Text command console.
//!
//! Commands arrive as newline-terminated lines on a text stream, parsed as
//! whitespace-separated tokens: the first token is the command name, the
//! rest are its arguments. The built-in `help` and `exit` commands act on
//! the server directly; every parsed command is also forwarded to the
//! module's `on_command` hook.

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::server::ServerControl;

/// One parsed console command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Command {
    raw: String,
    name: String,
    args: Vec<String>,
}

impl Command {
    /// Parses a raw line into name and arguments.
    pub fn parse(line: &str) -> Command {
        let raw = line.trim().to_string();
        let mut tokens = raw.split_whitespace().map(str::to_string);
        let name = tokens.next().unwrap_or_default();
        Command {
            name,
            args: tokens.collect(),
            raw,
        }
    }

    /// The command name (first token).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The arguments after the name.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Argument by index.
    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }

    /// The trimmed input line.
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

/// Reads newline-terminated commands from `reader`, invoking `handle` for
/// every non-empty parsed line until the stream ends or `handle` returns
/// false.
pub async fn pump_commands<R, F>(mut reader: R, mut handle: F)
where
    R: AsyncBufRead + Unpin,
    F: FnMut(Command) -> bool,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {
                let cmd = Command::parse(&line);
                if cmd.name().is_empty() {
                    continue;
                }
                if !handle(cmd) {
                    return;
                }
            }
        }
    }
}

/// Applies the commands every server understands: `help` prints the
/// command summary, `exit` stops the server.
pub fn handle_builtin(cmd: &Command, control: &ServerControl) {
    match cmd.name() {
        "help" => {
            println!("{:<12} show this message", "help");
            println!("{:<12} terminate server", "exit");
        }
        "exit" => control.set_active(false),
        _ => {}
    }
}
