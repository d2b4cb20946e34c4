//! Line-based console: read a command, run it, print the outcome.

use crate::command::{self, Outcome};
use crate::errors::Error;
use crate::repl::history::History;
use crate::storage::Table;
use crossterm::execute;
use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};
use std::io::{self, BufRead, Write};
use std::path::Path;
use tracing::{info, warn};
use uuid::Uuid;

const NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

const BANNER: &str = r#"Commands: insert <id> <name> <email>, select, find <id>, delete <id>,
update <id> <name> <email>, range <lo> <hi>, validate, btree, help, exit."#;

/// Runs the REPL against one database file until `exit` or EOF, then
/// closes the table cleanly.
pub fn start(db_path: &Path) -> Result<(), Error> {
    let session_id = Uuid::new_v4();
    info!(session_id = %session_id, db = %db_path.display(), "starting REPL session");

    let mut table = Table::open(db_path)?;
    let mut history = History::open(History::default_location());
    if !history.is_empty() {
        info!(lines = history.len(), "loaded command history");
    }

    println!("Welcome to the {} {} REPL.", NAME, VERSION);
    println!("{}", BANNER);

    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        print!("{}> ", NAME);
        io::stdout().flush()?;
        line.clear();
        if stdin.lock().read_line(&mut line)? == 0 {
            // EOF closes as cleanly as `exit`.
            println!();
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if let Err(e) = history.push(input) {
            warn!(error = %e, "failed to append history");
        }
        match command::parse(input).and_then(|c| command::execute(&mut table, c)) {
            Ok(Outcome::Exit) => break,
            Ok(Outcome::Message(message)) => println!("{}", message),
            Ok(Outcome::Rows(rows)) => {
                if rows.is_empty() {
                    println!("No rows found.");
                }
                for row in &rows {
                    println!("{}", row);
                }
            }
            Err(e) => echo_error(&e.to_string()),
        }
    }

    table.close()?;
    info!(session_id = %session_id, "REPL session closed");
    println!("Bye");
    Ok(())
}

fn echo_error(message: &str) {
    let styled = execute!(
        io::stdout(),
        SetForegroundColor(Color::Red),
        Print(message),
        Print("\n"),
        ResetColor,
    );
    if styled.is_err() {
        println!("{}", message);
    }
}
