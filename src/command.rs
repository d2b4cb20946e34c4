//! Textual command parsing and execution.
//!
//! One line of input maps to one [`Command`]; execution talks to the
//! storage layer only through the [`Table`] surface.

use crate::errors::Error;
use crate::storage::{Row, Table};
use once_cell::sync::Lazy;
use regex::Regex;

/// Argument tail of `insert`/`update`: id, username, email.
static ROW_ARGS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)\s+(\S+)\s+(\S+)$").expect("row argument pattern"));

#[derive(Debug)]
pub enum Command {
    Insert(Row),
    Select,
    Find(u32),
    Delete(u32),
    Update(Row),
    Range(u32, u32),
    Validate,
    Btree,
    Help,
    Exit,
}

/// What the console should do with a completed command.
#[derive(Debug)]
pub enum Outcome {
    Message(String),
    Rows(Vec<Row>),
    Exit,
}

pub fn parse(line: &str) -> Result<Command, Error> {
    let line = line.trim();
    let (verb, tail) = match line.split_once(char::is_whitespace) {
        Some((verb, tail)) => (verb, tail.trim()),
        None => (line, ""),
    };
    match verb.to_ascii_lowercase().as_str() {
        "" => Err(err!(Syntax, "Empty command.")),
        "insert" => Ok(Command::Insert(parse_row(tail)?)),
        "update" => Ok(Command::Update(parse_row(tail)?)),
        "select" => Ok(Command::Select),
        "find" => Ok(Command::Find(parse_key(tail)?)),
        "delete" => Ok(Command::Delete(parse_key(tail)?)),
        "range" => {
            let (low, high) = parse_bounds(tail)?;
            Ok(Command::Range(low, high))
        }
        "validate" => Ok(Command::Validate),
        "btree" => Ok(Command::Btree),
        "help" | "?" => Ok(Command::Help),
        "exit" | "quit" => Ok(Command::Exit),
        other => Err(err!(
            Syntax,
            "Unrecognized command '{}'. Type 'help' for the command list.",
            other
        )),
    }
}

pub fn execute(table: &mut Table, command: Command) -> Result<Outcome, Error> {
    match command {
        Command::Insert(row) => {
            let id = row.id;
            table.insert(&row)?;
            Ok(Outcome::Message(format!("Inserted {}.", id)))
        }
        Command::Select => {
            let rows = table.select_all()?.collect::<Result<Vec<_>, _>>()?;
            Ok(Outcome::Rows(rows))
        }
        Command::Find(key) => Ok(Outcome::Rows(vec![table.find(key)?])),
        Command::Delete(key) => {
            table.delete(key)?;
            Ok(Outcome::Message(format!("Deleted {}.", key)))
        }
        Command::Update(row) => {
            let id = row.id;
            table.update(&row)?;
            Ok(Outcome::Message(format!("Updated {}.", id)))
        }
        Command::Range(low, high) => {
            let rows = table.range(low, high)?.collect::<Result<Vec<_>, _>>()?;
            Ok(Outcome::Rows(rows))
        }
        Command::Validate => {
            table.validate()?;
            Ok(Outcome::Message("Tree and freelist are consistent.".into()))
        }
        Command::Btree => Ok(Outcome::Message(table.dump_tree()?)),
        Command::Help => Ok(Outcome::Message(HELP.trim_end().into())),
        Command::Exit => Ok(Outcome::Exit),
    }
}

const HELP: &str = "\
insert <id> <username> <email>   add a record (fails on duplicate id)
select                           list every record in key order
find <id>                        look one record up
delete <id>                      remove a record
update <id> <username> <email>   replace a record's fields
range <lo> <hi>                  records with lo <= id <= hi
validate                         check tree and freelist invariants
btree                            print the tree structure
help                             this text
exit                             flush and quit
";

fn parse_row(args: &str) -> Result<Row, Error> {
    let caps = ROW_ARGS
        .captures(args)
        .ok_or_else(|| err!(Syntax, "Expected: <id> <username> <email>."))?;
    let id = parse_u32(&caps[1])?;
    Row::new(id, &caps[2], &caps[3])
}

fn parse_key(args: &str) -> Result<u32, Error> {
    if args.is_empty() || args.contains(char::is_whitespace) {
        return Err(err!(Syntax, "Expected exactly one <id>."));
    }
    parse_u32(args)
}

fn parse_bounds(args: &str) -> Result<(u32, u32), Error> {
    let (low, high) = args
        .split_once(char::is_whitespace)
        .ok_or_else(|| err!(Syntax, "Expected: <lo> <hi>."))?;
    Ok((parse_u32(low.trim())?, parse_u32(high.trim())?))
}

fn parse_u32(text: &str) -> Result<u32, Error> {
    text.parse::<u32>()
        .map_err(|_| err!(Syntax, "'{}' is not a 32-bit unsigned integer.", text))
}
