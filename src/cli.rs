//! Parsing and validation for the interactive front-end commands.

use std::str::FromStr;

use crate::key::Key;

/// Largest payload accepted by `put`.
pub const MAX_PUT_LEN: usize = 255;

/// A validated front-end command.
#[derive(Debug, PartialEq)]
pub enum Command {
    Put(Vec<u8>),
    Get(Key),
    Show,
    Exit,
}

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("no command entered")]
    Empty,
    #[error("invalid put command, no data provided")]
    PutMissingData,
    #[error("invalid put command, data longer than 255 bytes")]
    PutTooLong,
    #[error("invalid get command, provide exactly the key to look up")]
    GetArgCount,
    #[error("invalid key: {0}")]
    BadKey(#[from] const_hex::FromHexError),
    #[error("'{0}' takes no arguments")]
    TrailingArgs(&'static str),
    #[error("unknown command, must be one of put, get, show or exit")]
    Unknown,
}

/// Parses one line of user input.
pub fn parse(line: &str) -> Result<Command, CliError> {
    let mut parts = line.split_whitespace();
    let command = parts.next().ok_or(CliError::Empty)?;
    let args: Vec<&str> = parts.collect();

    match command {
        "put" => {
            if args.is_empty() {
                return Err(CliError::PutMissingData);
            }
            let data = args.join(" ");
            if data.len() > MAX_PUT_LEN {
                return Err(CliError::PutTooLong);
            }
            Ok(Command::Put(data.into_bytes()))
        }
        "get" => match args.as_slice() {
            [key] => Ok(Command::Get(Key::from_str(key)?)),
            _ => Err(CliError::GetArgCount),
        },
        "show" if args.is_empty() => Ok(Command::Show),
        "show" => Err(CliError::TrailingArgs("show")),
        "exit" if args.is_empty() => Ok(Command::Exit),
        "exit" => Err(CliError::TrailingArgs("exit")),
        _ => Err(CliError::Unknown),
    }
}
