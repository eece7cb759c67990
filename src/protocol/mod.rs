//! Line-oriented message codec shared by the tracker and peer protocols.
//!
//! One message is one line: space-separated tokens, no escaping. The first
//! token is the command or status, the rest are positional arguments.

mod codes;

pub use codes::ErrorCode;

use crate::error::{Error, Result};

/// Peer control channel port
pub const CONTROL_PORT: u16 = 6601;

/// Peer data channel port
pub const DATA_PORT: u16 = 6602;

/// Default tracker port
pub const TRACKER_PORT: u16 = 6600;

/// Longest line accepted on any control channel
pub const MAX_LINE_LENGTH: usize = 8 * 1024;

pub const OPEN: &str = "OPEN";
pub const HELLO: &str = "HELLO";
pub const GET: &str = "GET";
pub const OK: &str = "OK";
pub const ERROR: &str = "ERROR";
pub const CLOSE: &str = "CLOSE";
pub const GOODBYE: &str = "GOODBYE";
pub const CONNECT: &str = "CONNECT";
pub const ADD: &str = "ADD";
pub const DELETE: &str = "DELETE";
pub const LIST: &str = "LIST";
pub const REQUEST: &str = "REQUEST";
pub const QUIT: &str = "QUIT";

/// Join a command and its arguments into one line (without terminator).
///
/// Arguments must be non-empty and free of spaces, otherwise the line could
/// not be decoded back into the same tokens.
pub fn encode(command: &str, args: &[&str]) -> Result<String> {
    let mut line = String::from(command);
    for arg in args {
        if arg.is_empty() || arg.contains(' ') {
            return Err(Error::InvalidArgument(arg.to_string()));
        }
        line.push(' ');
        line.push_str(arg);
    }
    Ok(line)
}

/// Split a line into tokens. Empty and whitespace-only lines give no tokens.
pub fn decode(line: &str) -> Vec<String> {
    if line.trim().is_empty() {
        return Vec::new();
    }
    line.split(' ')
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

/// A decoded, non-empty protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    tokens: Vec<String>,
}

impl Message {
    /// Decode a line, rejecting one with no tokens.
    pub fn parse(line: &str) -> Result<Self> {
        let tokens = decode(line);
        if tokens.is_empty() {
            return Err(Error::EmptyMessage);
        }
        Ok(Self { tokens })
    }

    pub fn command(&self) -> &str {
        &self.tokens[0]
    }

    pub fn args(&self) -> &[String] {
        &self.tokens[1..]
    }

    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args().get(index).map(String::as_str)
    }

    /// True for the `OK` / `ERROR` lines that end a multi-line response.
    pub fn is_terminal(&self) -> bool {
        self.command() == OK || self.command() == ERROR
    }

    /// The code of an `ERROR` line. A bare `ERROR` gives an empty unknown code.
    pub fn error_code(&self) -> Option<ErrorCode> {
        if self.command() != ERROR {
            return None;
        }
        Some(ErrorCode::parse(self.arg(0).unwrap_or("")))
    }

    /// Accept exactly `OK`, turn `ERROR <code>` into [`Error::Remote`].
    pub fn expect_ok(&self) -> Result<()> {
        if let Some(code) = self.error_code() {
            return Err(Error::Remote(code));
        }
        if self.command() == OK && self.args().is_empty() {
            Ok(())
        } else {
            Err(Error::Unexpected(self.to_string()))
        }
    }

    /// Parse a `<name> <size>` style record line.
    pub fn sized_record(&self) -> Result<(String, u64)> {
        let size = self
            .arg(0)
            .ok_or_else(|| Error::InvalidSize(self.to_string()))?;
        let size = size
            .parse::<u64>()
            .map_err(|_| Error::InvalidSize(size.to_string()))?;
        Ok((self.command().to_string(), size))
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.tokens.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let cases: &[(&str, &[&str])] = &[
            ("OPEN", &[]),
            ("GET", &["notes.txt"]),
            ("ADD", &["alpha.txt", "5d41402abc4b2a76b9719d911017c592", "100"]),
        ];
        for (command, args) in cases {
            let line = encode(command, args).unwrap();
            let mut expected = vec![command.to_string()];
            expected.extend(args.iter().map(|a| a.to_string()));
            assert_eq!(decode(&line), expected);
        }
    }

    #[test]
    fn test_encode_rejects_spaces() {
        assert!(matches!(
            encode("GET", &["my file.txt"]),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(encode("GET", &[""]), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_empty_lines_are_rejected() {
        assert!(decode("").is_empty());
        assert!(decode("   ").is_empty());
        assert!(matches!(Message::parse(""), Err(Error::EmptyMessage)));
        assert!(matches!(Message::parse("  "), Err(Error::EmptyMessage)));
    }

    #[test]
    fn test_get_without_filename() {
        let msg = Message::parse("GET ").unwrap();
        assert_eq!(msg.command(), "GET");
        assert_eq!(msg.arg(0), None);
    }

    #[test]
    fn test_error_lines() {
        let msg = Message::parse("ERROR A4").unwrap();
        assert!(msg.is_terminal());
        assert_eq!(msg.error_code(), Some(ErrorCode::DuplicateFile));
        assert!(matches!(
            msg.expect_ok(),
            Err(Error::Remote(ErrorCode::DuplicateFile))
        ));

        let ok = Message::parse("OK").unwrap();
        assert!(ok.is_terminal());
        assert!(ok.expect_ok().is_ok());

        let other = Message::parse("HELLO").unwrap();
        assert!(matches!(other.expect_ok(), Err(Error::Unexpected(_))));
    }

    #[test]
    fn test_sized_record() {
        let msg = Message::parse("alpha.txt 100").unwrap();
        assert_eq!(msg.sized_record().unwrap(), ("alpha.txt".to_string(), 100));

        let bad = Message::parse("alpha.txt big").unwrap();
        assert!(matches!(bad.sized_record(), Err(Error::InvalidSize(_))));
    }
}
