//! Implements the wire protocol spoken between cache nodes and their clients.
//!
//! The protocol is a compact subset of RESP ("REdis Serialization Protocol"): requests are
//! arrays of bulk strings, replies are simple strings, bulk strings or errors. Sticking to
//! RESP keeps the framing binary safe (keys and values are length prefixed, never delimited)
//! and has the nice side effect that any Redis client - including **redis-cli** - can talk to
//! a cache node for debugging purposes.
//!
//! A request like `CACHE.GET scores Tom` is encoded as:
//!
//! ```text
//! *3\r\n$9\r\nCACHE.GET\r\n$6\r\nscores\r\n$3\r\nTom\r\n
//! ```
//!
//! As requests and replies arrive via the network, the parsers must gracefully handle partial
//! input: both return an empty optional in this case, so that the caller simply keeps reading.
//! Malformed input on the other hand is reported as an error and terminates the connection.
use anyhow::{anyhow, Context, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// Limits the number of elements accepted within one request array.
const MAX_COMMAND_PARTS: usize = 16;

/// Represents a parsed command.
///
/// Note that we treat the first element of the request array as the command name and re-number
/// all other elements accordingly. Therefore `CACHE.GET scores Tom` has `CACHE.GET` as name,
/// `scores` as first argument (index 0) and `Tom` as second (index 1).
///
/// # Examples
/// ```
/// # use bytes::BytesMut;
/// # use ganymede::protocol::Command;
/// let buffer = BytesMut::from("*2\r\n$4\r\nPING\r\n$4\r\ntest\r\n");
/// let command = Command::parse(&buffer).unwrap().unwrap();
///
/// assert_eq!(command.name(), "PING");
/// assert_eq!(command.argument_count(), 1);
/// assert_eq!(command.str_argument(0).unwrap(), "test");
/// ```
///
/// Parsing a partial command yields an empty optional:
/// ```
/// # use bytes::BytesMut;
/// # use ganymede::protocol::Command;
/// let buffer = BytesMut::from("*2\r\n$4\r\nPING\r\n$4\r\nte");
/// assert_eq!(Command::parse(&buffer).unwrap().is_none(), true);
/// ```
pub struct Command {
    name: String,
    arguments: Vec<Bytes>,
    len: usize,
}

impl Command {
    /// Tries to parse a command from the given buffer.
    ///
    /// Returns an empty optional if only a partial command is present (the caller should
    /// continue reading in this case) and an **Err** if the buffer contains malformed data.
    pub fn parse(buffer: &[u8]) -> Result<Option<Command>> {
        if buffer.is_empty() {
            return Ok(None);
        }
        if buffer[0] != b'*' {
            return Err(anyhow!("A request must start with '*'."));
        }

        let (line, mut offset) = match read_line(buffer, 1) {
            Some(line_and_offset) => line_and_offset,
            None => return Ok(None),
        };
        let count = parse_length(line)?;
        if count == 0 || count > MAX_COMMAND_PARTS {
            return Err(anyhow!(
                "A request must contain between 1 and {} elements.",
                MAX_COMMAND_PARTS
            ));
        }

        let mut parts = Vec::with_capacity(count);
        for _ in 0..count {
            if offset >= buffer.len() {
                return Ok(None);
            }
            if buffer[offset] != b'$' {
                return Err(anyhow!("Each element of a request must start with '$'."));
            }
            let (line, data_start) = match read_line(buffer, offset + 1) {
                Some(line_and_offset) => line_and_offset,
                None => return Ok(None),
            };
            let length = parse_length(line)?;
            if buffer.len() < data_start + length + 2 {
                return Ok(None);
            }
            if &buffer[data_start + length..data_start + length + 2] != b"\r\n" {
                return Err(anyhow!("Each element of a request must end with CRLF."));
            }
            parts.push(Bytes::copy_from_slice(&buffer[data_start..data_start + length]));
            offset = data_start + length + 2;
        }

        let name = std::str::from_utf8(&parts[0])
            .context("The command name must be valid UTF-8.")?
            .to_owned();
        let arguments = parts.split_off(1);

        Ok(Some(Command {
            name,
            arguments,
            len: offset,
        }))
    }

    /// Returns the name of the command.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of arguments (not counting the command name itself).
    pub fn argument_count(&self) -> usize {
        self.arguments.len()
    }

    /// Returns the n-th argument as string.
    ///
    /// # Errors
    /// Fails if no such argument is present or if it is not valid UTF-8.
    pub fn str_argument(&self, index: usize) -> Result<&str> {
        let argument = self
            .arguments
            .get(index)
            .ok_or_else(|| anyhow!("Missing argument {} for '{}'.", index, self.name))?;

        std::str::from_utf8(argument)
            .with_context(|| format!("Argument {} of '{}' is not valid UTF-8.", index, self.name))
    }

    /// Returns the total number of bytes this command occupied on the wire.
    ///
    /// The caller uses this to discard the consumed bytes from its input buffer.
    pub fn len(&self) -> usize {
        self.len
    }
}

/// Represents a parsed reply as observed by a client.
#[derive(Debug, PartialEq, Eq)]
pub enum Reply {
    /// A simple string like `+OK`.
    Simple(String),
    /// A bulk string carrying arbitrary bytes.
    Bulk(Bytes),
    /// The null bulk string (`$-1`), indicating the absence of a value.
    Nil,
    /// An error reported by the server.
    Error(String),
}

impl Reply {
    /// Tries to parse a reply from the given buffer.
    ///
    /// On success, the reply is returned along with the number of bytes it occupied. Just like
    /// [Command::parse] this returns an empty optional for partial input and an **Err** for
    /// malformed data.
    pub fn parse(buffer: &[u8]) -> Result<Option<(Reply, usize)>> {
        if buffer.is_empty() {
            return Ok(None);
        }

        match buffer[0] {
            b'+' => Ok(read_line(buffer, 1).map(|(line, offset)| {
                (Reply::Simple(String::from_utf8_lossy(line).to_string()), offset)
            })),
            b'-' => Ok(read_line(buffer, 1).map(|(line, offset)| {
                (Reply::Error(String::from_utf8_lossy(line).to_string()), offset)
            })),
            b'$' => {
                let (line, data_start) = match read_line(buffer, 1) {
                    Some(line_and_offset) => line_and_offset,
                    None => return Ok(None),
                };
                if line == b"-1" {
                    return Ok(Some((Reply::Nil, data_start)));
                }
                let length = parse_length(line)?;
                if buffer.len() < data_start + length + 2 {
                    return Ok(None);
                }
                if &buffer[data_start + length..data_start + length + 2] != b"\r\n" {
                    return Err(anyhow!("A bulk string must end with CRLF."));
                }

                Ok(Some((
                    Reply::Bulk(Bytes::copy_from_slice(
                        &buffer[data_start..data_start + length],
                    )),
                    data_start + length + 2,
                )))
            }
            _ => Err(anyhow!("A reply must start with '+', '-' or '$'.")),
        }
    }
}

/// Encodes a request consisting of the given parts into the given buffer.
pub fn write_command(buffer: &mut BytesMut, parts: &[&[u8]]) {
    buffer.put_slice(format!("*{}\r\n", parts.len()).as_bytes());
    for part in parts {
        buffer.put_slice(format!("${}\r\n", part.len()).as_bytes());
        buffer.put_slice(part);
        buffer.put_slice(b"\r\n");
    }
}

/// Encodes a simple string reply like `+OK` into the given buffer.
pub fn write_simple(buffer: &mut BytesMut, message: &str) {
    buffer.put_slice(format!("+{}\r\n", message).as_bytes());
}

/// Encodes a bulk string reply carrying the given bytes into the given buffer.
pub fn write_bulk(buffer: &mut BytesMut, data: &[u8]) {
    buffer.put_slice(format!("${}\r\n", data.len()).as_bytes());
    buffer.put_slice(data);
    buffer.put_slice(b"\r\n");
}

/// Encodes an error reply into the given buffer.
///
/// Line breaks within the message are replaced, as they would break the framing.
pub fn write_error(buffer: &mut BytesMut, message: &str) {
    let message = message.replace(['\r', '\n'], " ");
    buffer.put_slice(format!("-ERR {}\r\n", message).as_bytes());
}

/// Extracts the line starting at the given offset, up to the next CRLF.
///
/// Returns the line contents along with the offset of the first byte after the CRLF, or
/// **None** if the buffer does not contain a full line yet.
fn read_line(buffer: &[u8], start: usize) -> Option<(&[u8], usize)> {
    let mut index = start;
    while index + 1 < buffer.len() {
        if buffer[index] == b'\r' && buffer[index + 1] == b'\n' {
            return Some((&buffer[start..index], index + 2));
        }
        index += 1;
    }

    None
}

/// Parses a length prefix (element count or byte count) into a number.
fn parse_length(line: &[u8]) -> Result<usize> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|text| text.parse::<usize>().ok())
        .ok_or_else(|| anyhow!("Expected a numeric length prefix."))
}

#[cfg(test)]
mod tests {
    use crate::protocol::{
        write_bulk, write_command, write_error, write_simple, Command, Reply,
    };
    use bytes::BytesMut;

    #[test]
    fn commands_are_parsed_correctly() {
        let buffer = BytesMut::from("*3\r\n$9\r\nCACHE.GET\r\n$6\r\nscores\r\n$3\r\nTom\r\n");
        let command = Command::parse(&buffer).unwrap().unwrap();

        assert_eq!(command.name(), "CACHE.GET");
        assert_eq!(command.argument_count(), 2);
        assert_eq!(command.str_argument(0).unwrap(), "scores");
        assert_eq!(command.str_argument(1).unwrap(), "Tom");
        assert_eq!(command.len(), buffer.len());

        // Requesting an absent argument yields a proper error...
        assert_eq!(command.str_argument(2).is_err(), true);
    }

    #[test]
    fn partial_commands_are_detected() {
        for partial in [
            "",
            "*",
            "*3\r\n",
            "*3\r\n$9\r\nCACHE.GET",
            "*3\r\n$9\r\nCACHE.GET\r\n$6\r\nscores\r\n$3\r\nTo",
        ] {
            let buffer = BytesMut::from(partial);
            assert_eq!(Command::parse(&buffer).unwrap().is_none(), true);
        }
    }

    #[test]
    fn malformed_commands_are_rejected() {
        for malformed in ["$4\r\nPING\r\n", "*0\r\n", "*x\r\n", "*1\r\nPING\r\n"] {
            let buffer = BytesMut::from(malformed);
            assert_eq!(Command::parse(&buffer).is_err(), true);
        }
    }

    #[test]
    fn a_command_written_by_a_client_can_be_parsed_by_the_server() {
        let mut buffer = BytesMut::new();
        write_command(&mut buffer, &[b"CACHE.GET", b"scores", b"binary\r\nkey"]);

        let command = Command::parse(&buffer).unwrap().unwrap();
        assert_eq!(command.name(), "CACHE.GET");
        // The length prefixed framing keeps even CRLFs within a key intact...
        assert_eq!(command.str_argument(1).unwrap(), "binary\r\nkey");
    }

    #[test]
    fn replies_are_parsed_correctly() {
        let mut buffer = BytesMut::new();
        write_simple(&mut buffer, "PONG");
        let (reply, consumed) = Reply::parse(&buffer).unwrap().unwrap();
        assert_eq!(reply, Reply::Simple("PONG".to_owned()));
        assert_eq!(consumed, buffer.len());

        let mut buffer = BytesMut::new();
        write_bulk(&mut buffer, b"634");
        let (reply, _) = Reply::parse(&buffer).unwrap().unwrap();
        assert_eq!(reply, Reply::Bulk(bytes::Bytes::from_static(b"634")));

        let mut buffer = BytesMut::new();
        write_error(&mut buffer, "no such\r\ngroup");
        let (reply, _) = Reply::parse(&buffer).unwrap().unwrap();
        // Line breaks have been stripped from the message to keep the framing intact...
        assert_eq!(reply, Reply::Error("ERR no such group".to_owned()));

        let buffer = BytesMut::from("$-1\r\n");
        let (reply, consumed) = Reply::parse(&buffer).unwrap().unwrap();
        assert_eq!(reply, Reply::Nil);
        assert_eq!(consumed, 5);
    }

    #[test]
    fn partial_replies_are_detected() {
        for partial in ["", "+PON", "$3\r\n63", "$3"] {
            let buffer = BytesMut::from(partial);
            assert_eq!(Reply::parse(&buffer).unwrap().is_none(), true);
        }
    }
}
