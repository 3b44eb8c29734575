//! Chunk direction and directional chunk types.

use std::fmt;

/// Direction of a chunk within a bidirectional stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Direction {
    /// Sent by the connection initiator
    #[default]
    ClientToServer,
    /// Sent by the responder
    ServerToClient,
}

impl Direction {
    /// The opposite direction.
    pub fn reverse(self) -> Self {
        match self {
            Direction::ClientToServer => Direction::ServerToClient,
            Direction::ServerToClient => Direction::ClientToServer,
        }
    }

    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ClientToServer => "client-to-server",
            Direction::ServerToClient => "server-to-client",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "client-to-server" | "client" | "c2s" => Ok(Direction::ClientToServer),
            "server-to-client" | "server" | "s2c" => Ok(Direction::ServerToClient),
            _ => Err(format!(
                "unknown direction '{}' (expected client or server)",
                s
            )),
        }
    }
}

/// One direction-tagged payload of a stream's converted content.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Chunk {
    pub direction: Direction,
    pub content: Vec<u8>,
}

impl Chunk {
    pub fn new(direction: Direction, content: impl Into<Vec<u8>>) -> Self {
        Self {
            direction,
            content: content.into(),
        }
    }

    pub fn client(content: impl Into<Vec<u8>>) -> Self {
        Self::new(Direction::ClientToServer, content)
    }

    pub fn server(content: impl Into<Vec<u8>>) -> Self {
        Self::new(Direction::ServerToClient, content)
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}
