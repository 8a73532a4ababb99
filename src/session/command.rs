//! Operator commands
//!
//! One command per line of text, mirroring the keys of the desktop player:
//! an empty line or `p` plays and pauses, `r` restarts, `+`/`-` step two
//! frames. The rest drive the session and the tracker roster.

use std::path::PathBuf;
use std::str::FromStr;

use crate::capture::BoundingBox;
use crate::error::CommandError;

/// Frames skipped by one arrow step
pub const SEEK_STEP: i64 = 2;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    TogglePlay,
    Restart,
    Seek(i64),
    SelectRoi(BoundingBox),
    View,
    Stop,
    Resume,
    Open(PathBuf),
    Fps(f64),
    Draw { name: String, draw: bool },
    Listen(String),
    Quit,
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let Some(head) = line.split_whitespace().next() else {
            return Ok(Command::TogglePlay);
        };
        let rest = line[head.len()..].trim();
        let args: Vec<&str> = rest.split_whitespace().collect();

        let command = match (head.to_ascii_lowercase().as_str(), args.as_slice()) {
            ("p" | "play" | "pause" | "space", []) => Command::TogglePlay,
            ("r" | "restart", []) => Command::Restart,
            ("+" | "right", []) => Command::Seek(SEEK_STEP),
            ("-" | "left", []) => Command::Seek(-SEEK_STEP),
            ("seek", [delta]) => Command::Seek(number(delta, "seek", "a frame offset")?),
            ("seek", _) => return Err(arguments("seek", "a frame offset")),
            ("roi", [x, y, width, height]) => {
                let expected = "x y width height";
                Command::SelectRoi(BoundingBox::new(
                    number(x, "roi", expected)?,
                    number(y, "roi", expected)?,
                    number(width, "roi", expected)?,
                    number(height, "roi", expected)?,
                ))
            }
            ("roi", _) => return Err(arguments("roi", "x y width height")),
            ("v" | "view", []) => Command::View,
            ("s" | "stop", []) => Command::Stop,
            ("resume", []) => Command::Resume,
            ("open", _) if !rest.is_empty() => Command::Open(PathBuf::from(rest)),
            ("open", _) => return Err(arguments("open", "a video path")),
            ("fps", [fps]) => Command::Fps(number(fps, "fps", "a frame rate")?),
            ("fps", _) => return Err(arguments("fps", "a frame rate")),
            ("show", [name]) => Command::Draw {
                name: name.to_string(),
                draw: true,
            },
            ("hide", [name]) => Command::Draw {
                name: name.to_string(),
                draw: false,
            },
            ("show" | "hide", _) => return Err(arguments("show/hide", "a tracker name")),
            ("listen", [address]) => Command::Listen(address.to_string()),
            ("listen", _) => return Err(arguments("listen", "an address")),
            ("q" | "quit" | "exit", []) => Command::Quit,
            _ => return Err(CommandError::Unknown(line.to_string())),
        };
        Ok(command)
    }
}

fn number<T: FromStr>(
    word: &str,
    command: &'static str,
    expected: &'static str,
) -> Result<T, CommandError> {
    word.parse().map_err(|_| arguments(command, expected))
}

fn arguments(command: &'static str, expected: &'static str) -> CommandError {
    CommandError::Arguments { command, expected }
}
