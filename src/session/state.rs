use std::fmt;

/// Where the annotation session is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    /// Video plays, nothing is tracked
    #[default]
    Playing,
    /// Every new frame is dispatched to the trackers
    Tracking,
    /// Browsing cached results without dispatching
    Viewing,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Playing => "playing",
            SessionState::Tracking => "tracking",
            SessionState::Viewing => "viewing",
        })
    }
}
