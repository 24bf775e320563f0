//! Playback lifecycle events and the engine's status-line protocol

use std::path::PathBuf;

/// Lifecycle events emitted by the playback engine for the loaded queue
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    /// A replay file was loaded for playback
    FileLoaded(PathBuf),

    /// Playback of the current entry began
    Start,

    /// Playback of the current entry finished
    End {
        /// Whether the game ran to its natural conclusion rather than being
        /// skipped or aborted
        game_ended: bool,
    },

    /// Frame counter heartbeat; carries no orchestration meaning
    CurrentFrame(i32),

    /// Every queue entry has been consumed
    QueueEmpty,
}

/// Incremental parser for the engine's stdout status lines.
///
/// The engine reports the final frame of a game (`[GAME_END_FRAME]`)
/// separately from the frame where playback actually stopped
/// (`[PLAYBACK_END_FRAME]`); the two match only when the entry played to
/// completion instead of being skipped.
#[derive(Debug, Default)]
pub struct StatusParser {
    game_end_frame: Option<i32>,
}

impl StatusParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one stdout line, returning the event it carries, if any
    pub fn parse_line(&mut self, line: &str) -> Option<PlaybackEvent> {
        let line = line.trim();
        let (tag, rest) = match line.split_once(' ') {
            Some((tag, rest)) => (tag, rest.trim()),
            None => (line, ""),
        };

        match tag {
            "[FILE_PATH]" if !rest.is_empty() => {
                Some(PlaybackEvent::FileLoaded(PathBuf::from(rest)))
            }
            "[PLAYBACK_START_FRAME]" => Some(PlaybackEvent::Start),
            "[GAME_END_FRAME]" => {
                self.game_end_frame = rest.parse().ok();
                None
            }
            "[PLAYBACK_END_FRAME]" => {
                let end_frame: Option<i32> = rest.parse().ok();
                let game_ended = end_frame.is_some() && end_frame == self.game_end_frame;
                Some(PlaybackEvent::End { game_ended })
            }
            "[CURRENT_FRAME]" => rest.parse().ok().map(PlaybackEvent::CurrentFrame),
            "[NO_GAME]" => Some(PlaybackEvent::QueueEmpty),
            _ => None,
        }
    }
}
