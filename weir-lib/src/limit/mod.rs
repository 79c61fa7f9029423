//! In-proxy bandwidth enforcement: limit shares, counters and the
//! per-stream filter.

pub mod bandwidth;
pub mod enforcer;
pub mod freq;
pub mod refresh;
pub mod table;

pub use bandwidth::{apply_bandwidth, ApplyLimitResult, PERIOD_MS};
pub use enforcer::{Enforcer, EnforcerConfig, PayloadOutcome, StreamState};
pub use freq::FreqCounter;
pub use refresh::spawn_refresh;
pub use table::{DirectionLimit, UserLimit, UserLimitTable};

/// Transfer direction as seen from the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Upload,
    Download,
}

impl Direction {
    /// The wire literal used in event lines and share updates.
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Upload => "up",
            Direction::Download => "dwn",
        }
    }

    pub fn parse(s: &str) -> Option<Direction> {
        match s {
            "up" => Some(Direction::Upload),
            "dwn" => Some(Direction::Download),
            _ => None,
        }
    }
}

/// HTTP method as classified by the enforcer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVerb {
    Options,
    Get,
    Head,
    Post,
    Put,
    Delete,
    Trace,
    Connect,
    Other,
}

impl HttpVerb {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpVerb::Options => "OPTIONS",
            HttpVerb::Get => "GET",
            HttpVerb::Head => "HEAD",
            HttpVerb::Post => "POST",
            HttpVerb::Put => "PUT",
            HttpVerb::Delete => "DELETE",
            HttpVerb::Trace => "TRACE",
            HttpVerb::Connect => "CONNECT",
            HttpVerb::Other => "OTHER",
        }
    }

    /// Verbs that carry a request body count against the upload share;
    /// everything else counts against download.
    pub fn direction(self) -> Direction {
        match self {
            HttpVerb::Put | HttpVerb::Post => Direction::Upload,
            _ => Direction::Download,
        }
    }
}
