//! Parameter data-access directions and the access-mode token resolver.

/// Data-access mode of a task parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Read-only.
    In,
    /// Write-only, produced fresh by the task.
    Out,
    /// Read-modify-write.
    Inout,
    /// Shared, unmanaged concurrent access. Consistency is the task
    /// author's contract, not the worker's.
    Concurrent,
    /// Shared, order-independent, requires cross-slot mutual exclusion.
    Commutative,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::In => "IN",
            Self::Out => "OUT",
            Self::Inout => "INOUT",
            Self::Concurrent => "CONCURRENT",
            Self::Commutative => "COMMUTATIVE",
        }
    }

    pub fn parse_tag(tag: &str) -> Option<Self> {
        match tag {
            "IN" => Some(Self::In),
            "OUT" => Some(Self::Out),
            "INOUT" => Some(Self::Inout),
            "CONCURRENT" => Some(Self::Concurrent),
            "COMMUTATIVE" => Some(Self::Commutative),
            _ => None,
        }
    }

    /// Directions that must be written back to the store after the call.
    /// Commutative parameters are read-modify-write; only their ordering is
    /// relaxed, not their persistence.
    pub fn writes_back(&self) -> bool {
        matches!(self, Self::Out | Self::Inout | Self::Commutative)
    }

    /// Directions whose pin is held across the call until write-back.
    pub fn holds_pin(&self) -> bool {
        matches!(self, Self::Inout | Self::Commutative)
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map an access-mode token to a [`Direction`].
///
/// `cv` must be checked before `c`: a commutative token would otherwise
/// match the concurrent prefix.
///
/// The receiver (`self`/`cls`, first positional parameter) defaults to IN,
/// but the task's declared target direction overrides it when that direction
/// is INOUT, CONCURRENT or COMMUTATIVE.
pub fn resolve(mode: &str, is_receiver: bool, target_direction: Option<Direction>) -> Direction {
    if is_receiver {
        match target_direction {
            Some(d @ (Direction::Inout | Direction::Concurrent | Direction::Commutative)) => {
                return d;
            }
            _ => {}
        }
    }

    if mode.starts_with('w') {
        Direction::Out
    } else if mode.starts_with("r+") || mode.starts_with('a') {
        Direction::Inout
    } else if mode.starts_with("cv") {
        Direction::Commutative
    } else if mode.starts_with('c') {
        Direction::Concurrent
    } else {
        Direction::In
    }
}
