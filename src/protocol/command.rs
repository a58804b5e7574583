//! Command definitions
//!
//! The first byte of every request line selects the command.

/// Key prefix of the per-user private namespace
pub const DICT_PATH_PRIVATE: &[u8] = b"priv/";

/// Key prefix of the shared namespace
pub const DICT_PATH_SHARED: &[u8] = b"shared/";

/// Command kinds, tagged by their one-character wire code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandKind {
    Lookup = b'L',
    Iterate = b'I',
    Begin = b'B',
    Commit = b'C',
    Rollback = b'R',
    Set = b'S',
    Unset = b'U',
    AtomicInc = b'A',
    Timestamp = b'T',
    HideLogValues = b'V',
}

impl CommandKind {
    /// Every command the dispatcher knows about
    pub const ALL: [CommandKind; 10] = [
        CommandKind::Lookup,
        CommandKind::Iterate,
        CommandKind::Begin,
        CommandKind::Commit,
        CommandKind::Rollback,
        CommandKind::Set,
        CommandKind::Unset,
        CommandKind::AtomicInc,
        CommandKind::Timestamp,
        CommandKind::HideLogValues,
    ];

    /// Look up a command by its wire tag
    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tag() == tag)
    }

    /// The wire tag
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Upper-case name used in log prefixes
    pub fn name(self) -> &'static str {
        match self {
            CommandKind::Lookup => "LOOKUP",
            CommandKind::Iterate => "ITERATE",
            CommandKind::Begin => "BEGIN",
            CommandKind::Commit => "COMMIT",
            CommandKind::Rollback => "ROLLBACK",
            CommandKind::Set => "SET",
            CommandKind::Unset => "UNSET",
            CommandKind::AtomicInc => "ATOMIC_INC",
            CommandKind::Timestamp => "TIMESTAMP",
            CommandKind::HideLogValues => "HIDE_LOG_VALUES",
        }
    }
}

/// Whether `key` lives in the private namespace
pub fn is_private_key(key: &[u8]) -> bool {
    key.starts_with(DICT_PATH_PRIVATE)
}
