use core::fmt;

/// Lifecycle phase of a channel machine.
///
/// ```text
/// InitActing -> InitSigning -> Funding -> Acting <-> Signing
///                                  |        |          |
///                                  |        |          +-> Final
///                                  +--------+----------+-> Registering -> Registered
///                                                            Registered -> Progressing -> Progressed
///                               Registered | Progressed | Final -> Withdrawing -> Withdrawn
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, std::hash::Hash)]
pub enum Phase {
    InitActing,
    InitSigning,
    Funding,
    Acting,
    Signing,
    Final,
    Registering,
    Registered,
    Progressing,
    Progressed,
    Withdrawing,
    Withdrawn,
}

impl Phase {
    pub const ALL: [Phase; 12] = [
        Phase::InitActing,
        Phase::InitSigning,
        Phase::Funding,
        Phase::Acting,
        Phase::Signing,
        Phase::Final,
        Phase::Registering,
        Phase::Registered,
        Phase::Progressing,
        Phase::Progressed,
        Phase::Withdrawing,
        Phase::Withdrawn,
    ];

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(v: u8) -> Option<Phase> {
        Self::ALL.get(v as usize).copied()
    }

    /// Phases in which a signature round is open.
    pub fn is_signing(self) -> bool {
        matches!(
            self,
            Phase::InitSigning | Phase::Signing | Phase::Progressing
        )
    }

    /// Phases reached only through the adjudicator.
    pub fn is_on_chain(self) -> bool {
        matches!(
            self,
            Phase::Registering
                | Phase::Registered
                | Phase::Progressing
                | Phase::Progressed
                | Phase::Withdrawing
                | Phase::Withdrawn
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
