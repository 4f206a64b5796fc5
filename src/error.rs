//! Error taxonomy.
//!
//! Compile-time failures are [`GrammarError`] and are reported before any
//! token is generated. Once generation runs, the only caller-visible failure
//! is a [`DriftFault`]: the host applied a token the mask did not allow.
//! Automaton rejection during mask computation is an ordinary outcome
//! (`automaton::Step::Rejected`) and never an error.

use thiserror::Error;

/// Errors raised while compiling a constraint.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GrammarError {
    /// Malformed, ambiguous or unsupported constraint input.
    #[error("invalid specification: {0}")]
    InvalidSpecification(String),
    /// The constraint is well-formed but admits no output at all.
    #[error("unrepresentable constraint: {0}")]
    Unrepresentable(String),
}

impl GrammarError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        GrammarError::InvalidSpecification(msg.into())
    }

    pub fn unrepresentable(msg: impl Into<String>) -> Self {
        GrammarError::Unrepresentable(msg.into())
    }

    /// Prefix the message with the location it was raised at.
    pub fn context(self, ctx: impl std::fmt::Display) -> Self {
        match self {
            GrammarError::InvalidSpecification(m) => {
                GrammarError::InvalidSpecification(format!("{ctx}: {m}"))
            }
            GrammarError::Unrepresentable(m) => {
                GrammarError::Unrepresentable(format!("{ctx}: {m}"))
            }
        }
    }
}

pub type Result<T, E = GrammarError> = std::result::Result<T, E>;

/// Fault reported when the host drives a session off its constraint.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriftFault {
    /// A token outside the last mask was forced into the session.
    #[error("token {token} is outside the mask at byte {position}")]
    OutOfMask { token: u32, position: usize },
    /// End of sequence was signalled while the automaton was not accepting.
    #[error("end of sequence signalled before the constraint was satisfied")]
    PrematureEnd,
    /// The session already reached a terminal state.
    #[error("session already terminated")]
    Terminated,
    /// The token id is not part of the vocabulary.
    #[error("token {0} is not in the vocabulary")]
    UnknownToken(u32),
}
