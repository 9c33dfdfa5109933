//! Condition reasons as explicit state machines
//!
//! Every managed kind has a closed reason enum. Each reason belongs to a class
//! (initial, transient, terminal success, terminal failure) and each kind
//! declares which reason changes are legal. Terminal reasons absorb: once
//! reached, the convergence step does nothing further for that resource.

use std::fmt::{Debug, Display};
use std::str::FromStr;

use crate::crd::ConditionStatus;

/// Classification of a reason within its kind's state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReasonClass {
    /// Reason written before any work was attempted
    Initial,
    /// Work is in progress or failed in a way that may heal
    Transient,
    /// Terminal success; the resource is usable by dependents
    Succeeded,
    /// Terminal failure; only a new resource can make progress
    Failed,
}

impl ReasonClass {
    /// Whether the class ends convergence
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// A closed per-kind set of condition reasons.
///
/// The string form (via `Display`/`FromStr`) is what gets persisted in the
/// condition's `reason` field.
pub trait Reason:
    Copy + Eq + Debug + Display + FromStr + Send + Sync + 'static
{
    /// Kind name used in errors and events
    const KIND: &'static str;

    /// Every reason of the kind, initial first
    const ALL: &'static [Self];

    /// Class of this reason
    fn class(self) -> ReasonClass;

    /// The reason written for a freshly created resource
    fn initial() -> Self {
        Self::ALL[0]
    }

    /// Whether the kind's transition table allows `self -> to`.
    ///
    /// The default table: terminal reasons never change, and nothing may
    /// return to the initial reason. Kinds override this to forbid more.
    fn allows(self, to: Self) -> bool {
        !self.class().is_terminal() && to.class() != ReasonClass::Initial
    }

    /// Whether this reason stops further convergence
    fn is_terminal(self) -> bool {
        self.class().is_terminal()
    }

    /// Readiness derived from the reason's class
    fn readiness(self) -> ConditionStatus {
        match self.class() {
            ReasonClass::Succeeded => ConditionStatus::True,
            ReasonClass::Initial => ConditionStatus::Unknown,
            ReasonClass::Transient | ReasonClass::Failed => ConditionStatus::False,
        }
    }
}

/// Check a reason change against the kind's transition table.
///
/// `from = None` means the resource has no parseable current reason, and any
/// reason may be written.
pub fn check_transition<R: Reason>(from: Option<R>, to: R) -> crate::Result<()> {
    match from {
        Some(from) if from == to => Ok(()),
        Some(from) if !from.allows(to) => Err(crate::Error::IllegalTransition {
            kind: R::KIND.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        }),
        _ => Ok(()),
    }
}

/// Declare a reason enum with its string form and class for each variant.
///
/// ```text
/// reason_enum! {
///     /// Reasons for a Database
///     pub enum DatabaseReason: "Database" {
///         /// doc
///         Pending => Initial,
///         Created => Succeeded,
///     }
/// }
/// ```
#[macro_export]
macro_rules! reason_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident : $kind:literal {
            $( $(#[$vmeta:meta])* $variant:ident => $class:ident ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            fn class_of(self) -> $crate::reason::ReasonClass {
                match self {
                    $( Self::$variant => $crate::reason::ReasonClass::$class ),+
                }
            }

            /// Persisted string form
            pub fn as_str(self) -> &'static str {
                match self {
                    $( Self::$variant => stringify!($variant) ),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $(
                    if s == stringify!($variant) {
                        return Ok(Self::$variant);
                    }
                )+
                Err(format!("unknown {} reason: {}", $kind, s))
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    reason_enum! {
        /// Test reasons
        pub enum ToyReason: "Toy" {
            /// initial
            Pending => Initial,
            /// transient
            Waiting => Transient,
            /// success
            Done => Succeeded,
            /// failure
            Broken => Failed,
        }
    }

    impl Reason for ToyReason {
        const KIND: &'static str = "Toy";
        const ALL: &'static [Self] = &[Self::Pending, Self::Waiting, Self::Done, Self::Broken];

        fn class(self) -> ReasonClass {
            self.class_of()
        }
    }

    #[test]
    fn string_form_round_trips() {
        for reason in ToyReason::ALL {
            assert_eq!(reason.to_string().parse::<ToyReason>(), Ok(*reason));
        }
        assert!("Nope".parse::<ToyReason>().is_err());
    }

    #[test]
    fn initial_is_first() {
        assert_eq!(ToyReason::initial(), ToyReason::Pending);
    }

    #[test]
    fn readiness_follows_class() {
        assert_eq!(ToyReason::Pending.readiness(), ConditionStatus::Unknown);
        assert_eq!(ToyReason::Waiting.readiness(), ConditionStatus::False);
        assert_eq!(ToyReason::Done.readiness(), ConditionStatus::True);
        assert_eq!(ToyReason::Broken.readiness(), ConditionStatus::False);
    }

    #[test]
    fn terminal_reasons_reject_changes() {
        assert!(check_transition(Some(ToyReason::Done), ToyReason::Waiting).is_err());
        assert!(check_transition(Some(ToyReason::Broken), ToyReason::Done).is_err());
    }

    #[test]
    fn cannot_return_to_initial() {
        let err = check_transition(Some(ToyReason::Waiting), ToyReason::Pending)
            .expect_err("back to initial must be rejected");
        assert!(matches!(err, crate::Error::IllegalTransition { .. }));
    }

    #[test]
    fn forward_transitions_are_legal() {
        assert!(check_transition(None, ToyReason::Broken).is_ok());
        assert!(check_transition(Some(ToyReason::Pending), ToyReason::Waiting).is_ok());
        assert!(check_transition(Some(ToyReason::Waiting), ToyReason::Done).is_ok());
        assert!(check_transition(Some(ToyReason::Waiting), ToyReason::Waiting).is_ok());
    }
}
