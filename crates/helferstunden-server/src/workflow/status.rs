//! Entry states, workflow operations and the transition table

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Life-cycle state of a work entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Entwurf,
    Eingereicht,
    InKlaerung,
    Freigegeben,
    Abgelehnt,
    Storniert,
}

impl EntryStatus {
    pub const ALL: [EntryStatus; 6] = [
        EntryStatus::Entwurf,
        EntryStatus::Eingereicht,
        EntryStatus::InKlaerung,
        EntryStatus::Freigegeben,
        EntryStatus::Abgelehnt,
        EntryStatus::Storniert,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntryStatus::Entwurf => "entwurf",
            EntryStatus::Eingereicht => "eingereicht",
            EntryStatus::InKlaerung => "in_klaerung",
            EntryStatus::Freigegeben => "freigegeben",
            EntryStatus::Abgelehnt => "abgelehnt",
            EntryStatus::Storniert => "storniert",
        }
    }

    /// Display label
    pub fn label(self) -> &'static str {
        match self {
            EntryStatus::Entwurf => "Entwurf",
            EntryStatus::Eingereicht => "Eingereicht",
            EntryStatus::InKlaerung => "In Klärung",
            EntryStatus::Freigegeben => "Freigegeben",
            EntryStatus::Abgelehnt => "Abgelehnt",
            EntryStatus::Storniert => "Storniert",
        }
    }

    /// No status change leaves a terminal state
    pub fn is_terminal(self) -> bool {
        matches!(self, EntryStatus::Freigegeben | EntryStatus::Abgelehnt)
    }

    /// Target state of `op` from this state, `None` if the table has no row
    ///
    /// `Reactivate` yields the default target; the engine substitutes the
    /// recorded pre-cancellation state when there is one.
    pub fn transition(self, op: Operation) -> Option<EntryStatus> {
        use EntryStatus::*;
        use Operation::*;

        match (self, op) {
            (Entwurf, Submit) => Some(Eingereicht),
            (Eingereicht, Approve) | (InKlaerung, Approve) => Some(Freigegeben),
            (Eingereicht, Reject) | (InKlaerung, Reject) => Some(Abgelehnt),
            (Eingereicht, ReturnForRevision) => Some(InKlaerung),
            (Eingereicht, Cancel) => Some(Storniert),
            (Storniert, Reactivate) => Some(Eingereicht),
            (Eingereicht, Withdraw) | (InKlaerung, Withdraw) => Some(Entwurf),
            (Freigegeben, Correct) => Some(Freigegeben),
            _ => None,
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntryStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown entry status: {s}"))
    }
}

/// Workflow operations on an existing entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Submit,
    Approve,
    Reject,
    ReturnForRevision,
    Cancel,
    Reactivate,
    Withdraw,
    Correct,
}

impl Operation {
    pub const ALL: [Operation; 8] = [
        Operation::Submit,
        Operation::Approve,
        Operation::Reject,
        Operation::ReturnForRevision,
        Operation::Cancel,
        Operation::Reactivate,
        Operation::Withdraw,
        Operation::Correct,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Submit => "submit",
            Operation::Approve => "approve",
            Operation::Reject => "reject",
            Operation::ReturnForRevision => "return_for_revision",
            Operation::Cancel => "cancel",
            Operation::Reactivate => "reactivate",
            Operation::Withdraw => "withdraw",
            Operation::Correct => "correct",
        }
    }

    /// Reviewer operations; everything else belongs to owner or creator
    pub fn is_review(self) -> bool {
        matches!(
            self,
            Operation::Approve | Operation::Reject | Operation::ReturnForRevision | Operation::Correct
        )
    }

    pub fn requires_reason(self) -> bool {
        matches!(
            self,
            Operation::Reject | Operation::ReturnForRevision | Operation::Correct
        )
    }

    /// Corrections rewrite an approved entry in place and keep its version
    pub fn bumps_version(self) -> bool {
        self != Operation::Correct
    }

    /// Past participle used in messages ("... dürfen nicht freigegeben werden")
    pub fn participle(self) -> &'static str {
        match self {
            Operation::Submit => "eingereicht",
            Operation::Approve => "freigegeben",
            Operation::Reject => "abgelehnt",
            Operation::ReturnForRevision => "zur Klärung zurückgegeben",
            Operation::Cancel => "storniert",
            Operation::Reactivate => "reaktiviert",
            Operation::Withdraw => "zurückgezogen",
            Operation::Correct => "korrigiert",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_rows() {
        use EntryStatus::*;
        use Operation::*;

        assert_eq!(Entwurf.transition(Submit), Some(Eingereicht));
        assert_eq!(Eingereicht.transition(Approve), Some(Freigegeben));
        assert_eq!(InKlaerung.transition(Approve), Some(Freigegeben));
        assert_eq!(Eingereicht.transition(Reject), Some(Abgelehnt));
        assert_eq!(InKlaerung.transition(Reject), Some(Abgelehnt));
        assert_eq!(Eingereicht.transition(ReturnForRevision), Some(InKlaerung));
        assert_eq!(Eingereicht.transition(Cancel), Some(Storniert));
        assert_eq!(Storniert.transition(Reactivate), Some(Eingereicht));
        assert_eq!(Eingereicht.transition(Withdraw), Some(Entwurf));
        assert_eq!(InKlaerung.transition(Withdraw), Some(Entwurf));
        assert_eq!(Freigegeben.transition(Correct), Some(Freigegeben));
    }

    #[test]
    fn test_terminal_states_only_allow_correction() {
        for op in Operation::ALL {
            let expected = (op == Operation::Correct).then_some(EntryStatus::Freigegeben);
            assert_eq!(EntryStatus::Freigegeben.transition(op), expected, "{op}");
            assert_eq!(EntryStatus::Abgelehnt.transition(op), None, "{op}");
        }
    }

    #[test]
    fn test_draft_only_allows_submit() {
        for op in Operation::ALL {
            let allowed = EntryStatus::Entwurf.transition(op).is_some();
            assert_eq!(allowed, op == Operation::Submit, "{op}");
        }
    }

    #[test]
    fn test_clarification_cannot_be_returned_again() {
        assert_eq!(
            EntryStatus::InKlaerung.transition(Operation::ReturnForRevision),
            None
        );
        assert_eq!(EntryStatus::InKlaerung.transition(Operation::Cancel), None);
    }

    #[test]
    fn test_status_names_round_trip() {
        for status in EntryStatus::ALL {
            assert_eq!(status.as_str().parse::<EntryStatus>().unwrap(), status);
        }
        assert!("archiviert".parse::<EntryStatus>().is_err());
    }

    #[test]
    fn test_only_correct_keeps_version() {
        for op in Operation::ALL {
            assert_eq!(op.bumps_version(), op != Operation::Correct);
        }
    }
}
