//! Loan lifecycle states and the guards between them
//!
//! The lifecycle is strictly linear and irreversible:
//! `Proposed -> Approved -> Invested -> Disbursed`. Nothing in here touches
//! storage, so every guard can be evaluated against an in-memory [`Loan`].
use crate::error::TransitionError;
use crate::loan::Loan;
use std::fmt;
use std::str::FromStr;

#[derive(
    minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub enum LoanState {
    #[n(0)]
    Proposed,
    #[n(1)]
    Approved,
    #[n(2)]
    Invested,
    #[n(3)]
    Disbursed,
}

impl LoanState {
    pub const ALL: [LoanState; 4] = [
        LoanState::Proposed,
        LoanState::Approved,
        LoanState::Invested,
        LoanState::Disbursed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LoanState::Proposed => "proposed",
            LoanState::Approved => "approved",
            LoanState::Invested => "invested",
            LoanState::Disbursed => "disbursed",
        }
    }

    /// True iff `raw` names one of the four lifecycle states.
    pub fn is_valid(raw: &str) -> bool {
        raw.parse::<LoanState>().is_ok()
    }

    /// The fixed successor set of a state. Disbursed is terminal.
    pub fn successors(&self) -> &'static [LoanState] {
        match self {
            LoanState::Proposed => &[LoanState::Approved],
            LoanState::Approved => &[LoanState::Invested],
            LoanState::Invested => &[LoanState::Disbursed],
            LoanState::Disbursed => &[],
        }
    }

    pub fn can_transition(&self, target: LoanState) -> bool {
        self.successors().contains(&target)
    }

    pub fn is_terminal(&self) -> bool {
        self.successors().is_empty()
    }
}

impl fmt::Display for LoanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoanState {
    type Err = TransitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LoanState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| TransitionError::InvalidState(s.to_string()))
    }
}

/// Checks that `loan` may move to `target`, naming the first guard that fails.
///
/// The target-specific guards run before the successor-table check so the
/// caller sees the business rule ("must be in invested state ...") rather
/// than the generic "cannot transition" message. The table check still runs
/// and is what rejects a target that no state leads to.
pub fn validate_transition(loan: &Loan, target: LoanState) -> Result<(), TransitionError> {
    match target {
        LoanState::Approved => validate_approval(loan)?,
        LoanState::Invested => validate_investment(loan)?,
        LoanState::Disbursed => validate_disbursement(loan)?,
        LoanState::Proposed => {}
    }

    if !loan.state.can_transition(target) {
        return Err(TransitionError::Illegal {
            from: loan.state,
            to: target,
        });
    }

    Ok(())
}

/// Parses an untyped target state then validates the transition.
pub fn validate_transition_to(loan: &Loan, target: &str) -> Result<LoanState, TransitionError> {
    let target = target.parse::<LoanState>()?;
    validate_transition(loan, target)?;
    Ok(target)
}

fn validate_approval(loan: &Loan) -> Result<(), TransitionError> {
    require_state(loan, LoanState::Proposed, "be approved")
}

fn validate_investment(loan: &Loan) -> Result<(), TransitionError> {
    require_state(loan, LoanState::Approved, "receive investments")
}

fn validate_disbursement(loan: &Loan) -> Result<(), TransitionError> {
    require_state(loan, LoanState::Invested, "be disbursed")?;

    if !loan.is_fully_invested() {
        return Err(TransitionError::NotFullyInvested {
            required: loan.principal_amount,
            invested: loan.total_invested,
        });
    }
    if loan.agreement_reference.as_deref().is_none_or(str::is_empty) {
        return Err(TransitionError::MissingAgreement);
    }

    Ok(())
}

fn require_state(
    loan: &Loan,
    required: LoanState,
    action: &'static str,
) -> Result<(), TransitionError> {
    if loan.state != required {
        return Err(TransitionError::WrongState {
            required,
            current: loan.state,
            action,
        });
    }
    Ok(())
}
