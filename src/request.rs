//! Inbound requests and the checks run on them before any domain logic
use crate::error::ValidationError;
use crate::loan::{FileType, Id, Loan, Rate, TimeStamp};
use chrono::Utc;

// Used for constructing proposals, much like a draft.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct LoanProposal {
    borrower_id: Option<Id>,
    principal_amount: u64, // Use integers for currency
    interest_rate: Option<f64>,
    roi: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalRequest {
    pub validator_id: Id,
    pub approval_date: TimeStamp<Utc>,
    pub visit_proof_reference: String,
    pub visit_proof_type: FileType,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvestmentRequest {
    pub investor_id: Id,
    pub amount: u64,
    pub investment_date: TimeStamp<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisbursementRequest {
    pub field_officer_id: Id,
    pub disbursement_date: TimeStamp<Utc>,
    pub signed_agreement_reference: String,
    pub signed_agreement_type: FileType,
    pub disbursed_amount: u64,
    pub notes: Option<String>,
}

impl LoanProposal {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_borrower(mut self, borrower_id: Id) -> Self {
        self.borrower_id = Some(borrower_id);
        self
    }
    pub fn set_principal_amount(mut self, amount: u64) -> Self {
        self.principal_amount = amount;
        self
    }
    pub fn set_interest_rate(mut self, rate: f64) -> Self {
        self.interest_rate = Some(rate);
        self
    }
    pub fn set_roi(mut self, roi: f64) -> Self {
        self.roi = Some(roi);
        self
    }
    pub fn borrower_id(&self) -> Option<Id> {
        self.borrower_id
    }
    /// Checks every intake rule and produces the loan to be inserted.
    pub fn validate_and_finalise(&self) -> Result<Loan, ValidationError> {
        let borrower_id = self
            .borrower_id
            .ok_or(ValidationError::MissingField("borrower_id"))?;

        if self.principal_amount == 0 {
            return Err(ValidationError::PrincipalNotPositive);
        }

        let raw_rate = self
            .interest_rate
            .ok_or(ValidationError::MissingField("interest_rate"))?;
        let raw_roi = self.roi.ok_or(ValidationError::MissingField("roi"))?;
        let interest_rate =
            Rate::from_fraction(raw_rate).ok_or(ValidationError::RateOutOfRange("interest_rate"))?;
        let roi = Rate::from_fraction(raw_roi).ok_or(ValidationError::RateOutOfRange("roi"))?;

        // compared before rounding to basis points
        if raw_roi > raw_rate {
            return Err(ValidationError::RoiAboveInterestRate);
        }

        Ok(Loan::new(borrower_id, self.principal_amount, interest_rate, roi))
    }
}

impl ApprovalRequest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.visit_proof_reference.trim().is_empty() {
            return Err(ValidationError::MissingField("visit_proof_reference"));
        }
        if self.approval_date.is_future() {
            return Err(ValidationError::FutureDate("Approval date"));
        }
        Ok(())
    }
}

impl InvestmentRequest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.amount == 0 {
            return Err(ValidationError::InvestmentNotPositive);
        }
        if self.investment_date.is_future() {
            return Err(ValidationError::FutureDate("Investment date"));
        }
        Ok(())
    }
}

impl DisbursementRequest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.disbursed_amount == 0 {
            return Err(ValidationError::DisbursementNotPositive);
        }
        if self.signed_agreement_reference.trim().is_empty() {
            return Err(ValidationError::MissingField("signed_agreement_reference"));
        }
        if self.disbursement_date.is_future() {
            return Err(ValidationError::FutureDate("Disbursement date"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::LoanState;

    fn proposal() -> LoanProposal {
        LoanProposal::new()
            .set_borrower(Id::new())
            .set_principal_amount(10_000)
            .set_interest_rate(0.10)
            .set_roi(0.05)
    }

    #[test]
    fn valid_proposal_starts_proposed_and_unfunded() {
        let loan = proposal().validate_and_finalise().unwrap();
        assert_eq!(loan.state, LoanState::Proposed);
        assert_eq!(loan.total_invested, 0);
        assert_eq!(loan.interest_rate, Rate::from_bps(1_000));
        assert_eq!(loan.roi, Rate::from_bps(500));
    }

    #[test]
    fn proposal_rules() {
        assert_eq!(
            proposal().set_principal_amount(0).validate_and_finalise(),
            Err(ValidationError::PrincipalNotPositive)
        );
        assert_eq!(
            proposal().set_interest_rate(1.5).validate_and_finalise(),
            Err(ValidationError::RateOutOfRange("interest_rate"))
        );
        assert_eq!(
            proposal().set_roi(-0.2).validate_and_finalise(),
            Err(ValidationError::RateOutOfRange("roi"))
        );
        assert_eq!(
            proposal().set_roi(0.11).validate_and_finalise(),
            Err(ValidationError::RoiAboveInterestRate)
        );
        assert_eq!(
            LoanProposal::new().validate_and_finalise(),
            Err(ValidationError::MissingField("borrower_id"))
        );
        // ROI equal to the rate is allowed
        assert!(proposal().set_roi(0.10).validate_and_finalise().is_ok());
    }

    #[test]
    fn roi_just_above_rate_is_refused_even_if_it_rounds_equal() {
        assert_eq!(Rate::from_fraction(0.10004), Rate::from_fraction(0.10));
        assert_eq!(
            proposal()
                .set_interest_rate(0.10)
                .set_roi(0.10004)
                .validate_and_finalise(),
            Err(ValidationError::RoiAboveInterestRate)
        );
    }

    #[test]
    fn future_dates_are_refused() {
        let tomorrow: TimeStamp<Utc> = (Utc::now() + chrono::Duration::days(1)).into();

        let investment = InvestmentRequest {
            investor_id: Id::new(),
            amount: 100,
            investment_date: tomorrow.clone(),
        };
        assert_eq!(
            investment.validate(),
            Err(ValidationError::FutureDate("Investment date"))
        );
        assert_eq!(
            ValidationError::FutureDate("Investment date").to_string(),
            "Investment date cannot be in the future"
        );

        let approval = ApprovalRequest {
            validator_id: Id::new(),
            approval_date: tomorrow,
            visit_proof_reference: "visit.jpg".into(),
            visit_proof_type: FileType::Jpeg,
            notes: None,
        };
        assert_eq!(
            approval.validate(),
            Err(ValidationError::FutureDate("Approval date"))
        );
    }

    #[test]
    fn zero_amounts_are_refused() {
        let investment = InvestmentRequest {
            investor_id: Id::new(),
            amount: 0,
            investment_date: TimeStamp::new(),
        };
        assert_eq!(
            investment.validate(),
            Err(ValidationError::InvestmentNotPositive)
        );

        let disbursement = DisbursementRequest {
            field_officer_id: Id::new(),
            disbursement_date: TimeStamp::new(),
            signed_agreement_reference: "signed.pdf".into(),
            signed_agreement_type: FileType::Pdf,
            disbursed_amount: 0,
            notes: None,
        };
        assert_eq!(
            disbursement.validate(),
            Err(ValidationError::DisbursementNotPositive)
        );
    }
}
