//! Service layer API for loan workflow operations
//!
//! Each operation is one ledger transaction: load, guard, write, commit. A
//! failure anywhere before commit leaves nothing behind. Collaborators with
//! side effects outside the ledger (payment) are only called once the
//! transaction has committed.
use crate::channel::{PaymentChannel, PaymentResult};
use crate::error::{LoanError, RejectReason, ValidationError, abort};
use crate::ledger::{Ledger, LedgerTx, TxResult};
use crate::loan::{Approval, Disbursement, Id, Investment, Loan, LoanSummary, TimeStamp};
use crate::request::{ApprovalRequest, DisbursementRequest, InvestmentRequest, LoanProposal};
use crate::state::{self, LoanState};
use crate::utils;
use std::sync::Arc;
use std::time::Instant;

pub const REASON_APPROVED: &str = "Loan approved";
pub const REASON_FULLY_FUNDED: &str = "Investment target achieved";
pub const REASON_DISBURSED: &str = "Loan disbursed";

#[derive(Clone)]
pub struct LoanService {
    ledger: Arc<Ledger>,
    payment: Arc<dyn PaymentChannel>,
    agreement_base_url: String,
    deadline: Option<Instant>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvestmentOutcome {
    pub investment: Investment,
    /// The loan as committed by this investment.
    pub loan: Loan,
    /// Whether this investment filled the loan and moved it to Invested.
    pub advanced: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisbursementReceipt {
    pub disbursement: Disbursement,
    pub payment: PaymentResult,
}

impl LoanService {
    pub fn new(
        ledger: Arc<Ledger>,
        payment: Arc<dyn PaymentChannel>,
        agreement_base_url: impl Into<String>,
    ) -> Self {
        Self {
            ledger,
            payment,
            agreement_base_url: agreement_base_url.into(),
            deadline: None,
        }
    }

    /// A handle whose operations roll back if not committed by `deadline`.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            ..self.clone()
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Loan enriched with borrower details for display.
    pub fn loan_summary(&self, loan_id: &Id) -> Result<LoanSummary, LoanError> {
        let loan = self.ledger.loan(loan_id)?;
        let borrower = self.ledger.borrower(&loan.borrower_id)?;
        let investments = self.ledger.investments_for_loan(loan_id)?;

        Ok(LoanSummary::new(&loan, &borrower, investments.len()))
    }

    /// Propose a new loan. Starts in Proposed with nothing invested.
    pub fn propose(&self, proposal: LoanProposal) -> Result<LoanSummary, LoanError> {
        tracing::info!(proposal = ?proposal, "processing loan proposal");

        let loan = proposal.validate_and_finalise().inspect_err(|e| {
            tracing::error!(error = %e, "loan proposal rejected");
        })?;
        let borrower = self.ledger.borrower(&loan.borrower_id)?;

        self.ledger
            .transaction(self.deadline, |tx| tx.create_loan(&loan))
            .inspect_err(|e| {
                tracing::error!(error = %e, "failed to create loan");
            })?;

        tracing::info!(loan_id = %loan.id, borrower_id = %loan.borrower_id, "loan created");
        Ok(LoanSummary::new(&loan, &borrower, 0))
    }

    /// Approve a loan that is in the Proposed state
    pub fn approve(&self, loan_id: &Id, request: ApprovalRequest) -> Result<Approval, LoanError> {
        tracing::info!(loan_id = %loan_id, validator_id = %request.validator_id, "approving loan");
        request.validate()?;

        let approval = self
            .ledger
            .transaction(self.deadline, |tx| self.approve_tx(tx, loan_id, &request))
            .inspect_err(|e| {
                tracing::error!(loan_id = %loan_id, error = %e, "loan approval rolled back");
            })?;

        tracing::info!(loan_id = %loan_id, approval_id = %approval.id, "loan approved");
        Ok(approval)
    }

    fn approve_tx(
        &self,
        tx: &LedgerTx<'_>,
        loan_id: &Id,
        request: &ApprovalRequest,
    ) -> TxResult<Approval> {
        let loan = tx.loan(loan_id)?;
        state::validate_transition(&loan, LoanState::Approved).map_err(abort)?;

        let approval = Approval {
            id: Id::new(),
            loan_id: *loan_id,
            validator_id: request.validator_id,
            approval_date: request.approval_date.clone(),
            visit_proof_reference: request.visit_proof_reference.clone(),
            visit_proof_type: request.visit_proof_type,
            notes: request.notes.clone(),
            created_at: TimeStamp::new(),
        };
        tx.create_approval(&approval)?;

        let approved = tx.update_loan_state(loan_id, LoanState::Approved)?;
        tx.record_state_history(
            LoanState::Proposed,
            &approved,
            request.validator_id,
            REASON_APPROVED,
        )?;

        Ok(approval)
    }

    /// Commit funds from an investor into an Approved loan. The investment
    /// that fills the loan also moves it to Invested, in the same transaction.
    pub fn invest(
        &self,
        loan_id: &Id,
        request: InvestmentRequest,
    ) -> Result<InvestmentOutcome, LoanError> {
        tracing::info!(
            loan_id = %loan_id,
            investor_id = %request.investor_id,
            amount = request.amount,
            "processing investment"
        );
        request.validate()?;

        let outcome = self
            .ledger
            .transaction(self.deadline, |tx| self.invest_tx(tx, loan_id, &request))
            .inspect_err(|e| {
                tracing::error!(
                    loan_id = %loan_id,
                    amount = request.amount,
                    error = %e,
                    "investment rolled back"
                );
            })?;

        tracing::info!(
            loan_id = %loan_id,
            investment_id = %outcome.investment.id,
            total_invested = outcome.loan.total_invested,
            "investment recorded"
        );
        if outcome.advanced {
            tracing::info!(loan_id = %loan_id, new_state = %outcome.loan.state, "loan fully funded");
        }
        Ok(outcome)
    }

    fn invest_tx(
        &self,
        tx: &LedgerTx<'_>,
        loan_id: &Id,
        request: &InvestmentRequest,
    ) -> TxResult<InvestmentOutcome> {
        let loan = tx.loan(loan_id)?;
        // Fail fast with a precise message. The accumulate guard below is
        // what actually holds the cap under concurrency.
        check_investment(&loan, request.amount).map_err(abort)?;

        let investment = Investment {
            id: Id::new(),
            loan_id: *loan_id,
            investor_id: request.investor_id,
            amount: request.amount,
            investment_date: request.investment_date.clone(),
            expected_return: loan.expected_return(request.amount),
            agreement_sent: false,
            agreement_sent_at: None,
            created_at: TimeStamp::new(),
        };
        tx.create_investment(&investment)?;

        let funded = tx.accumulate_investment(loan_id, request.amount)?;
        if !(funded.is_fully_invested() && funded.state == LoanState::Approved) {
            return Ok(InvestmentOutcome {
                investment,
                loan: funded,
                advanced: false,
            });
        }

        state::validate_transition(&funded, LoanState::Invested).map_err(abort)?;
        let invested = tx.update_loan_state(loan_id, LoanState::Invested)?;
        let reference =
            utils::agreement_reference(&self.agreement_base_url, &invested).map_err(abort)?;
        let invested = tx.set_agreement_reference(loan_id, reference)?;
        tx.record_state_history(
            LoanState::Approved,
            &invested,
            Id::system(),
            REASON_FULLY_FUNDED,
        )?;

        Ok(InvestmentOutcome {
            investment,
            loan: invested,
            advanced: true,
        })
    }

    /// Disburse a fully funded loan, then move the money.
    ///
    /// The payment call happens after the disbursement has committed. If it
    /// fails the loan stays Disbursed and the caller gets
    /// [`LoanError::Payment`] so it can retry the payment.
    pub fn disburse(
        &self,
        loan_id: &Id,
        request: DisbursementRequest,
    ) -> Result<DisbursementReceipt, LoanError> {
        tracing::info!(
            loan_id = %loan_id,
            field_officer_id = %request.field_officer_id,
            amount = request.disbursed_amount,
            "processing disbursement"
        );
        request.validate()?;

        let disbursement = self
            .ledger
            .transaction(self.deadline, |tx| self.disburse_tx(tx, loan_id, &request))
            .inspect_err(|e| {
                tracing::error!(loan_id = %loan_id, error = %e, "disbursement rolled back");
            })?;
        tracing::info!(loan_id = %loan_id, disbursement_id = %disbursement.id, "loan disbursed");

        let token = format!("disbursement_token_{loan_id}");
        let payment = self
            .payment
            .process_payment(request.disbursed_amount, &token)
            .map_err(|source| {
                tracing::error!(
                    loan_id = %loan_id,
                    amount = request.disbursed_amount,
                    error = %source,
                    "payment failed for a committed disbursement"
                );
                LoanError::Payment {
                    loan_id: *loan_id,
                    source,
                }
            })?;

        tracing::info!(
            loan_id = %loan_id,
            transaction_id = %payment.transaction_id,
            status = %payment.status,
            "disbursement payment processed"
        );
        Ok(DisbursementReceipt {
            disbursement,
            payment,
        })
    }

    fn disburse_tx(
        &self,
        tx: &LedgerTx<'_>,
        loan_id: &Id,
        request: &DisbursementRequest,
    ) -> TxResult<Disbursement> {
        let loan = tx.loan(loan_id)?;
        state::validate_transition(&loan, LoanState::Disbursed).map_err(abort)?;

        if request.disbursed_amount != loan.principal_amount {
            return Err(abort(ValidationError::DisbursedAmountMismatch {
                disbursed: request.disbursed_amount,
                principal: loan.principal_amount,
            }));
        }

        let disbursement = Disbursement {
            id: Id::new(),
            loan_id: *loan_id,
            field_officer_id: request.field_officer_id,
            disbursement_date: request.disbursement_date.clone(),
            signed_agreement_reference: request.signed_agreement_reference.clone(),
            signed_agreement_type: request.signed_agreement_type,
            disbursed_amount: request.disbursed_amount,
            notes: request.notes.clone(),
            created_at: TimeStamp::new(),
        };
        tx.create_disbursement(&disbursement)?;

        let disbursed = tx.update_loan_state(loan_id, LoanState::Disbursed)?;
        tx.record_state_history(
            LoanState::Invested,
            &disbursed,
            request.field_officer_id,
            REASON_DISBURSED,
        )?;

        Ok(disbursement)
    }
}

fn check_investment(loan: &Loan, amount: u64) -> Result<(), LoanError> {
    if amount == 0 {
        return Err(ValidationError::InvestmentNotPositive.into());
    }
    // same kind as the accumulate guard
    if loan.state != LoanState::Approved {
        return Err(RejectReason::NotAcceptingInvestments {
            current: loan.state,
        }
        .into());
    }

    let remaining = loan.remaining_investment();
    if amount > remaining {
        return Err(RejectReason::ExceedsRemaining { amount, remaining }.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::loan::Rate;

    fn loan_in(state: LoanState, principal: u64, invested: u64) -> Loan {
        let mut loan = Loan::new(Id::new(), principal, Rate::from_bps(1_000), Rate::from_bps(500));
        loan.state = state;
        loan.total_invested = invested;
        loan
    }

    #[test]
    fn investment_precheck_order() {
        let loan = loan_in(LoanState::Approved, 10_000, 0);
        assert_eq!(
            check_investment(&loan, 0).unwrap_err().kind(),
            ErrorKind::Validation
        );
        assert!(check_investment(&loan, 10_000).is_ok());

        let err = check_investment(&loan, 15_000).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConstraintViolation);
        assert_eq!(
            err.to_string(),
            "investment amount 15000 exceeds remaining amount 10000"
        );

        for state in [LoanState::Proposed, LoanState::Invested, LoanState::Disbursed] {
            let loan = loan_in(state, 10_000, 0);
            let err = check_investment(&loan, 100).unwrap_err();
            assert!(matches!(
                err,
                LoanError::InvestmentRejected(RejectReason::NotAcceptingInvestments { current })
                    if current == state
            ));
            assert_eq!(err.kind(), ErrorKind::ConstraintViolation);
        }
    }

    #[test]
    fn remaining_shrinks_with_prior_investment() {
        let loan = loan_in(LoanState::Approved, 10_000, 6_000);
        assert!(check_investment(&loan, 4_000).is_ok());
        assert!(check_investment(&loan, 4_001).is_err());
    }
}
