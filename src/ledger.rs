//! Durable storage for loans and everything attached to them
//!
//! Every logical table is its own sled tree and every row is CBOR. Writes
//! that must land together go through [`Ledger::transaction`], which opens a
//! serializable sled transaction over the five lifecycle trees and hands the
//! closure a [`LedgerTx`]. Stand-alone calls on [`Ledger`] open their own
//! one-shot transaction and commit immediately.
//!
//! sled may re-run a transaction closure when it detects a conflicting
//! concurrent commit, so closures must stay free of side effects other than
//! the writes they stage.
use crate::error::{LoanError, RejectReason, abort};
use crate::loan::{
    Approval, Borrower, Disbursement, Id, Investment, Investor, Loan, Notification, StateChange,
    TimeStamp,
};
use crate::state::LoanState;
use chrono::Utc;
use sled::Transactional;
use sled::transaction::{ConflictableTransactionResult, TransactionalTree};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

pub type TxResult<T> = ConflictableTransactionResult<T, LoanError>;

pub struct Ledger {
    instance: Arc<sled::Db>,
    loans: sled::Tree,
    approvals: sled::Tree,
    investments: sled::Tree,
    disbursements: sled::Tree,
    history: sled::Tree,
    notifications: sled::Tree,
    borrowers: sled::Tree,
    investors: sled::Tree,
}

/// The lifecycle trees as seen from inside one transaction.
pub struct LedgerTx<'a> {
    loans: &'a TransactionalTree,
    approvals: &'a TransactionalTree,
    investments: &'a TransactionalTree,
    disbursements: &'a TransactionalTree,
    history: &'a TransactionalTree,
}

fn key(id: &Id) -> &[u8] {
    id.as_bytes()
}

// loan id first so a loan's audit trail is one prefix scan, in insertion order
fn history_key(loan_id: &Id, change_id: &Id) -> Vec<u8> {
    let mut k = Vec::with_capacity(32);
    k.extend_from_slice(loan_id.as_bytes());
    k.extend_from_slice(change_id.as_bytes());
    k
}

fn encode<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>, LoanError> {
    Ok(minicbor::to_vec(value)?)
}

fn decode<T>(bytes: &[u8]) -> Result<T, LoanError>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    Ok(minicbor::decode(bytes)?)
}

impl Ledger {
    pub fn new(instance: Arc<sled::Db>) -> Result<Self, LoanError> {
        Ok(Self {
            loans: instance.open_tree("loans")?,
            approvals: instance.open_tree("approvals")?,
            investments: instance.open_tree("investments")?,
            disbursements: instance.open_tree("disbursements")?,
            history: instance.open_tree("state_history")?,
            notifications: instance.open_tree("notifications")?,
            borrowers: instance.open_tree("borrowers")?,
            investors: instance.open_tree("investors")?,
            instance,
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, LoanError> {
        Self::new(Arc::new(sled::open(path)?))
    }

    /// Runs `f` as one all-or-nothing unit. Any error returned from `f`, or
    /// the deadline passing before commit, discards every staged write.
    pub fn transaction<A, F>(&self, deadline: Option<Instant>, f: F) -> Result<A, LoanError>
    where
        F: Fn(&LedgerTx<'_>) -> TxResult<A>,
    {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(LoanError::DeadlineExceeded);
        }

        let trees = (
            &self.loans,
            &self.approvals,
            &self.investments,
            &self.disbursements,
            &self.history,
        );
        let result = trees.transaction(
            |(loans, approvals, investments, disbursements, history)| -> TxResult<A> {
                let tx = LedgerTx {
                    loans,
                    approvals,
                    investments,
                    disbursements,
                    history,
                };
                let value = f(&tx)?;

                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return Err(abort(LoanError::DeadlineExceeded));
                }
                Ok(value)
            },
        );

        result.map_err(LoanError::from)
    }

    pub fn create_loan(&self, loan: &Loan) -> Result<(), LoanError> {
        self.transaction(None, |tx| tx.create_loan(loan))
    }

    /// Live (not soft-deleted) loan by id.
    pub fn loan(&self, id: &Id) -> Result<Loan, LoanError> {
        match self.loans.get(key(id))? {
            Some(bytes) => {
                let loan: Loan = decode(&bytes)?;
                if loan.is_deleted() {
                    return Err(LoanError::not_found("loan", *id));
                }
                Ok(loan)
            }
            None => Err(LoanError::not_found("loan", *id)),
        }
    }

    pub fn soft_delete_loan(&self, id: &Id) -> Result<Loan, LoanError> {
        self.transaction(None, |tx| {
            let mut loan = tx.loan(id)?;
            let now = TimeStamp::new();
            loan.deleted_at = Some(now.clone());
            loan.updated_at = now;
            tx.put_loan(&loan)?;
            Ok(loan)
        })
    }

    pub fn accumulate_investment(&self, loan_id: &Id, delta: u64) -> Result<Loan, LoanError> {
        self.transaction(None, |tx| tx.accumulate_investment(loan_id, delta))
    }

    pub fn approval(&self, loan_id: &Id) -> Result<Option<Approval>, LoanError> {
        self.approvals
            .get(key(loan_id))?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    pub fn disbursement(&self, loan_id: &Id) -> Result<Option<Disbursement>, LoanError> {
        self.disbursements
            .get(key(loan_id))?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    pub fn investment(&self, id: &Id) -> Result<Investment, LoanError> {
        match self.investments.get(key(id))? {
            Some(bytes) => decode(&bytes),
            None => Err(LoanError::not_found("investment", *id)),
        }
    }

    pub fn investments_for_loan(&self, loan_id: &Id) -> Result<Vec<Investment>, LoanError> {
        let mut found = Vec::new();
        for entry in self.investments.iter() {
            let (_, bytes) = entry?;
            let investment: Investment = decode(&bytes)?;
            if investment.loan_id == *loan_id {
                found.push(investment);
            }
        }
        Ok(found)
    }

    /// Every recorded transition of a loan, oldest first.
    pub fn state_history(&self, loan_id: &Id) -> Result<Vec<StateChange>, LoanError> {
        self.history
            .scan_prefix(key(loan_id))
            .map(|entry| {
                let (_, bytes) = entry?;
                decode(&bytes)
            })
            .collect()
    }

    /// Investments still owed an agreement notification, on live loans that
    /// have reached Invested, oldest first.
    pub fn pending_notifications(&self) -> Result<Vec<Investment>, LoanError> {
        let mut loan_ready: HashMap<Id, bool> = HashMap::new();
        let mut pending = Vec::new();

        // uuid7 keys iterate in creation order
        for entry in self.investments.iter() {
            let (_, bytes) = entry?;
            let investment: Investment = decode(&bytes)?;
            if investment.agreement_sent {
                continue;
            }

            let ready = match loan_ready.get(&investment.loan_id) {
                Some(ready) => *ready,
                None => {
                    let ready = match self.loan(&investment.loan_id) {
                        Ok(loan) => loan.state == LoanState::Invested,
                        Err(LoanError::NotFound { .. }) => false,
                        Err(err) => return Err(err),
                    };
                    loan_ready.insert(investment.loan_id, ready);
                    ready
                }
            };
            if ready {
                pending.push(investment);
            }
        }

        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(pending)
    }

    pub fn mark_agreement_sent(
        &self,
        investment_id: &Id,
        sent_at: TimeStamp<Utc>,
    ) -> Result<Investment, LoanError> {
        self.transaction(None, |tx| tx.mark_agreement_sent(investment_id, sent_at.clone()))
    }

    pub fn record_notification(&self, notification: &Notification) -> Result<(), LoanError> {
        self.notifications
            .insert(key(&notification.id), encode(notification)?)?;
        Ok(())
    }

    pub fn notifications(&self) -> Result<Vec<Notification>, LoanError> {
        self.notifications
            .iter()
            .map(|entry| {
                let (_, bytes) = entry?;
                decode(&bytes)
            })
            .collect()
    }

    pub fn register_borrower(&self, borrower: &Borrower) -> Result<(), LoanError> {
        self.borrowers.insert(key(&borrower.id), encode(borrower)?)?;
        Ok(())
    }

    pub fn borrower(&self, id: &Id) -> Result<Borrower, LoanError> {
        match self.borrowers.get(key(id))? {
            Some(bytes) => decode(&bytes),
            None => Err(LoanError::not_found("borrower", *id)),
        }
    }

    pub fn register_investor(&self, investor: &Investor) -> Result<(), LoanError> {
        self.investors.insert(key(&investor.id), encode(investor)?)?;
        Ok(())
    }

    pub fn investor(&self, id: &Id) -> Result<Investor, LoanError> {
        match self.investors.get(key(id))? {
            Some(bytes) => decode(&bytes),
            None => Err(LoanError::not_found("investor", *id)),
        }
    }

    pub fn flush(&self) -> Result<(), LoanError> {
        self.instance.flush()?;
        Ok(())
    }
}

impl LedgerTx<'_> {
    fn read_loan(&self, id: &Id) -> TxResult<Option<Loan>> {
        match self.loans.get(key(id))? {
            Some(bytes) => Ok(Some(decode(&bytes).map_err(abort)?)),
            None => Ok(None),
        }
    }

    fn put_loan(&self, loan: &Loan) -> TxResult<()> {
        self.loans
            .insert(key(&loan.id), encode(loan).map_err(abort)?)?;
        Ok(())
    }

    pub fn create_loan(&self, loan: &Loan) -> TxResult<()> {
        self.put_loan(loan)
    }

    /// Live loan as of this transaction's snapshot.
    pub fn loan(&self, id: &Id) -> TxResult<Loan> {
        match self.read_loan(id)? {
            Some(loan) if !loan.is_deleted() => Ok(loan),
            _ => Err(abort(LoanError::not_found("loan", *id))),
        }
    }

    pub fn update_loan_state(&self, id: &Id, state: LoanState) -> TxResult<Loan> {
        let mut loan = self.loan(id)?;
        loan.state = state;
        loan.updated_at = TimeStamp::new();
        self.put_loan(&loan)?;
        Ok(loan)
    }

    pub fn set_agreement_reference(&self, id: &Id, reference: String) -> TxResult<Loan> {
        let mut loan = self.loan(id)?;
        loan.agreement_reference = Some(reference);
        loan.updated_at = TimeStamp::new();
        self.put_loan(&loan)?;
        Ok(loan)
    }

    /// Appends the audit row for a transition `loan` has just made.
    pub fn record_state_history(
        &self,
        previous_state: LoanState,
        loan: &Loan,
        changed_by: Id,
        reason: &str,
    ) -> TxResult<StateChange> {
        let change = StateChange {
            id: Id::new(),
            loan_id: loan.id,
            previous_state,
            new_state: loan.state,
            changed_by,
            reason: reason.to_string(),
            changed_at: TimeStamp::new(),
        };
        self.history.insert(
            history_key(&loan.id, &change.id),
            encode(&change).map_err(abort)?,
        )?;
        Ok(change)
    }

    pub fn create_approval(&self, approval: &Approval) -> TxResult<()> {
        self.approvals
            .insert(key(&approval.loan_id), encode(approval).map_err(abort)?)?;
        Ok(())
    }

    pub fn create_investment(&self, investment: &Investment) -> TxResult<()> {
        self.investments
            .insert(key(&investment.id), encode(investment).map_err(abort)?)?;
        Ok(())
    }

    pub fn create_disbursement(&self, disbursement: &Disbursement) -> TxResult<()> {
        self.disbursements.insert(
            key(&disbursement.loan_id),
            encode(disbursement).map_err(abort)?,
        )?;
        Ok(())
    }

    /// Adds `delta` to the loan's invested total, but only if the loan is
    /// live, Approved, and the new total stays within the principal. Guard and
    /// write commit together or not at all; sled retries this closure when a
    /// concurrent transaction touched the same row, so two racing investors
    /// can never both pass the cap.
    pub fn accumulate_investment(&self, loan_id: &Id, delta: u64) -> TxResult<Loan> {
        let Some(mut loan) = self.read_loan(loan_id)? else {
            return Err(abort(RejectReason::NotApplied));
        };
        if loan.is_deleted() || loan.state != LoanState::Approved {
            return Err(abort(RejectReason::NotApplied));
        }
        let Some(total) = loan
            .total_invested
            .checked_add(delta)
            .filter(|total| *total <= loan.principal_amount)
        else {
            tracing::debug!(loan_id = %loan_id, delta, "accumulate guard rejected investment");
            return Err(abort(RejectReason::NotApplied));
        };

        loan.total_invested = total;
        loan.updated_at = TimeStamp::new();
        self.put_loan(&loan)?;
        Ok(loan)
    }

    pub fn mark_agreement_sent(
        &self,
        investment_id: &Id,
        sent_at: TimeStamp<Utc>,
    ) -> TxResult<Investment> {
        let mut investment: Investment = match self.investments.get(key(investment_id))? {
            Some(bytes) => decode(&bytes).map_err(abort)?,
            None => return Err(abort(LoanError::not_found("investment", *investment_id))),
        };
        investment.agreement_sent = true;
        investment.agreement_sent_at = Some(sent_at);
        self.create_investment(&investment)?;
        Ok(investment)
    }
}
