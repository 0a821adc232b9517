//! Racing investors against a single loan
//!
//! Every test spawns real OS threads that call `invest` on the same loan at
//! the same time. Whatever interleaving sled picks, the committed total must
//! never pass the principal and the loan must advance to Invested at most once.

use anyhow::Context;
use sled::open;
use std::sync::{Arc, Barrier};
use std::thread;

use loan_lifecycle::channel::MockPayment;
use loan_lifecycle::error::ErrorKind;
use loan_lifecycle::ledger::Ledger;
use loan_lifecycle::loan::{Borrower, FileType, Id, Investor, TimeStamp};
use loan_lifecycle::request::{ApprovalRequest, InvestmentRequest, LoanProposal};
use loan_lifecycle::service::{InvestmentOutcome, LoanService};
use loan_lifecycle::state::LoanState;

use tempfile::{TempDir, tempdir};

fn approved_loan(name: &str, principal: u64) -> anyhow::Result<(TempDir, LoanService, Id)> {
    let temp_dir = tempdir()?;
    let db = open(temp_dir.path().join(name))?;
    let ledger = Arc::new(Ledger::new(Arc::new(db))?);

    let borrower = Borrower {
        id: Id::new(),
        id_number: "3201".into(),
        first_name: "Budi".into(),
        last_name: "Santoso".into(),
        email: "budi@example.com".into(),
        phone_number: "0812".into(),
    };
    ledger.register_borrower(&borrower)?;

    let service = LoanService::new(ledger, Arc::new(MockPayment), "https://docs.example.com");
    let summary = service.propose(
        LoanProposal::new()
            .set_borrower(borrower.id)
            .set_principal_amount(principal)
            .set_interest_rate(0.12)
            .set_roi(0.08),
    )?;
    service
        .approve(
            &summary.id,
            ApprovalRequest {
                validator_id: Id::new(),
                approval_date: TimeStamp::new(),
                visit_proof_reference: "visit.png".into(),
                visit_proof_type: FileType::Png,
                notes: None,
            },
        )
        .context("Loan Failed on Approval: ")?;

    Ok((temp_dir, service, summary.id))
}

fn investors(service: &LoanService, count: usize) -> anyhow::Result<Vec<Investor>> {
    (0..count)
        .map(|i| {
            let investor = Investor {
                id: Id::new(),
                investor_code: format!("INV-{i}"),
                name: format!("Investor {i}"),
                email: format!("investor{i}@example.com"),
                is_active: true,
            };
            service.ledger().register_investor(&investor)?;
            Ok(investor)
        })
        .collect()
}

fn race(
    service: &LoanService,
    loan_id: Id,
    investors: &[Investor],
    amount: u64,
) -> Vec<Result<InvestmentOutcome, loan_lifecycle::LoanError>> {
    let barrier = Barrier::new(investors.len());
    thread::scope(|scope| {
        let handles: Vec<_> = investors
            .iter()
            .map(|investor| {
                let barrier = &barrier;
                scope.spawn(move || {
                    barrier.wait();
                    service.invest(
                        &loan_id,
                        InvestmentRequest {
                            investor_id: investor.id,
                            amount,
                            investment_date: TimeStamp::new(),
                        },
                    )
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("investor thread panicked"))
            .collect()
    })
}

#[test]
fn exact_subscription_all_succeed_and_advance_once() -> anyhow::Result<()> {
    let (_dir, service, loan_id) = approved_loan("test_exact_race.db", 10_000)?;
    let investors = investors(&service, 10)?;

    let results = race(&service, loan_id, &investors, 1_000);

    assert!(results.iter().all(|r| r.is_ok()));
    let advanced = results
        .iter()
        .filter(|r| r.as_ref().is_ok_and(|o| o.advanced))
        .count();
    assert_eq!(advanced, 1);

    let loan = service.ledger().loan(&loan_id)?;
    assert_eq!(loan.total_invested, 10_000);
    assert_eq!(loan.state, LoanState::Invested);
    assert!(loan.agreement_reference.is_some());
    assert_eq!(service.ledger().investments_for_loan(&loan_id)?.len(), 10);

    let to_invested = service
        .ledger()
        .state_history(&loan_id)?
        .into_iter()
        .filter(|c| c.new_state == LoanState::Invested)
        .count();
    assert_eq!(to_invested, 1);

    Ok(())
}

#[test]
fn oversubscription_never_passes_the_principal() -> anyhow::Result<()> {
    let (_dir, service, loan_id) = approved_loan("test_over_race.db", 10_000)?;
    let investors = investors(&service, 8)?;

    let results = race(&service, loan_id, &investors, 3_000);

    let accepted: u64 = results
        .iter()
        .filter_map(|r| r.as_ref().ok())
        .map(|o| o.investment.amount)
        .sum();
    let rejected: Vec<_> = results.iter().filter_map(|r| r.as_ref().err()).collect();

    assert_eq!(accepted, 9_000);
    assert!(!rejected.is_empty());
    assert!(
        rejected
            .iter()
            .all(|e| e.kind() == ErrorKind::ConstraintViolation)
    );

    let loan = service.ledger().loan(&loan_id)?;
    assert!(loan.total_invested <= loan.principal_amount);
    assert_eq!(loan.total_invested, accepted);
    assert_eq!(loan.state, LoanState::Approved);

    let stored: u64 = service
        .ledger()
        .investments_for_loan(&loan_id)?
        .iter()
        .map(|i| i.amount)
        .sum();
    assert_eq!(stored, accepted);

    Ok(())
}

#[test]
fn racers_past_the_filling_investment_are_refused() -> anyhow::Result<()> {
    let (_dir, service, loan_id) = approved_loan("test_fill_race.db", 10_000)?;
    let investors = investors(&service, 12)?;

    let results = race(&service, loan_id, &investors, 1_000);

    let accepted: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    let rejected: Vec<_> = results.iter().filter_map(|r| r.as_ref().err()).collect();
    assert_eq!(accepted.len(), 10);
    assert_eq!(rejected.len(), 2);
    assert_eq!(accepted.iter().filter(|o| o.advanced).count(), 1);
    assert!(
        rejected
            .iter()
            .all(|e| e.kind() == ErrorKind::ConstraintViolation)
    );

    let loan = service.ledger().loan(&loan_id)?;
    assert_eq!(loan.total_invested, loan.principal_amount);
    assert_eq!(loan.state, LoanState::Invested);
    assert_eq!(service.ledger().investments_for_loan(&loan_id)?.len(), 10);

    Ok(())
}
