//! Background delivery of investor agreement notices
//!
//! A pass reads every investment still owed a notice on an Invested loan,
//! sends one message per investment, and only then marks it sent. A crash
//! between the send and the mark means the investor is notified again on the
//! next pass.
use crate::channel::{AgreementNotice, NotificationChannel};
use crate::error::LoanError;
use crate::ledger::Ledger;
use crate::loan::{Borrower, Id, Investment, Loan, Notification, TimeStamp};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub const NOTIFICATION_KIND: &str = "agreement_notification";

pub struct NotificationScheduler {
    ledger: Arc<Ledger>,
    channel: Arc<dyn NotificationChannel>,
    audit: Arc<dyn AuditLog>,
    interval: Duration,
}

/// Where delivered notices are recorded. The ledger's `notifications` tree
/// unless replaced with [`NotificationScheduler::with_audit_log`].
pub trait AuditLog: Send + Sync {
    fn record(&self, notification: &Notification) -> Result<(), LoanError>;
}

impl AuditLog for Ledger {
    fn record(&self, notification: &Notification) -> Result<(), LoanError> {
        self.record_notification(notification)
    }
}

/// Outcome of one pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassReport {
    pub pending: usize,
    pub sent: usize,
    pub failed: usize,
    /// Set when the pass stopped early on cancellation.
    pub cancelled: bool,
}

// pending investments bucketed by loan, buckets in first-seen order
fn group_by_loan(pending: Vec<Investment>) -> Vec<(Id, Vec<Investment>)> {
    let mut groups: Vec<(Id, Vec<Investment>)> = Vec::new();
    for investment in pending {
        match groups.iter_mut().find(|(loan_id, _)| *loan_id == investment.loan_id) {
            Some((_, batch)) => batch.push(investment),
            None => groups.push((investment.loan_id, vec![investment])),
        }
    }
    groups
}

impl NotificationScheduler {
    pub fn new(
        ledger: Arc<Ledger>,
        channel: Arc<dyn NotificationChannel>,
        interval: Duration,
    ) -> Self {
        Self {
            audit: Arc::clone(&ledger) as Arc<dyn AuditLog>,
            ledger,
            channel,
            interval,
        }
    }

    pub fn with_audit_log(mut self, audit: Arc<dyn AuditLog>) -> Self {
        self.audit = audit;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// One scan over the pending set. Per-investment failures are counted and
    /// logged; only a failure to read the pending set fails the pass.
    pub fn run_once(&self, cancel: &CancellationToken) -> Result<PassReport, LoanError> {
        let pending = self.ledger.pending_notifications()?;
        let mut report = PassReport {
            pending: pending.len(),
            ..PassReport::default()
        };
        if pending.is_empty() {
            tracing::debug!("no pending investment notifications");
            return Ok(report);
        }
        tracing::info!(count = pending.len(), "processing pending investment notifications");

        for (loan_id, batch) in group_by_loan(pending) {
            if cancel.is_cancelled() {
                tracing::warn!(sent = report.sent, "notification pass cancelled");
                report.cancelled = true;
                break;
            }
            self.notify_loan(&loan_id, &batch, &mut report);
        }

        tracing::info!(
            sent = report.sent,
            failed = report.failed,
            "notification pass finished"
        );
        Ok(report)
    }

    fn notify_loan(&self, loan_id: &Id, batch: &[Investment], report: &mut PassReport) {
        let context = self.ledger.loan(loan_id).and_then(|loan| {
            let borrower = self.ledger.borrower(&loan.borrower_id)?;
            Ok((loan, borrower))
        });
        let (loan, borrower) = match context {
            Ok(context) => context,
            Err(e) => {
                tracing::error!(loan_id = %loan_id, error = %e, "failed to load loan for notifications");
                report.failed += batch.len();
                return;
            }
        };

        for investment in batch {
            match self.notify_investor(investment, &loan, &borrower) {
                Ok(()) => report.sent += 1,
                Err(e) => {
                    tracing::error!(
                        investment_id = %investment.id,
                        loan_id = %loan_id,
                        error = %e,
                        "failed to deliver agreement notification"
                    );
                    report.failed += 1;
                }
            }
        }
    }

    fn notify_investor(
        &self,
        investment: &Investment,
        loan: &Loan,
        borrower: &Borrower,
    ) -> Result<(), LoanError> {
        let investor = self.ledger.investor(&investment.investor_id)?;
        let notice = AgreementNotice::render(investment, loan, &investor, borrower);

        self.channel
            .send(&investor.email, &notice.subject, &notice.body)?;

        let sent_at = TimeStamp::new();
        self.ledger
            .mark_agreement_sent(&investment.id, sent_at.clone())?;

        // the mark above is what counts; a lost audit row is only logged
        let record = Notification {
            id: Id::new(),
            investor_id: investor.id,
            loan_id: loan.id,
            kind: NOTIFICATION_KIND.to_string(),
            subject: notice.subject,
            body: notice.body,
            sent_at,
            status: "sent".to_string(),
        };
        if let Err(e) = self.audit.record(&record) {
            tracing::warn!(investment_id = %investment.id, error = %e, "failed to record notification");
        }

        tracing::info!(
            investment_id = %investment.id,
            investor = %investor.email,
            "agreement notification sent"
        );
        Ok(())
    }

    /// Runs a pass every interval until `cancel` fires. Passes run on the
    /// blocking pool since the ledger and channels are synchronous.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            "notification scheduler started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let scheduler = Arc::clone(&self);
                    let token = cancel.clone();
                    let pass = tokio::task::spawn_blocking(move || scheduler.run_once(&token)).await;
                    match pass {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => tracing::error!(error = %e, "notification pass failed"),
                        Err(e) => tracing::error!(error = %e, "notification pass panicked"),
                    }
                }
            }
        }

        tracing::info!("notification scheduler stopped");
    }
}
