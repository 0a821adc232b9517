//! Payment and notification collaborators
//!
//! The workflow only depends on the two traits below. The built-in `mock`
//! providers log through `tracing` and always succeed; real providers live
//! outside this crate and are plugged in behind the same traits.
use crate::config::{EmailConfig, PaymentConfig};
use crate::error::ChannelError;
use crate::loan::{Borrower, Id, Investment, Investor, Loan};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentResult {
    pub transaction_id: String,
    pub status: String,
    pub message: String,
}

/// Moves funds for an already recorded disbursement.
pub trait PaymentChannel: Send + Sync {
    fn process_payment(&self, amount: u64, token: &str) -> Result<PaymentResult, ChannelError>;
}

/// Delivers a message to one recipient.
pub trait NotificationChannel: Send + Sync {
    fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<(), ChannelError>;
}

#[derive(Debug, Default)]
pub struct MockPayment;

#[derive(Debug)]
pub struct MockMailer {
    from_address: String,
}

impl PaymentChannel for MockPayment {
    fn process_payment(&self, amount: u64, token: &str) -> Result<PaymentResult, ChannelError> {
        let transaction_id = format!("mock_txn_{}", Id::new().short());
        tracing::info!(amount, token, %transaction_id, "mock payment processed");

        Ok(PaymentResult {
            transaction_id,
            status: "success".to_string(),
            message: "Payment processed successfully (mock)".to_string(),
        })
    }
}

impl MockMailer {
    pub fn new(from_address: impl Into<String>) -> Self {
        Self {
            from_address: from_address.into(),
        }
    }
}

impl NotificationChannel for MockMailer {
    fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<(), ChannelError> {
        tracing::info!(
            from = %self.from_address,
            to = recipient,
            subject,
            body_len = body.len(),
            "mock email sent"
        );
        Ok(())
    }
}

pub fn payment_from_config(config: &PaymentConfig) -> Result<Arc<dyn PaymentChannel>, ChannelError> {
    match config.provider.as_str() {
        "mock" => Ok(Arc::new(MockPayment)),
        other => Err(ChannelError::UnsupportedProvider {
            channel: "payment",
            provider: other.to_string(),
        }),
    }
}

pub fn mailer_from_config(
    config: &EmailConfig,
) -> Result<Arc<dyn NotificationChannel>, ChannelError> {
    match config.provider.as_str() {
        "mock" => Ok(Arc::new(MockMailer::new(config.from_address.clone()))),
        other => Err(ChannelError::UnsupportedProvider {
            channel: "email",
            provider: other.to_string(),
        }),
    }
}

/// Subject and body of the one-time agreement notice sent to an investor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgreementNotice {
    pub subject: String,
    pub body: String,
}

impl AgreementNotice {
    pub fn render(
        investment: &Investment,
        loan: &Loan,
        investor: &Investor,
        borrower: &Borrower,
    ) -> Self {
        let subject = format!("Investment Agreement - Loan #{}", loan.id.short());
        let body = format!(
            "Dear {investor},

Your investment in Loan #{loan_ref} has been successfully processed.

Investment Details:
- Investment Amount: {amount}
- Expected Return: {expected}
- Investment Date: {date}

Loan Details:
- Borrower: {borrower}
- Principal Amount: {principal}
- Interest Rate: {rate}
- ROI: {roi}

Agreement Letter: {agreement}

Please review the agreement letter and contact us if you have any questions.
",
            investor = investor.name,
            loan_ref = loan.id.short(),
            amount = investment.amount,
            expected = investment.expected_return,
            date = investment
                .investment_date
                .to_datetime_utc()
                .format("%B %-d, %Y"),
            borrower = borrower.full_name(),
            principal = loan.principal_amount,
            rate = loan.interest_rate,
            roi = loan.roi,
            agreement = loan.agreement_reference.as_deref().unwrap_or("pending"),
        );

        Self { subject, body }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loan::{Rate, TimeStamp};

    #[test]
    fn unknown_providers_are_refused() {
        let config = PaymentConfig {
            provider: "stripe".into(),
        };
        let err = payment_from_config(&config).err().unwrap();
        assert_eq!(err.to_string(), "unsupported payment provider: stripe");

        assert!(payment_from_config(&PaymentConfig::default()).is_ok());
        assert!(mailer_from_config(&EmailConfig::default()).is_ok());
    }

    #[test]
    fn notice_carries_investment_and_loan_details() {
        let borrower = Borrower {
            id: Id::new(),
            id_number: "3201".into(),
            first_name: "Siti".into(),
            last_name: "Rahma".into(),
            email: "siti@example.com".into(),
            phone_number: "0812".into(),
        };
        let investor = Investor {
            id: Id::new(),
            investor_code: "INV-1".into(),
            name: "Ari".into(),
            email: "ari@example.com".into(),
            is_active: true,
        };
        let mut loan = Loan::new(borrower.id, 10_000, Rate::from_bps(1_000), Rate::from_bps(500));
        loan.agreement_reference = Some("https://docs/loan1.pdf".into());
        let investment = Investment {
            id: Id::new(),
            loan_id: loan.id,
            investor_id: investor.id,
            amount: 6_000,
            investment_date: TimeStamp::new_with(2024, 6, 15, 10, 30, 0).unwrap(),
            expected_return: 6_300,
            agreement_sent: false,
            agreement_sent_at: None,
            created_at: TimeStamp::new(),
        };

        let notice = AgreementNotice::render(&investment, &loan, &investor, &borrower);

        assert_eq!(
            notice.subject,
            format!("Investment Agreement - Loan #{}", loan.id.short())
        );
        assert!(notice.body.starts_with("Dear Ari,"));
        assert!(notice.body.contains("- Investment Amount: 6000"));
        assert!(notice.body.contains("- Expected Return: 6300"));
        assert!(notice.body.contains("- Investment Date: June 15, 2024"));
        assert!(notice.body.contains("- Borrower: Siti Rahma"));
        assert!(notice.body.contains("- Interest Rate: 10.00%"));
        assert!(notice.body.contains("- ROI: 5.00%"));
        assert!(notice.body.contains("Agreement Letter: https://docs/loan1.pdf"));
    }
}
