//! Error taxonomy for the loan workflow
use crate::loan::Id;
use crate::state::LoanState;
use sled::transaction::{ConflictableTransactionError, TransactionError};

/// Coarse classification callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    IllegalTransition,
    ConstraintViolation,
    StorageFailure,
    ExternalServiceFailure,
    Timeout,
}

#[derive(thiserror::Error, Debug)]
pub enum LoanError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Id },
    #[error(transparent)]
    IllegalTransition(#[from] TransitionError),
    #[error(transparent)]
    InvestmentRejected(#[from] RejectReason),
    #[error("storage failure: {0}")]
    Storage(#[from] sled::Error),
    #[error("failed to encode or decode a record: {0}")]
    Codec(String),
    #[error("payment processing failed for loan {loan_id}: {source}")]
    Payment {
        loan_id: Id,
        #[source]
        source: ChannelError,
    },
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("operation deadline exceeded, transaction rolled back")]
    DeadlineExceeded,
}

/// Malformed or rule-breaking input, always raised before any write.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("principal amount must be greater than 0")]
    PrincipalNotPositive,
    #[error("{0} must be between 0 and 1")]
    RateOutOfRange(&'static str),
    #[error("ROI cannot be higher than interest rate")]
    RoiAboveInterestRate,
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("{0} cannot be in the future")]
    FutureDate(&'static str),
    #[error("investment amount must be greater than 0")]
    InvestmentNotPositive,
    #[error("disbursed amount must be greater than 0")]
    DisbursementNotPositive,
    #[error("disbursed amount {disbursed} must match principal amount {principal}")]
    DisbursedAmountMismatch { disbursed: u64, principal: u64 },
}

/// State machine guard failures.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("invalid target state: {0}")]
    InvalidState(String),
    #[error("cannot transition from {from} to {to}")]
    Illegal { from: LoanState, to: LoanState },
    #[error("loan must be in {required} state to {action}, current state: {current}")]
    WrongState {
        required: LoanState,
        current: LoanState,
        action: &'static str,
    },
    #[error(
        "loan must be fully invested before disbursement. Required: {required}, Invested: {invested}"
    )]
    NotFullyInvested { required: u64, invested: u64 },
    #[error("loan must have an agreement letter to be disbursed")]
    MissingAgreement,
}

/// Investment refused by the funding cap or the loan's state.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    #[error("loan must be in approved state to receive investments, current state: {current}")]
    NotAcceptingInvestments { current: LoanState },
    #[error("investment amount {amount} exceeds remaining amount {remaining}")]
    ExceedsRemaining { amount: u64, remaining: u64 },
    #[error("loan not found, already fully invested, or not in approved state")]
    NotApplied,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("unsupported {channel} provider: {provider}")]
    UnsupportedProvider {
        channel: &'static str,
        provider: String,
    },
    #[error("{provider} rejected the request: {reason}")]
    Rejected { provider: String, reason: String },
}

impl LoanError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LoanError::Validation(_) => ErrorKind::Validation,
            LoanError::NotFound { .. } => ErrorKind::NotFound,
            LoanError::IllegalTransition(_) => ErrorKind::IllegalTransition,
            LoanError::InvestmentRejected(_) => ErrorKind::ConstraintViolation,
            LoanError::Storage(_) | LoanError::Codec(_) => ErrorKind::StorageFailure,
            LoanError::Payment { .. } | LoanError::Channel(_) => ErrorKind::ExternalServiceFailure,
            LoanError::DeadlineExceeded => ErrorKind::Timeout,
        }
    }

    pub(crate) fn not_found(entity: &'static str, id: Id) -> Self {
        LoanError::NotFound { entity, id }
    }
}

impl From<TransactionError<LoanError>> for LoanError {
    fn from(value: TransactionError<LoanError>) -> Self {
        match value {
            TransactionError::Abort(err) => err,
            TransactionError::Storage(err) => LoanError::Storage(err),
        }
    }
}

impl<T> From<minicbor::encode::Error<T>> for LoanError
where
    T: std::fmt::Display,
{
    fn from(value: minicbor::encode::Error<T>) -> Self {
        LoanError::Codec(value.to_string())
    }
}

impl From<minicbor::decode::Error> for LoanError {
    fn from(value: minicbor::decode::Error) -> Self {
        LoanError::Codec(value.to_string())
    }
}

/// Wraps a domain error so it aborts the enclosing sled transaction.
pub(crate) fn abort<E: Into<LoanError>>(err: E) -> ConflictableTransactionError<LoanError> {
    ConflictableTransactionError::Abort(err.into())
}
