pub mod channel;
pub mod config;
pub mod error;
pub mod ledger;
pub mod loan;
pub mod request;
pub mod scheduler;
pub mod service;
pub mod state;
pub mod utils;

pub use error::{ErrorKind, LoanError};
pub use ledger::Ledger;
pub use service::LoanService;
