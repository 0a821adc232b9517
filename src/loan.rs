//! Core loan ledger records
use crate::state::LoanState;
use chrono::{DateTime, TimeZone, Utc};
use std::fmt;
use uuid7::{Uuid, uuid7};

/// Basis points in a whole (100%).
pub const BPS_SCALE: u32 = 10_000;

// newtype wrapper over uuid because Uuid doesn't implement minicbor traits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(Uuid);

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

/// A rate in basis points, 0..=10_000 covering [0, 1].
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cbor(array)]
pub struct Rate(#[n(0)] u32);

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    #[n(0)]
    Pdf,
    #[n(1)]
    Jpeg,
    #[n(2)]
    Png,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Loan {
    #[n(0)]
    pub id: Id,
    #[n(1)]
    pub borrower_id: Id,
    #[n(2)]
    pub principal_amount: u64, // Use integers for currency
    #[n(3)]
    pub interest_rate: Rate,
    #[n(4)]
    pub roi: Rate, // promised to investors, never above interest_rate
    #[n(5)]
    pub state: LoanState,
    #[n(6)]
    pub total_invested: u64,
    #[n(7)]
    pub agreement_reference: Option<String>,
    #[n(8)]
    pub created_at: TimeStamp<Utc>,
    #[n(9)]
    pub updated_at: TimeStamp<Utc>,
    #[n(10)]
    pub deleted_at: Option<TimeStamp<Utc>>,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Approval {
    #[n(0)]
    pub id: Id,
    #[n(1)]
    pub loan_id: Id,
    #[n(2)]
    pub validator_id: Id,
    #[n(3)]
    pub approval_date: TimeStamp<Utc>,
    #[n(4)]
    pub visit_proof_reference: String,
    #[n(5)]
    pub visit_proof_type: FileType,
    #[n(6)]
    pub notes: Option<String>,
    #[n(7)]
    pub created_at: TimeStamp<Utc>,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Investment {
    #[n(0)]
    pub id: Id,
    #[n(1)]
    pub loan_id: Id,
    #[n(2)]
    pub investor_id: Id,
    #[n(3)]
    pub amount: u64,
    #[n(4)]
    pub investment_date: TimeStamp<Utc>,
    #[n(5)]
    pub expected_return: u64,
    #[n(6)]
    pub agreement_sent: bool,
    #[n(7)]
    pub agreement_sent_at: Option<TimeStamp<Utc>>,
    #[n(8)]
    pub created_at: TimeStamp<Utc>,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Disbursement {
    #[n(0)]
    pub id: Id,
    #[n(1)]
    pub loan_id: Id,
    #[n(2)]
    pub field_officer_id: Id,
    #[n(3)]
    pub disbursement_date: TimeStamp<Utc>,
    #[n(4)]
    pub signed_agreement_reference: String,
    #[n(5)]
    pub signed_agreement_type: FileType,
    #[n(6)]
    pub disbursed_amount: u64,
    #[n(7)]
    pub notes: Option<String>,
    #[n(8)]
    pub created_at: TimeStamp<Utc>,
}

/// Append-only audit row, one per successful transition.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    #[n(0)]
    pub id: Id,
    #[n(1)]
    pub loan_id: Id,
    #[n(2)]
    pub previous_state: LoanState,
    #[n(3)]
    pub new_state: LoanState,
    #[n(4)]
    pub changed_by: Id,
    #[n(5)]
    pub reason: String,
    #[n(6)]
    pub changed_at: TimeStamp<Utc>,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Borrower {
    #[n(0)]
    pub id: Id,
    #[n(1)]
    pub id_number: String,
    #[n(2)]
    pub first_name: String,
    #[n(3)]
    pub last_name: String,
    #[n(4)]
    pub email: String,
    #[n(5)]
    pub phone_number: String,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Investor {
    #[n(0)]
    pub id: Id,
    #[n(1)]
    pub investor_code: String,
    #[n(2)]
    pub name: String,
    #[n(3)]
    pub email: String,
    #[n(4)]
    pub is_active: bool,
}

/// Audit record of a delivered investor notification.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    #[n(0)]
    pub id: Id,
    #[n(1)]
    pub investor_id: Id,
    #[n(2)]
    pub loan_id: Id,
    #[n(3)]
    pub kind: String,
    #[n(4)]
    pub subject: String,
    #[n(5)]
    pub body: String,
    #[n(6)]
    pub sent_at: TimeStamp<Utc>,
    #[n(7)]
    pub status: String,
}

/// Read model returned by propose and summary lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoanSummary {
    pub id: Id,
    pub borrower_name: String,
    pub principal_amount: u64,
    pub interest_rate: Rate,
    pub roi: Rate,
    pub state: LoanState,
    pub total_invested: u64,
    pub remaining_investment: u64,
    pub investment_count: usize,
    pub agreement_reference: Option<String>,
    pub created_at: TimeStamp<Utc>,
    pub updated_at: TimeStamp<Utc>,
}

impl Id {
    pub fn new() -> Self {
        Self(uuid7())
    }
    /// Fixed identity recorded for transitions the system performs itself.
    pub fn system() -> Self {
        Self(Uuid::from([0u8; 16]))
    }
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from(bytes))
    }
    /// First eight hex digits, used in human-facing references.
    pub fn short(&self) -> String {
        let mut s = self.0.to_string();
        s.truncate(8);
        s
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Option<Self> {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .single()
            .map(Self)
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
    pub fn is_future(&self) -> bool {
        self.0 > Utc::now()
    }
}

// derived ordering would demand `Utc: Ord`; compare the instants instead
impl PartialOrd for TimeStamp<Utc> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeStamp<Utc> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl Rate {
    pub const fn from_bps(bps: u32) -> Self {
        Self(bps)
    }
    /// Converts a fraction such as `0.05` into basis points. Values outside
    /// [0, 1] (or NaN) are refused.
    pub fn from_fraction(value: f64) -> Option<Self> {
        if !(0.0..=1.0).contains(&value) {
            return None;
        }
        Some(Self((value * BPS_SCALE as f64).round() as u32))
    }
    pub fn bps(&self) -> u32 {
        self.0
    }
    /// `amount * rate`, rounded down.
    pub fn apply(&self, amount: u64) -> u64 {
        (amount as u128 * self.0 as u128 / BPS_SCALE as u128) as u64
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}%", self.0 / 100, self.0 % 100)
    }
}

impl Loan {
    /// A freshly proposed loan with nothing invested.
    pub fn new(borrower_id: Id, principal_amount: u64, interest_rate: Rate, roi: Rate) -> Self {
        let now = TimeStamp::new();
        Self {
            id: Id::new(),
            borrower_id,
            principal_amount,
            interest_rate,
            roi,
            state: LoanState::Proposed,
            total_invested: 0,
            agreement_reference: None,
            created_at: now.clone(),
            updated_at: now,
            deleted_at: None,
        }
    }
    pub fn remaining_investment(&self) -> u64 {
        self.principal_amount.saturating_sub(self.total_invested)
    }
    pub fn is_fully_invested(&self) -> bool {
        self.total_invested >= self.principal_amount
    }
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
    /// What an investor gets back: principal plus the loan's ROI.
    pub fn expected_return(&self, amount: u64) -> u64 {
        amount.saturating_add(self.roi.apply(amount))
    }
}

impl Borrower {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

impl LoanSummary {
    pub fn new(loan: &Loan, borrower: &Borrower, investment_count: usize) -> Self {
        Self {
            id: loan.id,
            borrower_name: borrower.full_name(),
            principal_amount: loan.principal_amount,
            interest_rate: loan.interest_rate,
            roi: loan.roi,
            state: loan.state,
            total_invested: loan.total_invested,
            remaining_investment: loan.remaining_investment(),
            investment_count,
            agreement_reference: loan.agreement_reference.clone(),
            created_at: loan.created_at.clone(),
            updated_at: loan.updated_at.clone(),
        }
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

impl<C> minicbor::Encode<C> for Id {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.bytes(self.0.as_bytes())?.ok()
    }
}

impl<'b, C> minicbor::Decode<'b, C> for Id {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let digest: [u8; 16] = d
            .bytes()?
            .try_into()
            .map_err(|_| minicbor::decode::Error::message("identifier must be 16 bytes"))?;

        Ok(Id(Uuid::from(digest)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_encoding() {
        let original = Id::new();

        let encoding = minicbor::to_vec(original).unwrap();
        let decode: Id = minicbor::decode(&encoding).unwrap();

        assert_eq!(original, decode);
    }

    #[test]
    fn loan_encoding_keeps_optional_fields() {
        let mut loan = Loan::new(Id::new(), 10_000, Rate::from_bps(1_000), Rate::from_bps(500));
        loan.agreement_reference = Some("agreement.pdf".into());

        let encoding = minicbor::to_vec(&loan).unwrap();
        let decode: Loan = minicbor::decode(&encoding).unwrap();

        assert_eq!(loan, decode);
    }

    #[test]
    fn ids_are_time_ordered() {
        let first = Id::new();
        let second = Id::new();
        assert!(first.as_bytes() < second.as_bytes());
        assert_eq!(first.short().len(), 8);
    }

    #[test]
    fn timestamps_order_by_instant() {
        let earlier = TimeStamp::new_with(2024, 1, 1, 0, 0, 0).unwrap();
        let later = TimeStamp::new_with(2024, 6, 15, 10, 30, 0).unwrap();

        let mut stamps = vec![later.clone(), earlier.clone()];
        stamps.sort();
        assert_eq!(stamps, [earlier.clone(), later.clone()]);
        assert!(earlier < later);
    }

    #[test]
    fn rate_from_fraction() {
        assert_eq!(Rate::from_fraction(0.10), Some(Rate::from_bps(1_000)));
        assert_eq!(Rate::from_fraction(1.0), Some(Rate::from_bps(10_000)));
        assert_eq!(Rate::from_fraction(1.01), None);
        assert_eq!(Rate::from_fraction(-0.01), None);
        assert_eq!(Rate::from_fraction(f64::NAN), None);
        assert_eq!(Rate::from_bps(1_250).to_string(), "12.50%");
    }

    #[test]
    fn expected_return_adds_roi() {
        let loan = Loan::new(Id::new(), 10_000, Rate::from_bps(1_000), Rate::from_bps(500));
        assert_eq!(loan.expected_return(6_000), 6_300);
        assert_eq!(loan.expected_return(1), 1);
    }

    #[test]
    fn remaining_never_underflows() {
        let mut loan = Loan::new(Id::new(), 100, Rate::from_bps(0), Rate::from_bps(0));
        loan.total_invested = 100;
        assert_eq!(loan.remaining_investment(), 0);
        assert!(loan.is_fully_invested());
    }
}
