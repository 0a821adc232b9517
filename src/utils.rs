//! Utility functions for identifier encoding and document references
use crate::error::LoanError;
use crate::loan::{Id, Loan};
use bech32::Bech32m;

// encode an existing identifier using bech32 under the given prefix
pub fn id_to_bech32(hrp: &str, id: &Id) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, id.as_bytes())?;
    Ok(encode)
}

/// Digest over the funded loan terms, so a reference can be checked against
/// the terms it was issued for.
pub fn terms_digest(loan: &Loan) -> Result<String, LoanError> {
    let terms = (
        *loan.id.as_bytes(),
        *loan.borrower_id.as_bytes(),
        loan.principal_amount,
        loan.interest_rate.bps(),
        loan.roi.bps(),
        loan.total_invested,
    );
    let cbor = minicbor::to_vec(terms)?;
    Ok(sha256::digest(&cbor))
}

/// Reference to the generated agreement letter for a fully funded loan.
pub fn agreement_reference(base_url: &str, loan: &Loan) -> Result<String, LoanError> {
    let name = id_to_bech32("loan", &loan.id).map_err(|e| LoanError::Codec(e.to_string()))?;
    let digest = terms_digest(loan)?;

    Ok(format!(
        "{}/{name}.pdf?digest={digest}",
        base_url.trim_end_matches('/')
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loan::Rate;

    fn loan() -> Loan {
        Loan::new(Id::new(), 10_000, Rate::from_bps(1_000), Rate::from_bps(500))
    }

    #[test]
    fn bech32_uses_the_prefix() {
        let id = Id::new();
        let encoded = id_to_bech32("loan", &id).unwrap();
        assert!(encoded.starts_with("loan1"));
        assert_ne!(encoded, id_to_bech32("loan", &Id::new()).unwrap());
    }

    #[test]
    fn handles_empty_hrp() {
        assert!(id_to_bech32("", &Id::new()).is_err());
    }

    #[test]
    fn agreement_reference_tracks_terms() {
        let mut loan = loan();
        loan.total_invested = 10_000;
        let first = agreement_reference("https://storage.example.com/agreements/", &loan).unwrap();
        assert!(first.starts_with("https://storage.example.com/agreements/loan1"));
        assert!(first.contains(".pdf?digest="));

        loan.total_invested = 9_000;
        let second = agreement_reference("https://storage.example.com/agreements", &loan).unwrap();
        assert_ne!(first, second);
    }
}
