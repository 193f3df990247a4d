//! Ledger document numbering.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Kinds of numbered ledger documents.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Receivable,
    Payable,
    ReceiptVoucher,
    PaymentVoucher,
}

impl DocumentKind {
    pub fn prefix(self) -> &'static str {
        match self {
            DocumentKind::Receivable => "AR",
            DocumentKind::Payable => "AP",
            DocumentKind::ReceiptVoucher => "RV",
            DocumentKind::PaymentVoucher => "PV",
        }
    }

    /// `AR-20260124-00001` style number for the `sequence`-th document of `date`.
    pub fn format_number(self, date: NaiveDate, sequence: u32) -> String {
        format!("{}-{}-{:05}", self.prefix(), date.format("%Y%m%d"), sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_layout() {
        let date = NaiveDate::from_ymd_opt(2026, 1, 24).unwrap();
        assert_eq!(DocumentKind::Receivable.format_number(date, 1), "AR-20260124-00001");
        assert_eq!(DocumentKind::PaymentVoucher.format_number(date, 123), "PV-20260124-00123");
    }
}
