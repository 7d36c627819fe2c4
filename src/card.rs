//! Payment data handed to the checkout by an external generator.

use crate::Result;
use serde::{Deserialize, Serialize};

/// Card expiry date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expiry {
    pub month: u8,
    pub year: u16,
}

impl Expiry {
    pub fn new(month: u8, year: u16) -> Self {
        Self { month, year }
    }

    /// `MM / YY`, the shape most payment masks settle on.
    pub fn formatted(&self) -> String {
        format!("{:02} / {:02}", self.month, self.year % 100)
    }
}

/// One generated card. Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardRecord {
    pub number: String,
    pub card_type: String,
    pub expiry: Expiry,
    pub verification_code: String,
    pub formatted_number: String,
    pub formatted_expiry: String,
}

impl CardRecord {
    /// Build a record, deriving the formatted fields.
    pub fn new(
        number: impl Into<String>,
        card_type: impl Into<String>,
        expiry: Expiry,
        verification_code: impl Into<String>,
    ) -> Self {
        let number = number.into();
        let formatted_number = number
            .as_bytes()
            .chunks(4)
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        Self {
            formatted_expiry: expiry.formatted(),
            formatted_number,
            number,
            card_type: card_type.into(),
            expiry,
            verification_code: verification_code.into(),
        }
    }

    /// Last four digits, the only part that is ever logged or recorded.
    pub fn suffix(&self) -> String {
        let digits: Vec<char> = self.number.chars().filter(char::is_ascii_digit).collect();
        let start = digits.len().saturating_sub(4);
        digits[start..].iter().collect()
    }
}

/// Billing details sourced from settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormValues {
    pub first_name: String,
    pub last_name: String,
    pub postal_code: String,
}

impl FormValues {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

/// Produces a card from a configured pattern. Pure and stateless.
pub trait CardSource {
    fn generate(&self, pattern: &str) -> Result<CardRecord>;
}
