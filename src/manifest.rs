// Transfer instructions for the source ledger

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::clients::quote::Quote;
use crate::tokens::{AmountError, TokenSpec};

const TRANSFER_BUCKET: &str = "bucket1";

/// A single manifest instruction. Amounts are in the resource's smallest
/// unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instruction {
    LockFee {
        account: String,
        amount: u128,
    },
    Withdraw {
        account: String,
        resource: String,
        amount: u128,
    },
    TakeFromWorktop {
        resource: String,
        amount: u128,
        bucket: String,
    },
    Deposit {
        account: String,
        bucket: String,
    },
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::LockFee { account, amount } => {
                write!(f, "LOCK_FEE Address(\"{}\") Native(\"{}\");", account, amount)
            }
            Instruction::Withdraw {
                account,
                resource,
                amount,
            } => write!(
                f,
                "WITHDRAW Address(\"{}\") Address(\"{}\") Native(\"{}\");",
                account, resource, amount
            ),
            Instruction::TakeFromWorktop {
                resource,
                amount,
                bucket,
            } => write!(
                f,
                "TAKE_FROM_WORKTOP Address(\"{}\") Native(\"{}\") Bucket(\"{}\");",
                resource, amount, bucket
            ),
            Instruction::Deposit { account, bucket } => {
                write!(f, "DEPOSIT Address(\"{}\") Bucket(\"{}\");", account, bucket)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Manifest {
    pub instructions: Vec<Instruction>,
}

impl Manifest {
    /// Plain same-ledger transfer: withdraw, take from worktop, deposit.
    pub fn transfer(
        from: &str,
        to: &str,
        token: &TokenSpec,
        amount: Decimal,
    ) -> Result<Self, AmountError> {
        let native = token.to_native(amount)?;
        Ok(Self {
            instructions: vec![
                Instruction::Withdraw {
                    account: from.to_string(),
                    resource: token.resource.clone(),
                    amount: native,
                },
                Instruction::TakeFromWorktop {
                    resource: token.resource.clone(),
                    amount: native,
                    bucket: TRANSFER_BUCKET.to_string(),
                },
                Instruction::Deposit {
                    account: to.to_string(),
                    bucket: TRANSFER_BUCKET.to_string(),
                },
            ],
        })
    }

    /// Prepends a fee lock paid from `account` in the fee token.
    pub fn with_fee_lock(
        mut self,
        account: &str,
        fee_token: &TokenSpec,
        amount: Decimal,
    ) -> Result<Self, AmountError> {
        let native = fee_token.to_native(amount)?;
        self.instructions.insert(
            0,
            Instruction::LockFee {
                account: account.to_string(),
                amount: native,
            },
        );
        Ok(self)
    }
}

impl fmt::Display for Manifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, instruction) in self.instructions.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", instruction)?;
        }
        Ok(())
    }
}

/// What gets signed: a locally built manifest or a routed quote.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferIntent {
    Plain(Manifest),
    Quoted(Quote),
}

impl TransferIntent {
    /// The manifest text handed to the ledger.
    pub fn manifest_text(&self) -> String {
        match self {
            TransferIntent::Plain(manifest) => manifest.to_string(),
            TransferIntent::Quoted(quote) => quote.intent.clone(),
        }
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        match self {
            TransferIntent::Plain(_) => None,
            TransferIntent::Quoted(quote) => Some(quote.expires_at),
        }
    }
}
