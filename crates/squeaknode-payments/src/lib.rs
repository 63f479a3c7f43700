//! # Squeaknode Payments
//!
//! Selling and buying squeak decryption keys.
//!
//! ## Protocol
//!
//! 1. The buyer seals a random proof to the squeak's public encryption key
//!    (the *challenge*) and asks a seller for an offer.
//! 2. The seller opens the challenge with the decryption key, encrypts the
//!    decryption key under a key derived from a fresh invoice preimage, and
//!    answers with an offer carrying the proof and the invoice.
//! 3. The buyer accepts the offer only if the proof matches, pays the
//!    invoice, learns the preimage, and recovers the decryption key.
//!
//! Paying is the only way to learn the preimage, so payment and key
//! revelation are atomic.
//!
//! ## Key Types
//!
//! - [`OfferNegotiator`] - Seller and buyer sides of the protocol
//! - [`PaymentLedger`] - Records settlements from the payment client
//! - [`PaymentClient`] - Interface to a payment channel node

pub mod crypto;
pub mod error;
pub mod ledger;
pub mod lightning;
pub mod negotiator;

pub use error::{PaymentError, Result};
pub use ledger::{LedgerConfig, LedgerOutcome, PaymentLedger};
pub use lightning::{DecodedPaymentRequest, Invoice, PaymentClient, SettledInvoice};
pub use negotiator::{OfferConfig, OfferNegotiator, SweepReport};
