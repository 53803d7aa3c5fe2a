//! Narrow interfaces to external collaborators. These services are black
//! boxes; only the contracts the intake core depends on live here.

pub mod identity;
pub mod payment;

pub use identity::{EnvIdentity, Identity};
pub use payment::{CustomerRef, HttpPaymentGateway, PaymentGateway, PaymentStatus};
