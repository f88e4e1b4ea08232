//! Authentication of calls between the directory service and this knot.
//!
//! Both sides share one secret.  The directory service signs each request
//! with [`signature::RequestSigner`] (usually through
//! [`signer::SignedClient`]); the knot checks it in
//! [`middleware::verify_signature`].

pub mod middleware;
pub mod signature;
pub mod signer;

pub use signature::{RequestSigner, SharedSecret, SignatureError, Verifier};
pub use signer::SignedClient;
