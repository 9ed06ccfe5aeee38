//! Gateway Signatures
//!
//! The gateway authenticates both directions with a keyed MD5 digest: the
//! values of an ordered field list concatenated with no separators, followed
//! by the merchant secret. Keys name the slots but are not hashed. MD5 is
//! dictated by the gateway; swapping it breaks interoperability.

use md5::{Digest, Md5};

/// Fields signed on an outbound checkout request, in gateway order.
pub const ORDER_FIELDS: [&str; 5] = ["name", "pay_type", "price", "order_id", "notify_url"];

/// Fields signed on an inbound notification, in gateway order.
pub const NOTIFY_FIELDS: [&str; 4] = ["order_id", "aoid", "pay_price", "pay_time"];

/// Signs and verifies gateway field lists with the merchant secret.
#[derive(Clone)]
pub struct Signer {
    secret: String,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer").field("secret", &"<redacted>").finish()
    }
}

impl Signer {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Compute the token for an ordered list of fields.
    pub fn sign(&self, fields: &[(&str, &str)]) -> String {
        let mut hasher = Md5::new();
        for (_, value) in fields {
            hasher.update(value.as_bytes());
        }
        hasher.update(self.secret.as_bytes());

        hex::encode(hasher.finalize())
    }

    /// Exact comparison of the computed token against `provided`.
    pub fn verify(&self, fields: &[(&str, &str)], provided: &str) -> bool {
        self.sign(fields) == provided
    }
}
