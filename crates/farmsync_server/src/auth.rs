//! Sender authentication.
//!
//! Every apply request is signed by the sending node with the token both
//! nodes share (see [`farmsync_protocol::signing`]). The receiver looks up
//! the token configured for the claimed origin, recomputes the MAC and
//! rejects requests whose timestamp is outside the accepted skew window.

use crate::error::{ServerError, ServerResult};
use farmsync_protocol::signing::{self, ORIGIN_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use farmsync_protocol::ServerId;
use std::collections::HashMap;
use std::time::Duration;

/// The signing headers of one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignedHeaders {
    /// Claimed sender.
    pub origin: Option<String>,
    /// Signing time in Unix millis, as sent.
    pub timestamp: Option<String>,
    /// Base64 signature.
    pub signature: Option<String>,
}

impl SignedHeaders {
    /// Collects the signing headers through a case-insensitive lookup.
    pub fn from_lookup<'a>(lookup: impl Fn(&str) -> Option<&'a str>) -> Self {
        Self {
            origin: lookup(ORIGIN_HEADER).map(str::to_string),
            timestamp: lookup(TIMESTAMP_HEADER).map(str::to_string),
            signature: lookup(SIGNATURE_HEADER).map(str::to_string),
        }
    }

    /// Collects the signing headers from name/value pairs.
    pub fn from_pairs<N: AsRef<str>, V: AsRef<str>>(pairs: &[(N, V)]) -> Self {
        Self::from_lookup(|name| {
            pairs
                .iter()
                .find(|(n, _)| n.as_ref().eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_ref())
        })
    }
}

/// Verifies request signatures against the trusted sender list.
#[derive(Clone)]
pub struct SenderAuthenticator {
    senders: HashMap<ServerId, Vec<u8>>,
    max_skew: Duration,
    required: bool,
}

impl SenderAuthenticator {
    /// Creates an authenticator for the given senders.
    pub fn new(senders: &HashMap<ServerId, String>, max_skew: Duration) -> Self {
        Self {
            senders: senders
                .iter()
                .map(|(id, token)| (id.clone(), token.as_bytes().to_vec()))
                .collect(),
            max_skew,
            required: true,
        }
    }

    /// Accepts requests without a signature.
    ///
    /// The origin header is still required; a signature that is present
    /// is still checked.
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Returns true if `origin` is a trusted sender.
    pub fn trusts(&self, origin: &ServerId) -> bool {
        self.senders.contains_key(origin)
    }

    /// Authenticates a request at time `now_ms` and returns the sender.
    ///
    /// # Errors
    ///
    /// - `AuthenticationFailed` for missing or malformed headers, a stale
    ///   timestamp or a wrong signature
    /// - `NotAuthorized` for an origin that is not a trusted sender
    pub fn authenticate(
        &self,
        headers: &SignedHeaders,
        body: &[u8],
        now_ms: u64,
    ) -> ServerResult<ServerId> {
        let origin = headers
            .origin
            .as_deref()
            .filter(|o| !o.is_empty())
            .ok_or_else(|| ServerError::AuthenticationFailed(format!("missing {ORIGIN_HEADER}")))?;
        let origin = ServerId::new(origin);

        if !self.required && headers.signature.is_none() {
            return Ok(origin);
        }

        let token = self
            .senders
            .get(&origin)
            .ok_or_else(|| ServerError::NotAuthorized(format!("unknown sender {origin}")))?;

        let timestamp: u64 = headers
            .timestamp
            .as_deref()
            .and_then(|t| t.parse().ok())
            .ok_or_else(|| ServerError::AuthenticationFailed(format!("missing {TIMESTAMP_HEADER}")))?;
        let skew = u128::from(now_ms.abs_diff(timestamp));
        if skew > self.max_skew.as_millis() {
            return Err(ServerError::AuthenticationFailed(format!(
                "timestamp off by {skew}ms"
            )));
        }

        let signature = headers
            .signature
            .as_deref()
            .ok_or_else(|| ServerError::AuthenticationFailed(format!("missing {SIGNATURE_HEADER}")))?;
        if !signing::verify(token, origin.as_str(), timestamp, body, signature) {
            return Err(ServerError::AuthenticationFailed("invalid signature".into()));
        }

        Ok(origin)
    }
}
