//! Generates the client-facing ids embedded in every completion response.

use rand::{Rng, distr::Alphanumeric};

const SUFFIX_LEN: usize = 24;

/// A `chatcmpl-`-prefixed, 24-character base62 id, matching the shape OpenAI's
/// own API returns. Distinct from [`crate::request::RequestContext::request_id`],
/// which stays internal to logging and usage rows.
pub fn completion_id() -> String {
    let suffix: String = rand::rng().sample_iter(&Alphanumeric).take(SUFFIX_LEN).map(char::from).collect();
    format!("chatcmpl-{suffix}")
}
