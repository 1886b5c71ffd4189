//! The bid scoring rule.
//!
//! `score = alpha * price + beta / (response_time + 1) + gamma * weight`
//!
//! The first term rewards higher bids, the second rewards submitting early
//! (strictly decreasing in response time), the third rewards reputation.
//! All three coefficients are session scoped.

/// Pure scoring function; equal inputs yield bitwise equal outputs.
pub fn bid_score(
    price: f64,
    response_time_seconds: f64,
    weight: f64,
    alpha: f64,
    beta: f64,
    gamma: f64,
) -> f64 {
    alpha * price + beta / (response_time_seconds + 1.) + gamma * weight
}
