//! Featured listings in a stable per-visitor order.

use serde_json::json;

use crate::cars::{Car, featured_cars};
use crate::config::{Profile, config};
use crate::db::with_db;
use crate::http::{RequestContext, respond_internal_error, respond_json};
use crate::session::random_hex;

pub(crate) const VISITOR_COOKIE: &str = "visitor_id";
const VISITOR_ID_BYTES: usize = 16;
const VISITOR_COOKIE_MAX_AGE: u64 = 30 * 24 * 3_600;

const LCG_MULTIPLIER: u64 = 9_301;
const LCG_INCREMENT: u64 = 49_297;
const LCG_MODULUS: u64 = 233_280;

pub(crate) fn visitor_seed(visitor_id: &str) -> u64 {
    visitor_id.chars().map(|c| c as u64).sum()
}

/// Fisher-Yates driven by a small LCG so a visitor always sees the same order.
pub(crate) fn deterministic_shuffle<T>(items: &mut [T], seed: u64) {
    let mut state = seed % LCG_MODULUS;
    for i in (1..items.len()).rev() {
        state = (state * LCG_MULTIPLIER + LCG_INCREMENT) % LCG_MODULUS;
        let j = (state * (i as u64 + 1) / LCG_MODULUS) as usize;
        items.swap(i, j);
    }
}

fn valid_visitor_id(value: &str) -> bool {
    value.len() == VISITOR_ID_BYTES * 2 && value.chars().all(|c| c.is_ascii_hexdigit())
}

fn visitor_cookie(id: &str) -> String {
    let mut cookie = format!(
        "{VISITOR_COOKIE}={id}; Max-Age={VISITOR_COOKIE_MAX_AGE}; Path=/; HttpOnly; SameSite=Lax"
    );
    if config().profile == Profile::Prod {
        cookie.push_str("; Secure");
    }
    cookie
}

/// Existing visitor id, or a fresh one with its `Set-Cookie` queued.
pub(crate) fn visitor_id(ctx: &RequestContext) -> String {
    if let Some(existing) = ctx.cookie(VISITOR_COOKIE).filter(|v| valid_visitor_id(v)) {
        return existing;
    }
    let id = random_hex(VISITOR_ID_BYTES);
    ctx.add_response_header("Set-Cookie", &visitor_cookie(&id));
    id
}

pub(crate) fn handle_featured(ctx: &RequestContext) -> Result<(), String> {
    const ACTION: &str = "cars-featured";
    let visitor = visitor_id(ctx);
    let mut cars: Vec<Car> = match with_db(|pool| async move { featured_cars(&pool).await }) {
        Ok(cars) => cars,
        Err(err) => return respond_internal_error(ctx, ACTION, &err),
    };
    deterministic_shuffle(&mut cars, visitor_seed(&visitor));

    respond_json(
        ctx,
        200,
        &json!({ "cars": cars, "total": cars.len() }),
        ACTION,
        Some(json!({ "count": cars.len() })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::test_context;

    #[test]
    fn seed_sums_character_codes() {
        assert_eq!(visitor_seed("ab"), 97 + 98);
        assert_eq!(visitor_seed(""), 0);
    }

    #[test]
    fn shuffle_is_stable_per_seed_and_keeps_items() {
        let base: Vec<u32> = (1..=10).collect();
        let mut a = base.clone();
        let mut b = base.clone();
        deterministic_shuffle(&mut a, 1_234);
        deterministic_shuffle(&mut b, 1_234);
        assert_eq!(a, b);

        let mut sorted = a.clone();
        sorted.sort();
        assert_eq!(sorted, base);
    }

    #[test]
    fn shuffle_matches_reference_sequence() {
        // i=2: state 49297 -> j=0; i=1: state 165494 -> j=1.
        let mut items = vec![0, 1, 2];
        deterministic_shuffle(&mut items, 0);
        assert_eq!(items, vec![2, 1, 0]);
    }

    #[test]
    fn short_inputs_are_untouched() {
        let mut empty: Vec<u8> = Vec::new();
        deterministic_shuffle(&mut empty, 99);
        let mut one = vec![7];
        deterministic_shuffle(&mut one, 99);
        assert_eq!(one, vec![7]);
    }

    #[test]
    fn visitor_cookie_is_reused_or_issued() {
        let known = "0123456789abcdef0123456789abcdef";
        let cookie = format!("visitor_id={known}");
        let ctx = test_context("GET", "/api/cars/featured", &[("Cookie", cookie.as_str())]);
        assert_eq!(visitor_id(&ctx), known);
        assert!(ctx.take_response_headers().is_empty());

        let fresh_ctx = test_context("GET", "/api/cars/featured", &[("Cookie", "visitor_id=bogus")]);
        let issued = visitor_id(&fresh_ctx);
        assert!(valid_visitor_id(&issued));
        let headers = fresh_ctx.take_response_headers();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].0, "Set-Cookie");
        assert!(headers[0].1.contains("HttpOnly; SameSite=Lax"));
        assert!(headers[0].1.contains("Max-Age=2592000"));
    }
}
