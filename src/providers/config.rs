use once_cell::sync::Lazy;
use std::env;

pub static KEEPA_API_KEY: Lazy<String> =
    Lazy::new(|| env::var("KEEPA_API_KEY").unwrap_or_default());

pub static KEEPA_ROOT: Lazy<String> = Lazy::new(|| {
    env::var("KEEPA_ENDPOINT")
        .map(|value| value.trim_end_matches('/').to_string())
        .unwrap_or_else(|_| "https://api.keepa.com".to_string())
});

pub static SPAPI_CLIENT_ID: Lazy<String> =
    Lazy::new(|| env::var("SPAPI_CLIENT_ID").unwrap_or_default());

pub static SPAPI_CLIENT_SECRET: Lazy<String> =
    Lazy::new(|| env::var("SPAPI_CLIENT_SECRET").unwrap_or_default());

pub static SPAPI_REFRESH_TOKEN: Lazy<String> =
    Lazy::new(|| env::var("SPAPI_REFRESH_TOKEN").unwrap_or_default());

pub static SPAPI_ROOT: Lazy<String> = Lazy::new(|| {
    env::var("SPAPI_ENDPOINT")
        .map(|value| value.trim_end_matches('/').to_string())
        .unwrap_or_else(|_| "https://sellingpartnerapi-na.amazon.com".to_string())
});

pub static LWA_TOKEN_URL: Lazy<String> = Lazy::new(|| {
    env::var("LWA_TOKEN_URL").unwrap_or_else(|_| "https://api.amazon.com/auth/o2/token".to_string())
});

pub fn keepa_configured() -> bool {
    !KEEPA_API_KEY.is_empty()
}

pub fn spapi_configured() -> bool {
    !SPAPI_CLIENT_ID.is_empty() && !SPAPI_CLIENT_SECRET.is_empty() && !SPAPI_REFRESH_TOKEN.is_empty()
}
