use std::{collections::HashMap, net::SocketAddr};

use axum::{
    Json, Router,
    body::Bytes,
    http::{HeaderMap, StatusCode, header::CONTENT_TYPE},
    response::IntoResponse,
    routing::post,
};
use clap::Parser;
use serde_json::{Value, json};
use url::form_urlencoded;

/// Fake OAuth token endpoint for running the console end to end without a
/// real provider.
#[derive(Debug, Parser)]
#[command(about = "Mock OAuth token endpoint")]
struct Args {
    #[arg(long, env = "MOCK_PROVIDER_ADDR", default_value = "127.0.0.1:58089")]
    bind: SocketAddr,

    /// Lifetime reported for issued access tokens, in seconds.
    #[arg(long, default_value_t = 3600)]
    expires_in: i64,
}

fn parse_params(headers: &HeaderMap, body: &[u8]) -> HashMap<String, String> {
    let is_json = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/json"));

    if is_json {
        let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(body) else {
            return HashMap::new();
        };
        return map
            .into_iter()
            .filter_map(|(key, value)| value.as_str().map(|v| (key, v.to_string())))
            .collect();
    }

    form_urlencoded::parse(body).into_owned().collect()
}

fn invalid_grant(description: &str) -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": "invalid_grant", "error_description": description })),
    )
}

fn issue_tokens(seed: &str, expires_in: i64) -> (StatusCode, Json<Value>) {
    let suffix: String = seed.chars().filter(char::is_ascii_alphanumeric).take(12).collect();
    (
        StatusCode::OK,
        Json(json!({
            "token_type": "Bearer",
            "access_token": format!("mock-access-{suffix}-{}", nanoid::nanoid!(16)),
            "refresh_token": format!("mock-refresh-{suffix}-{}", nanoid::nanoid!(16)),
            "expires_in": expires_in,
            "scope": "user:profile user:inference",
            "account": { "email_address": format!("{suffix}@mock.local") },
            "organization": { "name": "Mock Org" },
        })),
    )
}

async fn token(expires_in: i64, headers: HeaderMap, body: Bytes) -> impl IntoResponse {
    let params = parse_params(&headers, &body);
    let grant_type = params.get("grant_type").map(String::as_str);

    match grant_type {
        Some("authorization_code") => {
            let Some(code) = params.get("code").filter(|c| !c.is_empty()) else {
                return invalid_grant("code is required");
            };
            if params.get("code_verifier").is_none_or(|v| v.is_empty()) {
                return invalid_grant("code_verifier is required");
            }
            if code == "reject" {
                return invalid_grant("authorization code was rejected");
            }
            println!("authorization_code grant accepted");
            issue_tokens(code, expires_in)
        }
        Some("refresh_token") => {
            let Some(refresh) = params.get("refresh_token").filter(|r| !r.is_empty()) else {
                return invalid_grant("refresh_token is required");
            };
            if refresh == "reject" {
                return invalid_grant("refresh token was revoked");
            }
            println!("refresh_token grant accepted");
            issue_tokens("refreshed", expires_in)
        }
        _ => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "unsupported_grant_type" })),
        ),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let expires_in = args.expires_in;

    let app = Router::new().route(
        "/v1/oauth/token",
        post(move |headers: HeaderMap, body: Bytes| token(expires_in, headers, body)),
    );

    println!("Mock OAuth provider on http://{}/v1/oauth/token", args.bind);
    axum::serve(tokio::net::TcpListener::bind(args.bind).await?, app).await?;
    Ok(())
}
