mod common;

use anyhow::Result;
use reqwest::StatusCode;
use serde_json::json;

use common::TestServer;

#[tokio::test]
async fn register_and_login_issue_a_session() -> Result<()> {
    let server = TestServer::start().await?;

    let user = server.register("alice@x.com", "Alice").await?;
    assert_eq!(user["email"], "alice@x.com");
    assert!(user.get("password_hash").is_none(), "hash leaked: {}", user);

    let (status, body) = server
        .call(
            "/tally.v1.AuthService/Login",
            None,
            json!({ "email": "ALICE@x.com", "password": "password123" }),
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["token"].as_str().map(str::len), Some(64));
    assert!(body["data"]["session"].get("token_hash").is_none());

    Ok(())
}

#[tokio::test]
async fn application_errors_use_the_envelope() -> Result<()> {
    let server = TestServer::start().await?;
    server.register("alice@x.com", "Alice").await?;

    let (status, body) = server
        .call(
            "/tally.v1.AuthService/Register",
            None,
            json!({ "email": "Alice@X.com", "name": "Again", "password": "password123" }),
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "user_exists");

    let (_, body) = server
        .call(
            "/tally.v1.AuthService/Register",
            None,
            json!({ "email": "bob@x.com", "name": "Bob", "password": "short" }),
        )
        .await?;
    assert_eq!(body["error"]["code"], "weak_password");

    let (_, wrong_password) = server
        .call(
            "/tally.v1.AuthService/Login",
            None,
            json!({ "email": "alice@x.com", "password": "not-the-password" }),
        )
        .await?;
    let (_, unknown_user) = server
        .call(
            "/tally.v1.AuthService/Login",
            None,
            json!({ "email": "nobody@x.com", "password": "password123" }),
        )
        .await?;
    assert_eq!(wrong_password["error"], unknown_user["error"]);
    assert_eq!(wrong_password["error"]["code"], "invalid_credentials");

    Ok(())
}

#[tokio::test]
async fn refresh_validate_and_logout() -> Result<()> {
    let server = TestServer::start().await?;
    let bearer = server.register_and_login("alice@x.com", "Alice").await?;

    let (status, validated) = server
        .call("/tally.v1.AuthService/ValidateSession", Some(&bearer), json!({}))
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(validated["data"]["valid"], true);
    let expires_at = validated["data"]["session"]["expires_at"].as_str().unwrap_or_default().to_string();

    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    let (status, refreshed) = server
        .call("/tally.v1.AuthService/RefreshSession", Some(&bearer), json!({}))
        .await?;
    assert_eq!(status, StatusCode::OK);
    let refreshed_at = refreshed["data"]["expires_at"].as_str().unwrap_or_default().to_string();
    let before = chrono::DateTime::parse_from_rfc3339(&expires_at)?;
    let after = chrono::DateTime::parse_from_rfc3339(&refreshed_at)?;
    assert!(after > before);

    let (_, other) = server
        .call(
            "/tally.v1.AuthService/ValidateSession",
            Some(&bearer),
            json!({ "token": "not-a-real-token" }),
        )
        .await?;
    assert_eq!(other["data"]["valid"], false);

    let (status, _) = server
        .call("/tally.v1.AuthService/Logout", Some(&bearer), json!({}))
        .await?;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = server
        .call("/tally.v1.AuthService/ValidateSession", Some(&bearer), json!({}))
        .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "unauthenticated");

    Ok(())
}
