mod common;

use anyhow::Result;
use reqwest::StatusCode;
use serde_json::json;

use common::TestServer;

#[tokio::test]
async fn smiths_family_roles_end_to_end() -> Result<()> {
    let server = TestServer::start().await?;
    let alice = server.register_and_login("alice@x.com", "Alice").await?;

    let (status, family) = server
        .call("/tally.v1.FamilyService/CreateFamily", Some(&alice), json!({ "name": "Smiths" }))
        .await?;
    assert_eq!(status, StatusCode::OK, "{}", family);
    assert_eq!(family["name"], "Smiths");
    assert!(family.get("database_url").is_none());
    let invite_code = family["invite_code"].as_str().unwrap_or_default().to_string();

    // Alice's existing session now carries the family and the manager role
    let (_, validated) = server
        .call("/tally.v1.AuthService/ValidateSession", Some(&alice), json!({}))
        .await?;
    assert_eq!(validated["data"]["family_id"], family["id"]);
    assert_eq!(validated["data"]["session"]["role"], "manager");

    let bob = server.register_and_login("bob@x.com", "Bob").await?;
    let (status, joined) = server
        .call(
            "/tally.v1.FamilyService/JoinFamily",
            Some(&bob),
            json!({ "invite_code": invite_code.to_lowercase() }),
        )
        .await?;
    assert_eq!(status, StatusCode::OK, "{}", joined);
    assert_eq!(joined["id"], family["id"]);

    let (status, details) = server
        .call("/tally.v1.FamilyService/GetFamily", Some(&bob), json!({}))
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(details["members"].as_array().map(Vec::len), Some(2));

    // Manager-only procedures
    let (status, body) = server
        .call("/tally.v1.FamilyService/DeleteFamily", Some(&bob), json!({}))
        .await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "permission_denied");

    let (status, body) = server
        .call("/tally.v1.FamilyService/LeaveFamily", Some(&alice), json!({}))
        .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "failed_precondition");

    let (status, _) = server
        .call("/tally.v1.FamilyService/DeleteFamily", Some(&alice), json!({}))
        .await?;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = server
        .call("/tally.v1.FamilyService/GetFamily", Some(&bob), json!({}))
        .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    Ok(())
}

#[tokio::test]
async fn join_with_unknown_code_is_not_found() -> Result<()> {
    let server = TestServer::start().await?;
    let bob = server.register_and_login("bob@x.com", "Bob").await?;

    let (status, body) = server
        .call("/tally.v1.FamilyService/JoinFamily", Some(&bob), json!({ "invite_code": "ZZZZ9999" }))
        .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");

    Ok(())
}

#[tokio::test]
async fn expenses_stay_inside_their_family() -> Result<()> {
    let server = TestServer::start().await?;
    let alice = server.register_and_login("alice@x.com", "Alice").await?;
    let carol = server.register_and_login("carol@x.com", "Carol").await?;

    for (bearer, name) in [(&alice, "Smiths"), (&carol, "Joneses")] {
        let (status, _) = server
            .call("/tally.v1.FamilyService/CreateFamily", Some(bearer), json!({ "name": name }))
            .await?;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, category) = server
        .call(
            "/tally.v1.ExpenseService/CreateCategory",
            Some(&alice),
            json!({ "name": "Groceries", "color": "#00aa00" }),
        )
        .await?;
    assert_eq!(status, StatusCode::OK, "{}", category);

    let (status, expense) = server
        .call(
            "/tally.v1.ExpenseService/CreateExpense",
            Some(&alice),
            json!({ "category_id": category["id"], "amount": "42.10", "description": "weekly shop" }),
        )
        .await?;
    assert_eq!(status, StatusCode::OK, "{}", expense);
    assert_eq!(expense["amount"], "42.1");

    let (status, body) = server
        .call(
            "/tally.v1.ExpenseService/CreateExpense",
            Some(&alice),
            json!({ "amount": "-1" }),
        )
        .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_argument");

    let (_, alice_list) = server
        .call("/tally.v1.ExpenseService/ListExpenses", Some(&alice), json!({}))
        .await?;
    let (_, carol_list) = server
        .call("/tally.v1.ExpenseService/ListExpenses", Some(&carol), json!({}))
        .await?;
    assert_eq!(alice_list["expenses"].as_array().map(Vec::len), Some(1));
    assert_eq!(carol_list["expenses"].as_array().map(Vec::len), Some(0));

    let (status, _) = server
        .call(
            "/tally.v1.ExpenseService/DeleteExpense",
            Some(&carol),
            json!({ "id": expense["id"] }),
        )
        .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = server
        .call(
            "/tally.v1.ExpenseService/DeleteExpense",
            Some(&alice),
            json!({ "id": expense["id"] }),
        )
        .await?;
    assert_eq!(status, StatusCode::OK);

    Ok(())
}
