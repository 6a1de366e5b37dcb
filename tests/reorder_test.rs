mod common;

use axum::http::{Method, StatusCode};
use serde_json::{json, Value};

use common::{spawn_app, TestApp};

async fn create_all(app: &TestApp, cookie: &str, uri: &str, bodies: Vec<Value>) -> Vec<i64> {
    let mut ids = Vec::new();
    for body in bodies {
        let reply = app.call(Method::POST, uri, Some(cookie), Some(body)).await;
        assert_eq!(reply.status, StatusCode::CREATED, "{:?}", reply.body);
        ids.push(reply.body["id"].as_i64().unwrap());
    }
    ids
}

async fn listed_ids(app: &TestApp, cookie: &str, uri: &str) -> Vec<i64> {
    let reply = app.call(Method::GET, uri, Some(cookie), None).await;
    reply
        .body
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v["id"].as_i64().unwrap())
        .collect()
}

#[tokio::test]
async fn new_rows_append_to_the_end() {
    let app = spawn_app().await;
    let cookie = app.setup_admin().await;
    let ids = create_all(
        &app,
        &cookie,
        "/api/groups",
        vec![json!({ "name": "a" }), json!({ "name": "b" }), json!({ "name": "c" })],
    )
    .await;
    let reply = app.call(Method::GET, "/api/groups", Some(&cookie), None).await;
    let orders: Vec<i64> = reply
        .body
        .as_array()
        .unwrap()
        .iter()
        .map(|g| g["order"].as_i64().unwrap())
        .collect();
    assert_eq!(orders, vec![0, 1, 2]);
    assert_eq!(listed_ids(&app, &cookie, "/api/groups").await, ids);
}

#[tokio::test]
async fn reorder_applies_a_permutation() {
    let app = spawn_app().await;
    let cookie = app.setup_admin().await;

    let groups = create_all(
        &app,
        &cookie,
        "/api/groups",
        vec![json!({ "name": "a" }), json!({ "name": "b" }), json!({ "name": "c" })],
    )
    .await;
    let items = create_all(
        &app,
        &cookie,
        "/api/items",
        vec![json!({ "title": "x" }), json!({ "title": "y" })],
    )
    .await;
    let mailbox = json!({
        "name": "m",
        "host": "imap.example.org",
        "username": "me@example.org",
        "password": "pw",
    });
    let mailboxes = create_all(
        &app,
        &cookie,
        "/api/mailboxes",
        vec![mailbox.clone(), mailbox],
    )
    .await;

    let cases = [
        ("/api/groups", vec![groups[2], groups[0], groups[1]]),
        ("/api/items", vec![items[1], items[0]]),
        ("/api/mailboxes", vec![mailboxes[1], mailboxes[0]]),
    ];
    for (uri, wanted) in cases {
        let body: Vec<Value> = wanted
            .iter()
            .enumerate()
            .map(|(order, id)| json!({ "id": id, "order": order }))
            .collect();
        let reply = app
            .call(
                Method::PUT,
                &format!("{}/reorder", uri),
                Some(&cookie),
                Some(Value::Array(body)),
            )
            .await;
        assert_eq!(reply.status, StatusCode::OK, "{} {:?}", uri, reply.body);
        assert_eq!(reply.body["updated"], json!(wanted.len()));
        assert_eq!(listed_ids(&app, &cookie, uri).await, wanted, "{}", uri);
    }
}

#[tokio::test]
async fn unknown_id_rolls_back_the_batch() {
    let app = spawn_app().await;
    let cookie = app.setup_admin().await;
    let ids = create_all(
        &app,
        &cookie,
        "/api/groups",
        vec![json!({ "name": "a" }), json!({ "name": "b" })],
    )
    .await;

    let reply = app
        .call(
            Method::PUT,
            "/api/groups/reorder",
            Some(&cookie),
            Some(json!([
                { "id": ids[1], "order": 0 },
                { "id": ids[0], "order": 1 },
                { "id": 9999, "order": 2 },
            ])),
        )
        .await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
    assert_eq!(listed_ids(&app, &cookie, "/api/groups").await, ids);
}

#[tokio::test]
async fn reorder_rejects_malformed_bodies() {
    let app = spawn_app().await;
    let cookie = app.setup_admin().await;

    let not_array = app
        .call(
            Method::PUT,
            "/api/items/reorder",
            Some(&cookie),
            Some(json!({ "id": 1, "order": 0 })),
        )
        .await;
    assert_eq!(not_array.status, StatusCode::BAD_REQUEST);
    assert!(not_array.body["error"].is_string());

    let missing_order = app
        .call(
            Method::PUT,
            "/api/items/reorder",
            Some(&cookie),
            Some(json!([{ "id": 1 }])),
        )
        .await;
    assert_eq!(missing_order.status, StatusCode::BAD_REQUEST);

    let empty = app
        .call(Method::PUT, "/api/items/reorder", Some(&cookie), Some(json!([])))
        .await;
    assert_eq!(empty.status, StatusCode::OK);
    assert_eq!(empty.body["updated"], json!(0));
}
