mod common;

use std::sync::mpsc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use axum::http::StatusCode;
use common::{acquire_db_lock, expect_data, expect_error, TestApp};
use diesel::Connection;
use futures_util::future::join_all;
use notevault::error::{AppError, ErrorKind};
use notevault::ledger::{self, Snapshot};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
struct Note {
    id: Uuid,
    title: String,
    content: String,
    summary: Option<String>,
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Version {
    version_number: i32,
    title: String,
    content: String,
    tags: Vec<String>,
    change_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NotePage {
    items: Vec<Note>,
    total: i64,
    page: i64,
    size: i64,
    pages: i64,
}

async fn create_note(app: &TestApp, token: &str, title: &str, content: &str, tags: &[&str]) -> Result<Note> {
    let response = app
        .post_json(
            "/api/notes",
            &json!({ "title": title, "content": content, "tags": tags }),
            Some(token),
        )
        .await?;
    expect_data(response, StatusCode::CREATED).await
}

async fn versions(app: &TestApp, token: &str, note_id: Uuid) -> Result<Vec<Version>> {
    let response = app
        .get(&format!("/api/notes/{note_id}/versions"), Some(token))
        .await?;
    expect_data(response, StatusCode::OK).await
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn update_and_restore_keep_history_forward_only() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let (_, token) = app.user_with_token("alice", false).await?;

    let note = create_note(&app, &token, "A", "x", &[]).await?;
    assert_eq!(note.summary.as_deref(), Some("A: x"));
    let history = versions(&app, &token, note.id).await?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].version_number, 1);
    assert_eq!(history[0].change_description.as_deref(), Some("initial version"));

    let response = app
        .put_json(
            &format!("/api/notes/{}", note.id),
            &json!({ "content": "y" }),
            Some(&token),
        )
        .await?;
    let updated: Note = expect_data(response, StatusCode::OK).await?;
    assert_eq!(updated.content, "y");
    assert_eq!(updated.title, "A");

    let response = app
        .post_json(
            &format!("/api/notes/{}/versions/1/restore", note.id),
            &json!({}),
            Some(&token),
        )
        .await?;
    let restored: Note = expect_data(response, StatusCode::OK).await?;
    assert_eq!(restored.content, "x");

    let history = versions(&app, &token, note.id).await?;
    let numbers: Vec<i32> = history.iter().map(|v| v.version_number).collect();
    assert_eq!(numbers, vec![3, 2, 1]);
    assert_eq!(history[0].content, "x");
    assert_eq!(
        history[0].change_description.as_deref(),
        Some("restored from version 1")
    );
    assert_eq!(history[1].content, "y");
    assert_eq!(history[2].content, "x");

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn sequential_updates_produce_gapless_versions() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let (_, token) = app.user_with_token("alice", false).await?;

    let note = create_note(&app, &token, "Draft", "v0", &["work"]).await?;
    for n in 1..=4 {
        let response = app
            .patch_json(
                &format!("/api/notes/{}", note.id),
                &json!({ "content": format!("v{n}"), "change_description": format!("edit {n}") }),
                Some(&token),
            )
            .await?;
        let _: Note = expect_data(response, StatusCode::OK).await?;
    }
    let response = app
        .post_json(
            &format!("/api/notes/{}/tags", note.id),
            &json!({ "tags": ["personal", " work ", "personal", ""] }),
            Some(&token),
        )
        .await?;
    let tagged: Note = expect_data(response, StatusCode::OK).await?;
    assert_eq!(tagged.tags, vec!["personal", "work"]);

    let history = versions(&app, &token, note.id).await?;
    let numbers: Vec<i32> = history.iter().map(|v| v.version_number).collect();
    assert_eq!(numbers, vec![6, 5, 4, 3, 2, 1]);
    assert_eq!(history[0].change_description.as_deref(), Some("tag update"));
    assert_eq!(history[0].content, "v4");
    assert_eq!(history[0].tags, tagged.tags);
    assert_eq!(history[1].change_description.as_deref(), Some("edit 4"));

    let response = app
        .get(&format!("/api/notes/{}/versions/3", note.id), Some(&token))
        .await?;
    let third: Version = expect_data(response, StatusCode::OK).await?;
    assert_eq!(third.content, "v2");
    assert_eq!(third.title, "Draft");

    let response = app
        .get(&format!("/api/notes/{}/versions/42", note.id), Some(&token))
        .await?;
    assert_eq!(expect_error(response, StatusCode::NOT_FOUND).await?, "NOT_FOUND");

    app.cleanup().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "requires TEST_DATABASE_URL"]
async fn concurrent_updates_never_share_a_version_number() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::with_config(|config| config.version_conflict_retries = 5).await?;
    let (_, token) = app.user_with_token("alice", false).await?;
    let note = create_note(&app, &token, "Race", "start", &[]).await?;

    let path = format!("/api/notes/{}", note.id);
    let left = json!({ "content": "left" });
    let right = json!({ "content": "right" });
    let (first, second) = tokio::join!(
        app.put_json(&path, &left, Some(&token)),
        app.put_json(&path, &right, Some(&token)),
    );
    let statuses = [first?.status(), second?.status()];
    assert!(statuses.iter().any(|status| *status == StatusCode::OK));
    assert!(statuses
        .iter()
        .all(|status| *status == StatusCode::OK || *status == StatusCode::CONFLICT));
    let successes = statuses.iter().filter(|s| **s == StatusCode::OK).count();

    let history = versions(&app, &token, note.id).await?;
    let mut numbers: Vec<i32> = history.iter().map(|v| v.version_number).collect();
    numbers.sort_unstable();
    let expected: Vec<i32> = (1..=(1 + successes as i32)).collect();
    assert_eq!(numbers, expected);

    let response = app.get(&path, Some(&token)).await?;
    let current: Note = expect_data(response, StatusCode::OK).await?;
    assert_eq!(current.content, history[0].content);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires TEST_DATABASE_URL"]
async fn single_attempt_writers_keep_versions_gapless() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::with_config(|config| {
        config.version_conflict_retries = 1;
        config.database_max_pool_size = 8;
    })
    .await?;
    let (_, token) = app.user_with_token("alice", false).await?;
    let note = create_note(&app, &token, "Race", "start", &[]).await?;

    let path = format!("/api/notes/{}", note.id);
    let bodies: Vec<_> = (0..8).map(|n| json!({ "content": format!("writer {n}") })).collect();
    let responses = join_all(
        bodies
            .iter()
            .map(|body| app.put_json(&path, body, Some(&token))),
    )
    .await;

    let mut successes = 0;
    for response in responses {
        let status = response?.status();
        assert!(
            status == StatusCode::OK || status == StatusCode::CONFLICT,
            "unexpected status {status}"
        );
        if status == StatusCode::OK {
            successes += 1;
        }
    }
    assert!(successes >= 1);

    let history = versions(&app, &token, note.id).await?;
    let mut numbers: Vec<i32> = history.iter().map(|v| v.version_number).collect();
    numbers.sort_unstable();
    let expected: Vec<i32> = (1..=(1 + successes)).collect();
    assert_eq!(numbers, expected);

    app.cleanup().await?;
    Ok(())
}

fn snapshot(content: &str) -> Snapshot {
    Snapshot {
        title: "Race".to_string(),
        content: content.to_string(),
        summary: None,
        tags: Vec::new(),
    }
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn racing_ledger_writer_gets_conflict_then_retries() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let (_, token) = app.user_with_token("alice", false).await?;
    let note = create_note(&app, &token, "Race", "start", &[]).await?;
    let document_id = note.id;

    let pool = app.state.pool.clone();
    let outcome = tokio::task::spawn_blocking(move || -> Result<(i32, ErrorKind, i32)> {
        let mut holder = pool.get()?;
        let mut racer = pool.get()?;
        let (ready_tx, ready_rx) = mpsc::channel::<()>();

        // The holder inserts version 2 and keeps its transaction open while
        // the racer reads the same max and blocks on the unique index.
        let (held, raced) = std::thread::scope(|scope| {
            let racer_thread = scope.spawn(move || {
                let _ = ready_rx.recv();
                racer.transaction::<_, AppError, _>(|conn| {
                    ledger::record_next_version(conn, document_id, &snapshot("racer"), None)
                })
                .map(|version| version.version_number)
                .map_err(|err| err.kind())
            });

            let held = holder.transaction::<_, AppError, _>(|conn| {
                let version =
                    ledger::record_next_version(conn, document_id, &snapshot("holder"), None)?;
                let _ = ready_tx.send(());
                std::thread::sleep(Duration::from_millis(500));
                Ok(version.version_number)
            });
            (held, racer_thread.join())
        });

        let held = held.map_err(|err| anyhow!("holder failed: {err}"))?;
        let raced_kind = match raced.map_err(|_| anyhow!("racer panicked"))? {
            Ok(number) => return Err(anyhow!("racer unexpectedly wrote version {number}")),
            Err(kind) => kind,
        };

        let mut conn = pool.get()?;
        let retried = ledger::with_conflict_retry(3, |_| {
            conn.transaction::<_, AppError, _>(|conn| {
                ledger::record_next_version(conn, document_id, &snapshot("racer"), None)
            })
        })
        .map_err(|err| anyhow!("retry failed: {err}"))?;
        Ok((held, raced_kind, retried.version_number))
    })
    .await??;

    assert_eq!(outcome, (2, ErrorKind::Conflict, 3));
    let history = versions(&app, &token, note.id).await?;
    let numbers: Vec<i32> = history.iter().map(|v| v.version_number).collect();
    assert_eq!(numbers, vec![3, 2, 1]);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn second_initial_version_is_a_conflict() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let (_, token) = app.user_with_token("alice", false).await?;
    let note = create_note(&app, &token, "Once", "body", &[]).await?;

    let pool = app.state.pool.clone();
    let document_id = note.id;
    let kind = tokio::task::spawn_blocking(move || -> Result<ErrorKind> {
        let mut conn = pool.get()?;
        let err = ledger::record_initial_version(
            &mut conn,
            document_id,
            &snapshot("again"),
            Some("initial version"),
        )
        .err()
        .ok_or_else(|| anyhow!("second initial version was accepted"))?;
        Ok(err.kind())
    })
    .await??;
    assert_eq!(kind, ErrorKind::Conflict);

    let history = versions(&app, &token, note.id).await?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].content, "body");

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn notes_are_private_even_to_superusers() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let (_, owner) = app.user_with_token("alice", false).await?;
    let (_, other) = app.user_with_token("bob", false).await?;
    let (_, admin) = app.user_with_token("root", true).await?;

    let note = create_note(&app, &owner, "Secret", "hidden", &[]).await?;
    let path = format!("/api/notes/{}", note.id);

    for token in [&other, &admin] {
        let response = app.get(&path, Some(token)).await?;
        assert_eq!(expect_error(response, StatusCode::FORBIDDEN).await?, "FORBIDDEN");
        let response = app
            .put_json(&path, &json!({ "title": "taken" }), Some(token))
            .await?;
        expect_error(response, StatusCode::FORBIDDEN).await?;
        let response = app.delete(&path, Some(token)).await?;
        expect_error(response, StatusCode::FORBIDDEN).await?;
    }

    let response = app.get(&path, None).await?;
    assert_eq!(
        expect_error(response, StatusCode::UNAUTHORIZED).await?,
        "UNAUTHORIZED"
    );

    let response = app.delete(&path, Some(&owner)).await?;
    let _: Option<()> = expect_data(response, StatusCode::OK).await?;
    assert_eq!(app.count_rows("document_versions").await?, 0);
    let response = app.get(&path, Some(&owner)).await?;
    expect_error(response, StatusCode::NOT_FOUND).await?;

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn list_search_and_tags_are_scoped_to_owner() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let (alice_id, alice) = app.user_with_token("alice", false).await?;
    let (_, bob) = app.user_with_token("bob", false).await?;
    let (_, admin) = app.user_with_token("root", true).await?;

    create_note(&app, &alice, "Groceries", "milk and eggs", &["home"]).await?;
    create_note(&app, &alice, "Standup", "Discuss MILK budget", &["work"]).await?;
    create_note(&app, &alice, "Ideas", "nothing yet", &["work", "later"]).await?;
    create_note(&app, &bob, "Bob milk", "milk", &["home"]).await?;

    let response = app.get("/api/notes?page=1&size=2", Some(&alice)).await?;
    let page: NotePage = expect_data(response, StatusCode::OK).await?;
    assert_eq!(page.total, 3);
    assert_eq!(page.items.len(), 2);
    assert_eq!((page.page, page.size, page.pages), (1, 2, 2));
    assert_eq!(page.items[0].title, "Ideas");

    let response = app.get("/api/notes?tags=work", Some(&alice)).await?;
    let page: NotePage = expect_data(response, StatusCode::OK).await?;
    assert_eq!(page.total, 2);

    let response = app
        .get("/api/notes/search?query=milk&limit=10", Some(&alice))
        .await?;
    let found: Vec<Note> = expect_data(response, StatusCode::OK).await?;
    let titles: Vec<&str> = found.iter().map(|n| n.title.as_str()).collect();
    assert_eq!(titles, vec!["Standup", "Groceries"]);

    let response = app.get("/api/notes/tags", Some(&alice)).await?;
    let tags: Vec<String> = expect_data(response, StatusCode::OK).await?;
    assert_eq!(tags, vec!["home", "later", "work"]);

    let response = app
        .get(&format!("/api/notes?user_id={alice_id}"), Some(&bob))
        .await?;
    expect_error(response, StatusCode::FORBIDDEN).await?;

    let response = app
        .get(&format!("/api/notes?user_id={alice_id}"), Some(&admin))
        .await?;
    let page: NotePage = expect_data(response, StatusCode::OK).await?;
    assert_eq!(page.total, 3);

    let response = app.get("/api/notes?size=101", Some(&alice)).await?;
    assert_eq!(expect_error(response, StatusCode::BAD_REQUEST).await?, "VALIDATION");

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn invalid_titles_are_rejected() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let (_, token) = app.user_with_token("alice", false).await?;

    let response = app
        .post_json(
            "/api/notes",
            &json!({ "title": "   ", "content": "body" }),
            Some(&token),
        )
        .await?;
    assert_eq!(expect_error(response, StatusCode::BAD_REQUEST).await?, "VALIDATION");
    assert_eq!(app.count_rows("documents").await?, 0);

    let long_title = "t".repeat(201);
    let response = app
        .post_json(
            "/api/notes",
            &json!({ "title": long_title, "content": "body" }),
            Some(&token),
        )
        .await?;
    expect_error(response, StatusCode::BAD_REQUEST).await?;

    app.cleanup().await?;
    Ok(())
}
