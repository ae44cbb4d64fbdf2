use chrono::{Duration, Utc};
use sqlx::Row;
use tempfile::TempDir;
use uploadq::{QueueError, SqlValue, Status, UploadQueue, UploadRequest};

fn photo(n: u32) -> UploadRequest {
    UploadRequest {
        source_uri: format!("file:///var/app/dummy/photo{n}.jpg"),
        file_name: format!("photo{n}.jpg"),
        latitude: Some(38.473469),
        longitude: Some(-121.821177),
        accuracy: Some(40.0),
        metadata: r#"{"device":666,"targetWidth":1536,"targetHeight":2048}"#.into(),
    }
}

async fn open_queue(dir: &TempDir) -> UploadQueue {
    UploadQueue::open(dir.path()).await.unwrap()
}

#[tokio::test]
async fn reports_database_parameters() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir).await;

    let params = queue.db_params();
    assert_eq!(params.short_name, "uploadq");
    assert_eq!(params.version, "1.0");
    assert!(!params.display_name.is_empty());
    assert!(params.max_size > 0);
}

#[tokio::test]
async fn fresh_queue_is_empty() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir).await;

    assert_eq!(queue.length(None).await.unwrap(), 0);
    assert_eq!(queue.length(Some(Status::Queued)).await.unwrap(), 0);
}

#[tokio::test]
async fn enqueue_reports_new_length() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir).await;

    let id = queue.enqueue(photo(1)).await.unwrap();
    assert!(id > 0);

    assert_eq!(queue.length(None).await.unwrap(), 1);
    assert_eq!(queue.length(Some(Status::Queued)).await.unwrap(), 1);
    assert_eq!(queue.length(Some(Status::Done)).await.unwrap(), 0);
    assert_eq!(queue.length(Some(Status::Uploading)).await.unwrap(), 0);
}

#[tokio::test]
async fn enqueue_rejects_empty_fields() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir).await;

    let mut req = photo(1);
    req.source_uri = String::new();
    let err = queue.enqueue(req).await.unwrap_err();
    assert!(matches!(err, QueueError::InvalidRequest(_)));

    let mut req = photo(1);
    req.file_name = String::new();
    let err = queue.enqueue(req).await.unwrap_err();
    assert!(matches!(err, QueueError::InvalidRequest(_)));

    assert_eq!(queue.length(None).await.unwrap(), 0);
}

#[tokio::test]
async fn duplicate_source_uris_are_independent_records() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir).await;

    let a = queue.enqueue(photo(1)).await.unwrap();
    let b = queue.enqueue(photo(1)).await.unwrap();
    assert_ne!(a, b);
    assert_eq!(queue.length(Some(Status::Queued)).await.unwrap(), 2);
}

#[tokio::test]
async fn finds_queued_records_oldest_first() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir).await;

    for n in 1..=3 {
        queue.enqueue(photo(n)).await.unwrap();
    }

    let rows = queue.find_all_by_status(Status::Queued).await.unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].file_name, "photo1.jpg");
    assert_eq!(rows[1].file_name, "photo2.jpg");
    assert_eq!(rows[2].file_name, "photo3.jpg");
    assert_eq!(rows[0].source_uri, "file:///var/app/dummy/photo1.jpg");
    assert_eq!(rows[0].status, Status::Queued);
    assert_eq!(
        rows[0].metadata,
        r#"{"device":666,"targetWidth":1536,"targetHeight":2048}"#
    );
}

#[tokio::test]
async fn dequeue_on_empty_queue_is_none() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir).await;

    assert!(queue.dequeue_next().await.unwrap().is_none());
}

#[tokio::test]
async fn dequeue_claims_oldest_and_marks_uploading() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir).await;

    let first = queue.enqueue(photo(1)).await.unwrap();
    queue.enqueue(photo(2)).await.unwrap();

    let claimed = queue.dequeue_next().await.unwrap().unwrap();
    assert_eq!(claimed.id, first);
    assert_eq!(claimed.status, Status::Uploading);

    assert_eq!(queue.length(Some(Status::Queued)).await.unwrap(), 1);
    assert_eq!(queue.length(Some(Status::Uploading)).await.unwrap(), 1);

    let uploading = queue.find_all_by_status(Status::Uploading).await.unwrap();
    assert_eq!(uploading.len(), 1);
    assert_eq!(uploading[0].id, first);
}

#[tokio::test]
async fn concurrent_dequeues_claim_at_most_once() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir).await;

    queue.enqueue(photo(1)).await.unwrap();

    let other = queue.clone();
    let (a, b) = tokio::join!(queue.dequeue_next(), other.dequeue_next());
    let claims = [a.unwrap(), b.unwrap()];
    assert_eq!(claims.iter().filter(|c| c.is_some()).count(), 1);
}

#[tokio::test]
async fn mark_done_completes_an_uploading_record() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir).await;

    queue.enqueue(photo(1)).await.unwrap();
    let claimed = queue.dequeue_next().await.unwrap().unwrap();

    queue.mark_done(claimed.id).await.unwrap();
    assert_eq!(queue.length(Some(Status::Queued)).await.unwrap(), 0);
    assert_eq!(queue.length(Some(Status::Uploading)).await.unwrap(), 0);
    assert_eq!(queue.length(Some(Status::Done)).await.unwrap(), 1);

    // DONE is terminal.
    let err = queue.mark_done(claimed.id).await.unwrap_err();
    assert!(matches!(err, QueueError::InvalidTransition { .. }));
    assert_eq!(queue.length(Some(Status::Done)).await.unwrap(), 1);
}

#[tokio::test]
async fn mark_failed_then_requeue_reenters_the_queue() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir).await;

    let id = queue.enqueue(photo(1)).await.unwrap();
    queue.dequeue_next().await.unwrap().unwrap();

    queue.mark_failed(id).await.unwrap();
    assert_eq!(queue.length(Some(Status::Failed)).await.unwrap(), 1);

    queue.requeue(id).await.unwrap();
    assert_eq!(queue.length(Some(Status::Queued)).await.unwrap(), 1);

    // And the record is claimable again.
    let claimed = queue.dequeue_next().await.unwrap().unwrap();
    assert_eq!(claimed.id, id);
}

#[tokio::test]
async fn transitions_off_the_lifecycle_edges_are_rejected() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir).await;

    let id = queue.enqueue(photo(1)).await.unwrap();

    // QUEUED record cannot be completed or failed without a claim.
    assert!(matches!(
        queue.mark_done(id).await.unwrap_err(),
        QueueError::InvalidTransition { .. }
    ));
    assert!(matches!(
        queue.mark_failed(id).await.unwrap_err(),
        QueueError::InvalidTransition { .. }
    ));
    assert!(matches!(
        queue.requeue(id).await.unwrap_err(),
        QueueError::InvalidTransition { .. }
    ));

    // The guard left the record untouched.
    assert_eq!(queue.length(Some(Status::Queued)).await.unwrap(), 1);
}

#[tokio::test]
async fn unknown_ids_resolve_to_not_found() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir).await;

    assert!(matches!(
        queue.mark_done(999).await.unwrap_err(),
        QueueError::NotFound(999)
    ));
    assert!(matches!(
        queue.remove(999).await.unwrap_err(),
        QueueError::NotFound(999)
    ));
}

#[tokio::test]
async fn remove_deletes_only_queued_records() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir).await;

    let id = queue.enqueue(photo(1)).await.unwrap();
    queue.remove(id).await.unwrap();
    assert_eq!(queue.length(None).await.unwrap(), 0);

    let id = queue.enqueue(photo(2)).await.unwrap();
    queue.dequeue_next().await.unwrap().unwrap();
    let err = queue.remove(id).await.unwrap_err();
    assert!(matches!(err, QueueError::InvalidTransition { .. }));
    assert_eq!(queue.length(None).await.unwrap(), 1);
}

#[tokio::test]
async fn empty_reports_the_number_of_rows_removed() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir).await;

    for n in 1..=4 {
        queue.enqueue(photo(n)).await.unwrap();
    }

    assert_eq!(queue.empty().await.unwrap(), 4);
    assert_eq!(queue.length(None).await.unwrap(), 0);
    assert_eq!(queue.empty().await.unwrap(), 0);
}

#[tokio::test]
async fn requeue_stale_recovers_old_uploading_records() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir).await;

    queue.enqueue(photo(1)).await.unwrap();
    let claimed = queue.dequeue_next().await.unwrap().unwrap();

    // A fresh claim is within any reasonable grace window.
    let requeued = queue
        .requeue_stale(Utc::now() - Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(requeued, 0);
    assert_eq!(queue.length(Some(Status::Uploading)).await.unwrap(), 1);

    // A cutoff past the claim time sweeps it back to QUEUED.
    let requeued = queue
        .requeue_stale(Utc::now() + Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(requeued, 1);
    assert_eq!(queue.length(Some(Status::Queued)).await.unwrap(), 1);

    let recovered = queue.dequeue_next().await.unwrap().unwrap();
    assert_eq!(recovered.id, claimed.id);
}

#[tokio::test]
async fn corrupt_status_rows_are_excluded_from_filtered_counts() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir).await;

    queue.enqueue(photo(1)).await.unwrap();
    queue
        .execute_sql(
            "INSERT INTO uploads \
                (source_uri, file_name, metadata, status, created_at, updated_at) \
             VALUES (?1, ?2, '', 'BOGUS', ?3, ?3)",
            &[
                SqlValue::from("file:///var/app/dummy/corrupt.jpg"),
                SqlValue::from("corrupt.jpg"),
                SqlValue::from("2024-01-01 00:00:00"),
            ],
        )
        .await
        .unwrap();

    // Visible unfiltered, never in a filtered aggregate, never claimable.
    assert_eq!(queue.length(None).await.unwrap(), 2);
    assert_eq!(queue.length(Some(Status::Queued)).await.unwrap(), 1);
    assert_eq!(queue.length(Some(Status::Failed)).await.unwrap(), 0);

    let claimed = queue.dequeue_next().await.unwrap().unwrap();
    assert_eq!(claimed.file_name, "photo1.jpg");
    assert!(queue.dequeue_next().await.unwrap().is_none());
}

#[tokio::test]
async fn sql_passthrough_round_trips_rows_and_errors() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir).await;

    queue
        .execute_sql("CREATE TABLE IF NOT EXISTS test1 (id INT);", &[])
        .await
        .unwrap();
    let inserted = queue
        .execute_sql("INSERT INTO test1 (id) VALUES (?1)", &[SqlValue::from(7i64)])
        .await
        .unwrap();
    assert_eq!(inserted.rows_affected, 1);

    // Result sets are loggable; rows themselves stay opaque.
    assert_eq!(
        format!("{inserted:?}"),
        "ResultSet { rows: 0, rows_affected: 1 }"
    );

    let selected = queue.execute_sql("SELECT id FROM test1", &[]).await.unwrap();
    assert_eq!(selected.rows.len(), 1);
    assert_eq!(selected.rows[0].get::<i64, _>("id"), 7);

    // First drop succeeds, second fails; neither takes the process down.
    queue.execute_sql("DROP TABLE test1;", &[]).await.unwrap();
    let err = queue.execute_sql("DROP TABLE test1;", &[]).await.unwrap_err();
    assert!(matches!(err, QueueError::Storage(_)));

    let err = queue
        .execute_sql("THIS IS NOT SQL", &[])
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::Storage(_)));
}

#[tokio::test]
async fn schema_bootstrap_is_idempotent() {
    let dir = TempDir::new().unwrap();

    let first = open_queue(&dir).await;
    first.enqueue(photo(1)).await.unwrap();

    // A second instance over the same store re-runs the bootstrap without
    // clobbering anything.
    let second = open_queue(&dir).await;
    assert_eq!(second.length(None).await.unwrap(), 1);

    // Instances sharing one handle observe each other's writes.
    let shared = UploadQueue::with_handle(first.handle().clone())
        .await
        .unwrap();
    shared.enqueue(photo(2)).await.unwrap();
    assert_eq!(first.length(None).await.unwrap(), 2);
}

#[tokio::test]
async fn queue_survives_reopen() {
    let dir = TempDir::new().unwrap();

    {
        let queue = open_queue(&dir).await;
        queue.enqueue(photo(1)).await.unwrap();
        let claimed = queue.dequeue_next().await.unwrap().unwrap();
        queue.mark_done(claimed.id).await.unwrap();
        queue.enqueue(photo(2)).await.unwrap();
    }

    // "Restart": a fresh handle over the same directory sees the same rows.
    let queue = open_queue(&dir).await;
    assert_eq!(queue.length(None).await.unwrap(), 2);
    assert_eq!(queue.length(Some(Status::Done)).await.unwrap(), 1);
    assert_eq!(queue.length(Some(Status::Queued)).await.unwrap(), 1);

    let claimed = queue.dequeue_next().await.unwrap().unwrap();
    assert_eq!(claimed.file_name, "photo2.jpg");
}
