//! Store smoke tests against a locally provisioned Postgres, for machines
//! with server binaries but no container runtime.

use soulgate_events::TransferOutcome;
use soulgate_test_support::postgres::start_postgres;
use soulgate_transfers::{Transfer, TransferFilter, TransferStore};
use sqlx::postgres::PgPoolOptions;

#[tokio::test]
async fn store_round_trips_on_a_disposable_database() -> anyhow::Result<()> {
    let postgres = match start_postgres() {
        Ok(db) => db,
        Err(err) => {
            eprintln!("skipping store_round_trips_on_a_disposable_database: {err}");
            return Ok(());
        }
    };
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(postgres.connection_string())
        .await?;
    let store = TransferStore::new(pool.clone()).await?;

    let first = Transfer::new_upload("alice", "@@music\\a.mp3", 64);
    store.add_or_supersede(&first).await?;
    let second = Transfer::new_upload("alice", "@@music\\a.mp3", 64);
    store.add_or_supersede(&second).await?;

    let live = store.list(&TransferFilter::uploads_for("alice")).await?;
    assert_eq!(live.len(), 1, "supersede keeps one live record");
    assert_eq!(live[0].id, second.id);

    let summary = store
        .summarize(&TransferFilter::uploads_for("alice").not_ended())
        .await?;
    assert_eq!(summary.files, 1);
    assert_eq!(summary.total_bytes, 64);

    let mut finished = second.clone();
    finished.complete(TransferOutcome::Succeeded, None);
    store.update(&finished).await?;

    // Only the superseded, never-finished record needs reconciling.
    let reconciled = store.startup_cleanup().await?;
    assert_eq!(reconciled, 1);
    let untouched = store
        .find(second.id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("record should exist"))?;
    assert_eq!(untouched.outcome, TransferOutcome::Succeeded);

    pool.close().await;
    Ok(())
}
