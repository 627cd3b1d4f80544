//! Integration tests for transaction scopes on the embedded in-memory database.

use db_bridge::db::{Pool, SqliteFactory, in_memory_pool};
use db_bridge::error::{DbError, ErrorKind};
use db_bridge::models::Value;

async fn setup() -> Pool<SqliteFactory> {
    let pool = in_memory_pool().unwrap();
    pool.update(
        "create table testtbl (ID INTEGER PRIMARY KEY AUTOINCREMENT, NAME VARCHAR(300))",
        &[],
    )
    .await
    .unwrap();
    pool.update("insert into testtbl (NAME) values('Foo bar baz')", &[])
        .await
        .unwrap();
    pool
}

async fn count(pool: &Pool<SqliteFactory>) -> usize {
    pool.query("select * from testtbl", &[]).await.unwrap().len()
}

#[derive(Debug)]
#[allow(dead_code)]
enum AppError {
    Fake(&'static str),
    Db(DbError),
}

impl From<DbError> for AppError {
    fn from(e: DbError) -> Self {
        AppError::Db(e)
    }
}

#[tokio::test]
async fn test_commit_transaction() {
    let pool = setup().await;
    let id = pool
        .transaction(|tx| {
            Box::pin(async move {
                let id = tx
                    .insert_and_get_id("insert into testtbl (NAME) values(?)", &[Value::from("Transaction 1")])
                    .await?;
                tx.update("update testtbl set NAME=? where ID=?", &[Value::from("Transaction 2"), Value::Int(id)])
                    .await?;
                Ok::<_, DbError>(id)
            })
        })
        .await
        .unwrap();

    let res = pool
        .query("select NAME from testtbl where ID=?", &[Value::Int(id)])
        .await
        .unwrap();
    assert_eq!(res[0]["NAME"], Value::from("Transaction 2"));
    assert_eq!(pool.status().leased, 0);
}

#[tokio::test]
async fn test_rollback_transaction() {
    let pool = setup().await;
    let err = pool
        .transaction(|tx| {
            Box::pin(async move {
                tx.insert_and_get_id("insert into testtbl (NAME) values(?)", &[Value::from("Transaction 1")])
                    .await?;
                Err::<(), _>(AppError::Fake("fake error"))
            })
        })
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Fake("fake error")));
    assert_eq!(count(&pool).await, 1);
}

#[tokio::test]
async fn test_batch_update_in_transaction_rolls_back() {
    let pool = setup().await;
    let err = pool
        .transaction(|tx| {
            Box::pin(async move {
                tx.update("insert into testtbl (NAME) values('kept?')", &[])
                    .await?;
                tx.batch_update(
                    "insert into testtbl (NAME, MISSING) values(?, ?)",
                    &[vec![Value::from("a"), Value::Int(1)]],
                )
                .await
            })
        })
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Execution);
    assert_eq!(count(&pool).await, 1);
}

#[tokio::test]
async fn test_reads_inside_transaction_see_own_writes() {
    let pool = setup().await;
    let seen = pool
        .transaction(|tx| {
            Box::pin(async move {
                tx.update("delete from testtbl", &[]).await?;
                let mut statement = tx.execute("select * from testtbl", &[]).await?;
                let rows = statement.as_array().await?;
                Ok::<_, AppError>(rows.len())
            })
        })
        .await
        .unwrap();

    assert_eq!(seen, 0);
    assert_eq!(count(&pool).await, 0);
}

#[tokio::test]
async fn test_handle_is_reusable_after_rollback() {
    let pool = setup().await;
    let mut handle = pool.acquire().await.unwrap();
    let err = handle
        .transaction(|tx| {
            Box::pin(async move {
                tx.update("delete from testtbl", &[]).await?;
                Err::<(), _>(DbError::execution("execute", "boom"))
            })
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("boom"));
    assert!(!handle.in_transaction());

    let rows = handle.query("select * from testtbl", &[]).await.unwrap();
    assert_eq!(rows.len(), 1);
    pool.release(handle).unwrap();
    assert_eq!(pool.status().idle, 1);
}

#[tokio::test]
async fn test_nested_transaction_is_rejected() {
    let pool = setup().await;
    let err = pool
        .transaction(|tx| {
            Box::pin(async move {
                tx.update("delete from testtbl", &[]).await?;
                tx.transaction(|inner| {
                    Box::pin(async move { inner.update("delete from testtbl", &[]).await })
                })
                .await
            })
        })
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Usage);
    assert_eq!(count(&pool).await, 1);
}
