use std::collections::HashSet;

use spt_common::Result;
use sqlx::PgPool;

/// Backend pids of every session currently connected to the server.
pub async fn live_backend_pids(pool: &PgPool) -> Result<HashSet<i32>> {
    let rows = sqlx::query_as::<_, (i32,)>("SELECT pid FROM pg_stat_activity WHERE pid IS NOT NULL")
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(|(pid,)| pid).collect())
}

/// Backend pid of one pooled connection.
pub async fn backend_pid(pool: &PgPool) -> Result<i32> {
    let (pid,) = sqlx::query_as::<_, (i32,)>("SELECT pg_backend_pid()")
        .fetch_one(pool)
        .await?;
    Ok(pid)
}
