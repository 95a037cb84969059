//! Heartbeat (spec §4.5 step 1): the first task of every iteration,
//! unconditionally refreshing this host's own `last_seen`.

use meridian_store::{OwnedStatement, StoreClient};

pub async fn beat(store: &StoreClient, self_id: &str, now_ms: u64) -> meridian_store::Result<()> {
    let sql = format!("UPDATE server SET last_seen = {now_ms} WHERE id = '{self_id}'");
    store
        .exec_owned(self_id, vec![OwnedStatement::own(sql, self_id)])
        .await?;
    Ok(())
}
