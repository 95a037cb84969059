//! Public IP refresh (spec §4.5 step 6): rerun endpoint discovery and
//! persist the result only if it would actually change the stored
//! endpoint list.

use meridian_common::discovery;
use meridian_common::model::EndpointList;
use meridian_store::{OwnedStatement, StoreClient};

/// Returns `Some(new_list)` if discovery surfaced an endpoint not already
/// present in `current`, else `None` (nothing to write).
pub async fn refreshed_endpoints(
    fabric_iface_prefix: &str,
    fallback_hostname: &str,
    current: &EndpointList,
) -> Result<Option<EndpointList>, meridian_common::error::DiscoveryError> {
    let discovered = discovery::discover_endpoints(fabric_iface_prefix, fallback_hostname).await?;
    let already_known = discovered
        .as_slice()
        .iter()
        .all(|e| current.as_slice().contains(e));
    Ok(if already_known { None } else { Some(discovered) })
}

pub async fn persist_endpoints(
    store: &StoreClient,
    self_id: &str,
    endpoints: &EndpointList,
) -> meridian_store::Result<()> {
    let serialized = serde_json::to_string(endpoints.as_slice())
        .expect("endpoint list serializes to JSON infallibly");
    let sql = format!(
        "UPDATE server SET endpoints = '{}' WHERE id = '{self_id}'",
        serialized.replace('\'', "''")
    );
    store
        .exec_owned(self_id, vec![OwnedStatement::own(sql, self_id)])
        .await?;
    Ok(())
}
