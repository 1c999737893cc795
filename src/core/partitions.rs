//! Applies dynamic partition mutations requested by an evaluation.

use tracing::info;

use super::EngineError;
use crate::domain::{DynamicPartitionsRequest, DynamicPartitionsRequestResult};
use crate::store::PartitionStore;

/// Apply one add/delete request.
///
/// Keys are split into existing and missing first. Adding skips the keys that
/// already exist; deleting skips the keys that are missing.
pub async fn apply_partitions_request<S: PartitionStore + ?Sized>(
    store: &S,
    request: &DynamicPartitionsRequest,
) -> Result<DynamicPartitionsRequestResult, EngineError> {
    let name = request.partitions_def_name();

    let mut existing = Vec::new();
    let mut missing = Vec::new();
    for key in request.partition_keys() {
        if store.has_dynamic_partition(name, key).await? {
            existing.push(key.clone());
        } else {
            missing.push(key.clone());
        }
    }

    let result = match request {
        DynamicPartitionsRequest::Add { .. } => {
            if !existing.is_empty() {
                info!(
                    partitions_def = name,
                    keys = ?existing,
                    "Skipping addition of partition keys that already exist"
                );
            }
            store.add_dynamic_partitions(name, &missing).await?;
            info!(partitions_def = name, keys = ?missing, "Added partition keys");

            DynamicPartitionsRequestResult {
                partitions_def_name: name.to_string(),
                added_partitions: Some(missing),
                deleted_partitions: None,
                skipped_partitions: existing,
            }
        }
        DynamicPartitionsRequest::Delete { .. } => {
            if !missing.is_empty() {
                info!(
                    partitions_def = name,
                    keys = ?missing,
                    "Skipping deletion of partition keys that do not exist"
                );
            }
            for key in &existing {
                store.delete_dynamic_partition(name, key).await?;
            }
            info!(partitions_def = name, keys = ?existing, "Deleted partition keys");

            DynamicPartitionsRequestResult {
                partitions_def_name: name.to_string(),
                added_partitions: None,
                deleted_partitions: Some(existing),
                skipped_partitions: missing,
            }
        }
    };

    Ok(result)
}
