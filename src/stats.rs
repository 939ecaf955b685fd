use crate::keys;
use crate::store::SharedStore;
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub queue_depth: usize,
    pub counters: BTreeMap<String, i64>,
}

/// Reads every `stats:*` counter plus the event queue depth.
pub async fn snapshot(store: &SharedStore) -> Result<StatsSnapshot> {
    let queue_depth = store
        .list_len(keys::EVENT_QUEUE)
        .await
        .context("read event queue depth")?;

    let mut counters = BTreeMap::new();
    for key in store.scan(keys::STATS_PATTERN).await.context("scan counters")? {
        let Some(raw) = store.get(&key).await.context("read counter")? else {
            continue;
        };
        if let Ok(value) = raw.trim().parse::<i64>() {
            let name = key.strip_prefix("stats:").unwrap_or(&key).to_string();
            counters.insert(name, value);
        }
    }

    Ok(StatsSnapshot {
        queue_depth,
        counters,
    })
}
