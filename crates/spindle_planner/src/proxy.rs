//! Live-cluster plan retrieval.
//!
//! The cluster-info cache and the per-indexer metadata endpoints are
//! external oracles; they enter as traits so the planner stays a pure
//! library. The REST shapes mirrored here are `/getLocalIndexMetadata`,
//! `/stats?async=false` and `/settings`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use spindle_common::{Error, Statistics};

use crate::sizing::{MemOptimizedSizing, SizingMethod};
use crate::solution::{IndexDefn, IndexUsage, IndexerNode, Plan};

/// One node offering the index service.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeInfo {
    pub node_id: String,
    pub node_uuid: String,
    pub addr: String,
    pub server_group: String,
}

/// Cluster-info oracle: the nodes currently running the index service.
pub trait ClusterInfo: Send + Sync {
    fn index_nodes(&self) -> Result<Vec<NodeInfo>, Error>;
}

/// Per-indexer metadata endpoints.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn local_metadata(&self, addr: &str) -> Result<LocalIndexMetadata, Error>;
    async fn stats(&self, addr: &str) -> Result<Statistics, Error>;
    async fn settings(&self, addr: &str) -> Result<Statistics, Error>;
}

/// Index lifecycle states reported by the topology metadata.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IndexState {
    Created,
    Ready,
    Initial,
    Catchup,
    Active,
    Deleted,
    Error,
    #[default]
    Nil,
}

impl IndexState {
    /// Planner only accounts for indexes that hold or will hold resources:
    /// an index being deleted frees its resources eventually.
    pub fn is_planned(self) -> bool {
        !matches!(self, IndexState::Created | IndexState::Deleted | IndexState::Nil)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LocalIndexMetadata {
    #[serde(rename = "nodeUUID")]
    pub node_uuid: String,
    pub index_definitions: Vec<IndexDefn>,
    pub index_topologies: Vec<IndexTopology>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IndexTopology {
    pub bucket: String,
    pub definitions: Vec<TopologyDefnRef>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TopologyDefnRef {
    pub defn_id: u64,
    pub instances: Vec<TopologyInst>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TopologyInst {
    pub inst_id: u64,
    pub state: IndexState,
}

/// Retrieve the index layout plan from a live cluster: layout, stats and
/// settings, then sizes recomputed with the sizing formula so planning is
/// not skewed by momentary utilization.
pub async fn retrieve_plan_from_cluster(
    cluster: &dyn ClusterInfo,
    source: &dyn MetadataSource,
) -> anyhow::Result<Plan> {
    let placement = get_index_layout(cluster, source).await?;
    let mut plan = Plan {
        placement,
        mem_quota: 0,
        cpu_quota: 0,
        is_live: true,
    };
    get_index_stats(cluster, source, &mut plan).await?;
    get_index_settings(cluster, source, &mut plan).await?;

    let sizing = MemOptimizedSizing;
    for indexer in &mut plan.placement {
        for index in &mut indexer.indexes {
            sizing.compute_index_size(index);
        }
        sizing.compute_indexer_size(indexer);
    }
    Ok(plan)
}

async fn get_index_layout(
    cluster: &dyn ClusterInfo,
    source: &dyn MetadataSource,
) -> anyhow::Result<Vec<IndexerNode>> {
    let mut list = Vec::new();
    for info in cluster.index_nodes()? {
        let meta = source.local_metadata(&info.addr).await.map_err(|err| {
            tracing::error!(node = %info.node_id, error = %err, "failed to read index metadata");
            err
        })?;

        let mut node = IndexerNode::new(&info.node_id);
        node.node_uuid = meta.node_uuid.clone();
        node.server_group = info.server_group.clone();

        for defn in &meta.index_definitions {
            let Some(topology) = meta
                .index_topologies
                .iter()
                .find(|t| t.bucket == defn.bucket)
            else {
                tracing::error!(
                    bucket = %defn.bucket,
                    node = %info.node_id,
                    "no index topology for bucket"
                );
                continue;
            };
            let Some(inst) = topology
                .definitions
                .iter()
                .find(|d| d.defn_id == defn.defn_id)
                .and_then(|d| d.instances.first())
            else {
                tracing::error!(
                    defn_id = defn.defn_id,
                    node = %info.node_id,
                    "no index instance for definition"
                );
                continue;
            };
            if !inst.state.is_planned() {
                continue;
            }

            let mut index = IndexUsage::new(defn.defn_id, inst.inst_id, &defn.name, &defn.bucket);
            if !defn.nodes.is_empty() {
                index.hosts = defn.nodes.clone();
            }
            index.is_primary = defn.is_primary;
            index.is_moi = defn.using == "memory_optimized" || defn.using == "memdb";
            index.definition = Some(defn.clone());
            index.initial_node = Some(node.node_ref());
            node.indexes.push(index);
        }
        list.push(node);
    }
    Ok(list)
}

fn stat_u64(stats: &Statistics, key: &str) -> Option<u64> {
    stats.get(key).and_then(|v| v.as_f64()).map(|v| v as u64)
}

async fn get_index_stats(
    cluster: &dyn ClusterInfo,
    source: &dyn MetadataSource,
    plan: &mut Plan,
) -> anyhow::Result<()> {
    for info in cluster.index_nodes()? {
        let stats = source.stats(&info.addr).await?;

        // Total storage consumption including back-index overhead, and the
        // whole process footprint above it.
        let actual_storage_mem = stat_u64(&stats, "memory_used_storage").unwrap_or(0);
        let actual_total_mem = stat_u64(&stats, "memory_used").unwrap_or(0);
        if let Some(quota) = stat_u64(&stats, "memory_quota") {
            plan.mem_quota = quota;
        }
        let elapsed = stat_u64(&stats, "uptime").unwrap_or(0);

        let Some(indexer) = plan
            .placement
            .iter_mut()
            .find(|n| n.node_id == info.node_id)
        else {
            continue;
        };

        let mut total_data_size = 0u64;
        for index in &mut indexer.indexes {
            let prefix = format!("{}:{}", index.bucket, index.name);

            if let Some(items) = stat_u64(&stats, &format!("{prefix}:items_count")) {
                index.num_of_docs = items;
            }
            if let Some(data_size) = stat_u64(&stats, &format!("{prefix}:data_size")) {
                index.actual_mem_usage = data_size;
                total_data_size += data_size;
            }

            if let Some(size) = stat_u64(&stats, &format!("{prefix}:avg_sec_key_size")) {
                index.avg_sec_key_size = size;
            } else if !index.is_primary && index.num_of_docs != 0 && index.actual_mem_usage != 0 {
                // Not reported by older nodes; approximate from the data
                // size per entry.
                index.actual_key_size = index.actual_mem_usage / index.num_of_docs;
            }
            if let Some(size) = stat_u64(&stats, &format!("{prefix}:avg_doc_key_size")) {
                index.avg_doc_key_size = size;
            } else if index.is_primary && index.num_of_docs != 0 && index.actual_mem_usage != 0 {
                index.actual_key_size = index.actual_mem_usage / index.num_of_docs;
            }
            if let Some(size) = stat_u64(&stats, &format!("{prefix}:avg_arr_size")) {
                index.avg_arr_size = size;
            }
            if let Some(size) = stat_u64(&stats, &format!("{prefix}:avg_arr_key_size")) {
                index.avg_arr_key_size = size;
            }

            if let Some(rate) = stat_u64(&stats, &format!("{prefix}:avg_mutation_rate")) {
                index.mutation_rate = rate;
            } else if let Some(flushed) = stat_u64(&stats, &format!("{prefix}:num_flush_queued")) {
                if flushed != 0 && elapsed != 0 {
                    index.mutation_rate = flushed / elapsed;
                }
            }
            if let Some(rate) = stat_u64(&stats, &format!("{prefix}:avg_scan_rate")) {
                index.scan_rate = rate;
            } else if let Some(returned) = stat_u64(&stats, &format!("{prefix}:num_rows_returned"))
            {
                if returned != 0 && elapsed != 0 {
                    index.scan_rate = returned / elapsed;
                }
            }
        }

        // Apportion the process footprint over the indexes by data-size
        // ratio.
        for index in &mut indexer.indexes {
            if total_data_size == 0 {
                break;
            }
            let ratio = index.actual_mem_usage as f64 / total_data_size as f64;
            index.actual_mem_usage = (actual_storage_mem as f64 * ratio) as u64;
            index.actual_mem_overhead =
                ((actual_total_mem.saturating_sub(actual_storage_mem)) as f64 * ratio) as u64;
            indexer.actual_mem_usage += index.actual_mem_usage;
            indexer.actual_mem_overhead += index.actual_mem_overhead;
        }
    }
    Ok(())
}

async fn get_index_settings(
    cluster: &dyn ClusterInfo,
    source: &dyn MetadataSource,
    plan: &mut Plan,
) -> anyhow::Result<()> {
    let nodes = cluster.index_nodes()?;
    let Some(info) = nodes.first() else {
        tracing::info!("no indexing service");
        return Ok(());
    };
    let settings = source.settings(&info.addr).await?;

    let quota = stat_u64(&settings, "indexer.settings.max_cpu_percent").unwrap_or(0);
    plan.cpu_quota = if quota == 0 {
        std::thread::available_parallelism()
            .map(|n| n.get() as u64)
            .unwrap_or(1)
    } else {
        quota / 100
    };
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    struct OneNode;

    impl ClusterInfo for OneNode {
        fn index_nodes(&self) -> Result<Vec<NodeInfo>, Error> {
            Ok(vec![NodeInfo {
                node_id: "idx-0:9102".into(),
                node_uuid: "uuid-0".into(),
                addr: "idx-0:9102".into(),
                server_group: "group-a".into(),
            }])
        }
    }

    struct FixedSource;

    #[async_trait]
    impl MetadataSource for FixedSource {
        async fn local_metadata(&self, _addr: &str) -> Result<LocalIndexMetadata, Error> {
            let active = IndexDefn {
                defn_id: 1,
                name: "ix_city".into(),
                using: "memory_optimized".into(),
                bucket: "default".into(),
                sec_exprs: vec!["city".into()],
                nodes: vec!["idx-0:9102".into()],
                ..IndexDefn::default()
            };
            let created = IndexDefn {
                defn_id: 2,
                name: "ix_pending".into(),
                bucket: "default".into(),
                ..IndexDefn::default()
            };
            Ok(LocalIndexMetadata {
                node_uuid: "uuid-0".into(),
                index_definitions: vec![active, created],
                index_topologies: vec![IndexTopology {
                    bucket: "default".into(),
                    definitions: vec![
                        TopologyDefnRef {
                            defn_id: 1,
                            instances: vec![TopologyInst {
                                inst_id: 11,
                                state: IndexState::Active,
                            }],
                        },
                        TopologyDefnRef {
                            defn_id: 2,
                            instances: vec![TopologyInst {
                                inst_id: 12,
                                state: IndexState::Created,
                            }],
                        },
                    ],
                }],
            })
        }

        async fn stats(&self, _addr: &str) -> Result<Statistics, Error> {
            let mut stats = Statistics::new();
            stats.insert("memory_used_storage".into(), json!(800.0));
            stats.insert("memory_used".into(), json!(1000.0));
            stats.insert("memory_quota".into(), json!(4096.0));
            stats.insert("default:ix_city:items_count".into(), json!(100.0));
            stats.insert("default:ix_city:data_size".into(), json!(500.0));
            Ok(stats)
        }

        async fn settings(&self, _addr: &str) -> Result<Statistics, Error> {
            let mut settings = Statistics::new();
            settings.insert("indexer.settings.max_cpu_percent".into(), json!(800.0));
            Ok(settings)
        }
    }

    #[tokio::test]
    async fn live_plan_carries_layout_stats_and_settings() {
        let plan = retrieve_plan_from_cluster(&OneNode, &FixedSource)
            .await
            .unwrap();

        assert_eq!(plan.mem_quota, 4096);
        assert_eq!(plan.cpu_quota, 8);
        assert!(plan.is_live);
        assert_eq!(plan.placement.len(), 1);

        let node = &plan.placement[0];
        assert_eq!(node.node_uuid, "uuid-0");
        assert_eq!(node.server_group, "group-a");
        // The CREATED index is not planned.
        assert_eq!(node.indexes.len(), 1);

        let index = &node.indexes[0];
        assert_eq!(index.name, "ix_city");
        assert_eq!(index.inst_id, 11);
        assert_eq!(index.hosts, vec!["idx-0:9102".to_string()]);
        assert!(index.is_moi);
        assert_eq!(index.num_of_docs, 100);
        // The whole storage footprint lands on the only index.
        assert_eq!(index.actual_mem_usage, 800);
        assert_eq!(index.actual_mem_overhead, 200);
        assert_eq!(node.actual_mem_usage, 800);
    }
}
