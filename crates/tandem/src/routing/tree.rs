//! Routing-tree loading, discovery and per-request routing calculation.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use crate::error::{RoutingError, StorageError, TaskError};
use crate::objects::{Extension, ExtensionType, ForwardingMode, Yate};
use crate::routing::{CallTarget, RouteGenerator, RoutingResult};
use crate::storage::RoutingStorage;

/// Discovery gives up below this depth and routes the partial tree.
pub const MAX_ROUTING_TREE_DEPTH: usize = 10;

/// Everything generation needs besides the tree itself.
pub struct RoutingContext<'a> {
    pub local_yate_id: i32,
    pub yates: &'a HashMap<i32, Yate>,
    pub ringback_top_directory: &'a Path,
    /// Seam for the ringback file probe; production passes a plain
    /// `Path::is_file` check.
    pub ringback_probe: &'a (dyn Fn(&Path) -> bool + Send + Sync),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryReport {
    /// Discovery hit the depth limit somewhere.
    pub failed: bool,
    /// At least one cyclic reference was cut.
    pub pruned: bool,
}

pub struct RoutingOutcome {
    pub result: RoutingResult,
    /// Sub-plans to be written into the routing cache, keyed by their
    /// deferred-route name.
    pub cache_entries: BTreeMap<String, RoutingResult>,
    /// Per-node results keyed by tree identifier, for diagnostics.
    pub node_results: BTreeMap<String, RoutingResult>,
}

/// One request's routing tree: the caller, the resolved target and the
/// in-memory graph hanging off it. The tree owns its extensions; every
/// mutation stays local to the request.
pub struct RoutingTree {
    pub source: Extension,
    pub target: Extension,
    pub dialed_number: String,
    source_params: BTreeMap<String, String>,
}

impl RoutingTree {
    /// Resolves the dialed number to an extension, falling back to a trunk
    /// prefix match. An unknown target is a `noroute`.
    pub async fn load(
        storage: &dyn RoutingStorage,
        source: Extension,
        dialed_number: &str,
        source_params: BTreeMap<String, String>,
    ) -> Result<Self, TaskError> {
        let mut target = match storage.load_extension(dialed_number).await {
            Ok(extension) => extension,
            Err(StorageError::NotFound(_)) => {
                // one rescue attempt: the number may route via a trunk
                match storage.load_trunk_extension(dialed_number).await {
                    Ok(trunk) => trunk,
                    Err(StorageError::NotFound(_)) => {
                        return Err(RoutingError::noroute("routing target was not found").into())
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            Err(err) => return Err(err.into()),
        };
        target.tree_identifier = target.id_token();
        Ok(Self {
            source,
            target,
            dialed_number: dialed_number.to_string(),
            source_params,
        })
    }

    /// Walks the extension graph below the target, loading children and
    /// cutting cycles. Trunk targets have nothing to discover.
    pub async fn discover(
        &mut self,
        storage: &dyn RoutingStorage,
        max_depth: usize,
    ) -> Result<DiscoveryReport, StorageError> {
        if self.target.kind == ExtensionType::Trunk {
            return Ok(DiscoveryReport::default());
        }
        let mut visitor =
            DiscoveryVisitor::new(storage, vec![self.source.extension.clone()], max_depth);
        let excluded = visitor.excluded.clone();
        visitor.visit(&mut self.target, 0, excluded).await?;
        Ok(visitor.report())
    }

    /// Turns the discovered tree into the final routing decision plus the
    /// cache plan of all sub-forks.
    pub fn calculate_routing(&mut self, ctx: &RoutingContext<'_>) -> Result<RoutingOutcome, RoutingError> {
        let mut generator = RouteGenerator::new(ctx.local_yate_id, ctx.yates);
        let result = if self.target.kind == ExtensionType::Trunk {
            generator.generate_trunk_routing(&self.target, &self.dialed_number)?
        } else {
            generator.calculate(&mut self.target)?
        };
        if !result.is_valid() {
            return Err(RoutingError::noroute(
                "the main routing target returned no route",
            ));
        }

        let run_id = generator.run_id().to_string();
        let (mut cache_entries, node_results) = generator.into_parts();
        let mut result = self.provide_ringback(result, &run_id, ctx);
        self.populate_parameters(&mut result, &mut cache_entries);

        Ok(RoutingOutcome {
            result,
            cache_entries,
            node_results,
        })
    }

    /// If the target has a ringback recording on disk, ring it as an extra
    /// persistent leg in front of everything else.
    fn provide_ringback(
        &self,
        result: RoutingResult,
        run_id: &str,
        ctx: &RoutingContext<'_>,
    ) -> RoutingResult {
        let Some(ringback) = self.target.ringback.as_deref() else {
            return result;
        };
        let path = ctx.ringback_top_directory.join(format!("{ringback}.slin"));
        if !(ctx.ringback_probe)(&path) {
            return result;
        }
        let mut parameters = BTreeMap::from([
            ("fork.calltype".to_string(), "persistent".to_string()),
            ("fork.autoring".to_string(), "true".to_string()),
            ("fork.automessage".to_string(), "call.progress".to_string()),
        ]);
        parameters.insert("x_eventphone_id".to_string(), run_id.to_string());
        parameters.insert("osip_X-Eventphone-Id".to_string(), run_id.to_string());
        let ringback_target =
            CallTarget::with_parameters(format!("wave/play/{}", path.display()), parameters);

        match result {
            RoutingResult::Simple { target } => {
                // a single leg turns into a two-leg fork
                let envelope = CallTarget::with_parameters("fork", target.parameters.clone());
                RoutingResult::fork(envelope, vec![ringback_target, target])
            }
            RoutingResult::Fork {
                target,
                mut fork_targets,
            } => {
                fork_targets.insert(0, ringback_target);
                RoutingResult::Fork {
                    target,
                    fork_targets,
                }
            }
            RoutingResult::NoRoute => RoutingResult::NoRoute,
        }
    }

    /// Merges the caller-derived parameters plus the callee name into the
    /// reply envelope and into every cached sub-plan, so that deferred legs
    /// present the same identities when the switch re-enters them.
    fn populate_parameters(
        &self,
        result: &mut RoutingResult,
        cache_entries: &mut BTreeMap<String, RoutingResult>,
    ) {
        let mut parameters = self.source_params.clone();
        if let Some(name) = &self.target.name {
            parameters.insert("calledname".to_string(), name.clone());
        }
        if self.target.kind == ExtensionType::Group {
            if let Some(short_name) = &self.target.short_name {
                let callername = self
                    .source_params
                    .get("callername")
                    .cloned()
                    .or_else(|| self.source.name.clone())
                    .unwrap_or_default();
                parameters.insert(
                    "callername".to_string(),
                    format!("[{short_name}] {callername}"),
                );
            }
        }
        if self.target.forwarding_mode != ForwardingMode::Disabled {
            parameters.insert("x_originally_called".to_string(), self.dialed_number.clone());
            parameters.insert(
                "osip_X-Originally-Called".to_string(),
                self.dialed_number.clone(),
            );
        }

        if let Some(target) = result.target_mut() {
            target
                .parameters
                .extend(parameters.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        for entry in cache_entries.values_mut() {
            if let Some(target) = entry.target_mut() {
                target
                    .parameters
                    .extend(parameters.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
    }
}

/// Depth-first discovery with cycle pruning.
///
/// A forward that closes a cycle is disabled; a member that closes a cycle
/// is deactivated. Both mutations live only in this request's tree.
struct DiscoveryVisitor<'a> {
    storage: &'a dyn RoutingStorage,
    excluded: Vec<String>,
    max_depth: usize,
    failed: bool,
    pruned: bool,
}

impl<'a> DiscoveryVisitor<'a> {
    fn new(storage: &'a dyn RoutingStorage, excluded: Vec<String>, max_depth: usize) -> Self {
        Self {
            storage,
            excluded,
            max_depth,
            failed: false,
            pruned: false,
        }
    }

    fn report(&self) -> DiscoveryReport {
        DiscoveryReport {
            failed: self.failed,
            pruned: self.pruned,
        }
    }

    fn visit<'b>(
        &'b mut self,
        node: &'b mut Extension,
        depth: usize,
        path: Vec<String>,
    ) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + 'b>> {
        Box::pin(async move {
            if depth >= self.max_depth {
                tracing::error!(
                    node = %node.tree_identifier,
                    extension = %node.extension,
                    "routing discovery aborted, depth limit reached"
                );
                self.failed = true;
                return Ok(());
            }

            let mut local_path = path;
            local_path.push(node.extension.clone());

            if node.kind != ExtensionType::External
                && node.forwarding_mode != ForwardingMode::Disabled
            {
                let forward = self.storage.load_forwarding_extension(node).await?;
                node.adopt_forwarding(forward);
            }
            if matches!(node.kind, ExtensionType::Group | ExtensionType::Multiring)
                && !node.immediate_forward()
            {
                // group members only matter when there is no immediate forward
                let ranks = self.storage.load_fork_ranks(node).await?;
                node.adopt_fork_ranks(ranks);
            }

            if let Some(forward_number) = node
                .forwarding_extension
                .as_deref()
                .map(|forward| forward.extension.clone())
            {
                if !local_path.contains(&forward_number) {
                    if let Some(forward) = node.forwarding_extension.as_deref_mut() {
                        self.visit(forward, depth + 1, local_path.clone()).await?;
                    }
                } else {
                    self.pruned = true;
                    tracing::warn!(
                        node = %node.tree_identifier,
                        forward = %forward_number,
                        "forward closes a cycle, disabling it for this routing"
                    );
                    node.forwarding_mode = ForwardingMode::Disabled;
                }
            }

            for rank_index in 0..node.fork_ranks.len() {
                for member_index in 0..node.fork_ranks[rank_index].members.len() {
                    let (active, member_number) = {
                        let member = &node.fork_ranks[rank_index].members[member_index];
                        (member.active, member.extension.extension.clone())
                    };
                    if !active {
                        continue;
                    }
                    if !local_path.contains(&member_number) {
                        self.visit(
                            &mut node.fork_ranks[rank_index].members[member_index].extension,
                            depth + 1,
                            local_path.clone(),
                        )
                        .await?;
                    } else {
                        self.pruned = true;
                        tracing::warn!(
                            rank = %node.fork_ranks[rank_index].tree_identifier,
                            member = %member_number,
                            "member closes a cycle, deactivating it for this routing"
                        );
                        node.fork_ranks[rank_index].members[member_index].active = false;
                    }
                }
            }
            Ok(())
        })
    }
}
