//! Fork-tree generation over a discovered routing tree.

use std::collections::{BTreeMap, HashMap};

use crate::error::RoutingError;
use crate::objects::{Extension, ExtensionType, ForwardingMode, RankMode, Yate};
use crate::routing::{CallTarget, RoutingResult};

/// Walks a discovered tree and emits the dialplan: simple targets where a
/// single leg suffices, fork plans everywhere else. Sub-forks are addressed
/// by synthesized deferred-route names and collected for the routing cache.
pub struct RouteGenerator<'a> {
    local_yate_id: i32,
    yates: &'a HashMap<i32, Yate>,
    run_id: String,
    cache_plan: BTreeMap<String, RoutingResult>,
    node_results: BTreeMap<String, RoutingResult>,
}

impl<'a> RouteGenerator<'a> {
    pub fn new(local_yate_id: i32, yates: &'a HashMap<i32, Yate>) -> Self {
        Self {
            local_yate_id,
            yates,
            run_id: uuid::Uuid::new_v4().simple().to_string(),
            cache_plan: BTreeMap::new(),
            node_results: BTreeMap::new(),
        }
    }

    /// The per-request routing id stamped on every emitted leg.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// (cache plan keyed by deferred-route name, per-node results).
    pub fn into_parts(self) -> (BTreeMap<String, RoutingResult>, BTreeMap<String, RoutingResult>) {
        (self.cache_plan, self.node_results)
    }

    pub fn calculate(&mut self, root: &mut Extension) -> Result<RoutingResult, RoutingError> {
        self.visit(root, &[])
    }

    /// A trunk target has no discovered tree; the original dialed string is
    /// emitted in place of the trunk's own number.
    pub fn generate_trunk_routing(
        &mut self,
        trunk: &Extension,
        dialed_number: &str,
    ) -> Result<RoutingResult, RoutingError> {
        let Some(yate_id) = trunk.yate_id else {
            return Err(RoutingError::failure(format!(
                "trunk extension {} is misconfigured: yate_id is null",
                trunk.extension
            )));
        };
        let target = self.host_routing_target(yate_id, dialed_number, &trunk.extension)?;
        Ok(RoutingResult::simple(target))
    }

    fn visit(&mut self, node: &mut Extension, path: &[String]) -> Result<RoutingResult, RoutingError> {
        let tree_identifier = node.tree_identifier.clone();
        let result = self.visit_for_route(node, path)?;
        self.node_results.insert(tree_identifier, result.clone());
        Ok(result)
    }

    fn visit_for_route(
        &mut self,
        node: &mut Extension,
        path: &[String],
    ) -> Result<RoutingResult, RoutingError> {
        let mut local_path = path.to_vec();
        local_path.push(node.id_token());

        // an immediate forward replaces this node entirely
        if node.immediate_forward() {
            return match node.forwarding_extension.as_deref_mut() {
                Some(forward) => self.visit(forward, &local_path),
                None => Err(RoutingError::failure(format!(
                    "extension {} has an immediate forward but no loaded target",
                    node.extension
                ))),
            };
        }

        if node_has_simple_routing(node) {
            let target = self.simple_routing_target(node)?;
            return Ok(RoutingResult::simple(target));
        }

        // this node needs a fork: walk the ranks in index order
        let mut fork_targets: Vec<CallTarget> = Vec::new();
        let mut accumulated_delay = 0;
        for rank_index in 0..node.fork_ranks.len() {
            if !fork_targets.is_empty() {
                let (mode, delay) = {
                    let rank = &node.fork_ranks[rank_index];
                    (rank.mode, rank.delay.unwrap_or(0))
                };
                let separator = match mode {
                    RankMode::Drop => {
                        accumulated_delay += delay;
                        format!("|drop={delay}")
                    }
                    RankMode::Next => {
                        accumulated_delay += delay;
                        format!("|next={delay}")
                    }
                    RankMode::Default => {
                        // an untimed separator makes a time-based forward unreachable
                        if node.forwarding_mode == ForwardingMode::Enabled {
                            tracing::warn!(
                                node = %node.tree_identifier,
                                "untimed fork rank is incompatible with a time-based forward, \
                                 disabling the forward"
                            );
                            node.forwarding_mode = ForwardingMode::Disabled;
                        }
                        "|".to_string()
                    }
                };
                if node.forwarding_mode == ForwardingMode::Enabled
                    && accumulated_delay >= node.forwarding_delay.unwrap_or(0)
                {
                    tracing::warn!(
                        rank = %node.fork_ranks[rank_index].tree_identifier,
                        "fork rank and followers are ignored, the time-based forward fires first"
                    );
                    break;
                }
                fork_targets.push(CallTarget::new(separator));
            }

            for member_index in 0..node.fork_ranks[rank_index].members.len() {
                let (active, member_kind) = {
                    let member = &node.fork_ranks[rank_index].members[member_index];
                    (member.active, member.kind)
                };
                if !active {
                    continue;
                }
                let mut member_route = self.visit(
                    &mut node.fork_ranks[rank_index].members[member_index].extension,
                    &local_path,
                )?;
                if !member_route.is_valid() {
                    tracing::warn!(
                        rank = %node.fork_ranks[rank_index].tree_identifier,
                        member = %node.fork_ranks[rank_index].members[member_index].extension.extension,
                        "member has no valid routing and is ignored"
                    );
                    continue;
                }
                if member_kind.is_special_calltype() {
                    if let Some(target) = member_route.target_mut() {
                        target
                            .parameters
                            .insert("fork.calltype".to_string(), member_kind.fork_calltype().to_string());
                    }
                }
                if let Some(target) = member_route.target() {
                    fork_targets.push(target.clone());
                }
                self.cache_intermediate(&member_route);
            }

            if fork_targets.last().map(|t| t.target == "|").unwrap_or(false) {
                // an empty default rank would make the call hang
                fork_targets.pop();
                tracing::warn!(
                    rank = %node.fork_ranks[rank_index].tree_identifier,
                    "removing empty default rank"
                );
            }
        }

        // a multiring (or a forwarding simple extension) rings itself in the
        // first group, honoring a timed mode on the first rank
        if matches!(node.kind, ExtensionType::Multiring | ExtensionType::Simple) {
            if let Some(first_rank) = node.fork_ranks.first() {
                match first_rank.mode {
                    RankMode::Next => fork_targets.insert(
                        0,
                        CallTarget::new(format!("|next={}", first_rank.delay.unwrap_or(0))),
                    ),
                    RankMode::Drop => fork_targets.insert(
                        0,
                        CallTarget::new(format!("|drop={}", first_rank.delay.unwrap_or(0))),
                    ),
                    RankMode::Default => {}
                }
            }
            let own_target = self.simple_routing_target(node)?;
            fork_targets.insert(0, own_target);
        }

        if node.forwarding_mode == ForwardingMode::OnBusy {
            // no call waiting on any leg that precedes the on-busy forward
            for target in fork_targets.iter_mut().filter(|t| !t.is_separator()) {
                target
                    .parameters
                    .insert("osip_X-No-Call-Wait".to_string(), "1".to_string());
            }
        }

        if matches!(
            node.forwarding_mode,
            ForwardingMode::Enabled | ForwardingMode::OnBusy | ForwardingMode::OnUnavailable
        ) {
            let forward_mode = node.forwarding_mode;
            let forward_delay = node.forwarding_delay.unwrap_or(0);
            let forward_route = match node.forwarding_extension.as_deref_mut() {
                Some(forward) => self.visit(forward, &local_path)?,
                None => {
                    return Err(RoutingError::failure(format!(
                        "extension {} has forwarding enabled but no loaded target",
                        node.extension
                    )))
                }
            };
            if forward_route.is_valid() {
                if forward_mode == ForwardingMode::Enabled {
                    fork_targets.push(CallTarget::new(format!(
                        "|drop={}",
                        forward_delay - accumulated_delay
                    )));
                } else {
                    fork_targets.push(CallTarget::new("|"));
                }
                if let Some(target) = forward_route.target() {
                    fork_targets.push(target.clone());
                }
                self.cache_intermediate(&forward_route);
            } else {
                tracing::warn!(
                    node = %node.tree_identifier,
                    "forwarding target has no valid routing and is ignored"
                );
            }
        }

        let envelope = self.make_call_target(self.deferred_route_name(&local_path), BTreeMap::new());
        Ok(RoutingResult::fork(envelope, fork_targets))
    }

    /// Stamps the routing-run defaults every dialable target carries.
    fn make_call_target(
        &self,
        target: String,
        mut parameters: BTreeMap<String, String>,
    ) -> CallTarget {
        parameters.insert("x_eventphone_id".to_string(), self.run_id.clone());
        parameters.insert("osip_X-Eventphone-Id".to_string(), self.run_id.clone());
        CallTarget::with_parameters(target, parameters)
    }

    fn cache_intermediate(&mut self, result: &RoutingResult) {
        if result.is_simple() {
            return;
        }
        if let Some(target) = result.target() {
            self.cache_plan.insert(target.target.clone(), result.clone());
        }
    }

    fn simple_routing_target(&self, node: &Extension) -> Result<CallTarget, RoutingError> {
        if node.kind == ExtensionType::External {
            // off-net targets are dialed out by the second routing stage
            return Ok(self.make_call_target(
                format!("lateroute/{}", node.extension),
                BTreeMap::from([("eventphone_stage2".to_string(), "1".to_string())]),
            ));
        }
        let Some(yate_id) = node.yate_id else {
            return Err(RoutingError::failure(format!(
                "extension {} is misconfigured: yate_id is null",
                node.extension
            )));
        };
        self.host_routing_target(yate_id, &node.extension, &node.extension)
    }

    fn host_routing_target(
        &self,
        yate_id: i32,
        dial_number: &str,
        extension: &str,
    ) -> Result<CallTarget, RoutingError> {
        if yate_id == self.local_yate_id {
            Ok(self.make_call_target(
                format!("lateroute/{dial_number}"),
                BTreeMap::from([("eventphone_stage2".to_string(), "1".to_string())]),
            ))
        } else {
            let yate = self.yates.get(&yate_id).ok_or_else(|| {
                RoutingError::failure(format!(
                    "extension {extension} references unknown switch host {yate_id}"
                ))
            })?;
            Ok(self.make_call_target(
                format!("sip/sip:{dial_number}@{}", yate.hostname),
                BTreeMap::from([("oconnection_id".to_string(), yate.voip_listener.clone())]),
            ))
        }
    }

    fn deferred_route_name(&self, path: &[String]) -> String {
        format!("lateroute/stage1-{}-{}", self.run_id, path.join("-"))
    }
}

/// Whether a node routes to one leg without a fork.
fn node_has_simple_routing(node: &Extension) -> bool {
    match node.kind {
        ExtensionType::External => true,
        _ if node.immediate_forward() => node
            .forwarding_extension
            .as_deref()
            .map(node_has_simple_routing)
            .unwrap_or(false),
        ExtensionType::Simple => node.forwarding_mode == ForwardingMode::Disabled,
        // a multiring without active members rings like a simple extension
        ExtensionType::Multiring => {
            !node.has_active_group_members() && node.forwarding_mode == ForwardingMode::Disabled
        }
        // groups with a single member could collapse too, but that would
        // take an optimizer pass reshaping the tree
        ExtensionType::Group | ExtensionType::Trunk => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::objects::{ForkRank, RankMember, RankMemberType};

    fn yates() -> HashMap<i32, Yate> {
        HashMap::from([
            (
                1,
                Yate {
                    id: 1,
                    hostname: "dect".into(),
                    guru3_identifier: "DECT".into(),
                    voip_listener: "local".into(),
                },
            ),
            (
                2,
                Yate {
                    id: 2,
                    hostname: "sip".into(),
                    guru3_identifier: "SIP".into(),
                    voip_listener: "local".into(),
                },
            ),
        ])
    }

    fn simple(id: i32, number: &str, yate_id: i32) -> Extension {
        let mut ext = Extension::create_unknown(number);
        ext.id = Some(id);
        ext.yate_id = Some(yate_id);
        ext.tree_identifier = id.to_string();
        ext
    }

    fn rank(id: i32, extension_id: i32, mode: RankMode, delay: Option<i32>, members: Vec<Extension>) -> ForkRank {
        ForkRank {
            id,
            extension_id,
            index: 0,
            mode,
            delay,
            tree_identifier: String::new(),
            members: members
                .into_iter()
                .map(|extension| RankMember {
                    kind: RankMemberType::Default,
                    active: true,
                    extension,
                })
                .collect(),
        }
    }

    #[test]
    fn local_and_remote_targets_differ() {
        let yates = yates();
        let generator = RouteGenerator::new(2, &yates);

        let local = generator.simple_routing_target(&simple(1, "2005", 2)).unwrap();
        assert_eq!(local.target, "lateroute/2005");
        assert_eq!(local.parameters.get("eventphone_stage2").unwrap(), "1");

        let remote = generator.simple_routing_target(&simple(2, "2004", 1)).unwrap();
        assert_eq!(remote.target, "sip/sip:2004@dect");
        assert_eq!(remote.parameters.get("oconnection_id").unwrap(), "local");
    }

    #[test]
    fn every_dialable_target_is_stamped_with_the_run_id() {
        let yates = yates();
        let generator = RouteGenerator::new(2, &yates);
        let target = generator.simple_routing_target(&simple(1, "2004", 1)).unwrap();
        let run_id = generator.run_id();
        assert_eq!(target.parameters.get("x_eventphone_id").unwrap(), run_id);
        assert_eq!(
            target.parameters.get("osip_X-Eventphone-Id").unwrap(),
            run_id
        );
    }

    #[test]
    fn missing_yate_id_is_a_misconfiguration() {
        let yates = yates();
        let generator = RouteGenerator::new(2, &yates);
        let mut ext = simple(1, "2004", 1);
        ext.yate_id = None;
        let err = generator.simple_routing_target(&ext).unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::Failure);
    }

    #[test]
    fn multiring_rings_itself_first() {
        let yates = yates();
        let mut generator = RouteGenerator::new(2, &yates);

        let mut root = simple(10, "2001", 1);
        root.kind = ExtensionType::Multiring;
        let mut ranks = vec![rank(1, 10, RankMode::Default, None, vec![simple(11, "2005", 2)])];
        root.tree_identifier = "10".into();
        ranks[0].tree_identifier = "10-fr1".into();
        root.fork_ranks = ranks;

        let RoutingResult::Fork { target, fork_targets } = generator.calculate(&mut root).unwrap()
        else {
            panic!("expected a fork");
        };
        assert!(target.target.starts_with("lateroute/stage1-"));
        assert_eq!(fork_targets[0].target, "sip/sip:2001@dect");
        assert_eq!(fork_targets[1].target, "lateroute/2005");
    }

    #[test]
    fn timed_first_rank_separates_self_target_from_members() {
        let yates = yates();
        let mut generator = RouteGenerator::new(2, &yates);

        let mut root = simple(10, "2001", 1);
        root.kind = ExtensionType::Multiring;
        root.fork_ranks = vec![rank(
            1,
            10,
            RankMode::Next,
            Some(8),
            vec![simple(11, "2005", 2)],
        )];

        let RoutingResult::Fork { fork_targets, .. } = generator.calculate(&mut root).unwrap()
        else {
            panic!("expected a fork");
        };
        let targets: Vec<&str> = fork_targets.iter().map(|t| t.target.as_str()).collect();
        assert_eq!(
            targets,
            vec!["sip/sip:2001@dect", "|next=8", "lateroute/2005"]
        );
    }

    #[test]
    fn delayed_forward_appends_a_drop_wall() {
        let yates = yates();
        let mut generator = RouteGenerator::new(2, &yates);

        let mut root = simple(10, "2099", 2);
        root.forwarding_mode = ForwardingMode::Enabled;
        root.forwarding_delay = Some(20);
        let mut forward = simple(11, "2042", 2);
        forward.tree_identifier = "10-11".into();
        root.forwarding_extension = Some(Box::new(forward));

        let RoutingResult::Fork { fork_targets, .. } = generator.calculate(&mut root).unwrap()
        else {
            panic!("expected a fork");
        };
        let targets: Vec<&str> = fork_targets.iter().map(|t| t.target.as_str()).collect();
        assert_eq!(targets, vec!["lateroute/2099", "|drop=20", "lateroute/2042"]);
    }

    #[test]
    fn on_busy_forward_disables_call_waiting_on_prior_legs() {
        let yates = yates();
        let mut generator = RouteGenerator::new(2, &yates);

        let mut root = simple(10, "2099", 2);
        root.forwarding_mode = ForwardingMode::OnBusy;
        let mut forward = simple(11, "2042", 2);
        forward.tree_identifier = "10-11".into();
        root.forwarding_extension = Some(Box::new(forward));

        let RoutingResult::Fork { fork_targets, .. } = generator.calculate(&mut root).unwrap()
        else {
            panic!("expected a fork");
        };
        let targets: Vec<&str> = fork_targets.iter().map(|t| t.target.as_str()).collect();
        assert_eq!(targets, vec!["lateroute/2099", "|", "lateroute/2042"]);
        assert_eq!(
            fork_targets[0].parameters.get("osip_X-No-Call-Wait").unwrap(),
            "1"
        );
        // the separator carries nothing
        assert!(fork_targets[1].parameters.is_empty());
        // the forward leg itself still allows call waiting
        assert_eq!(fork_targets[2].parameters.get("osip_X-No-Call-Wait"), None);
    }

    #[test]
    fn immediate_forward_routes_the_forward_target() {
        let yates = yates();
        let mut generator = RouteGenerator::new(2, &yates);

        let mut root = simple(10, "2098", 2);
        root.forwarding_mode = ForwardingMode::Enabled;
        root.forwarding_delay = Some(0);
        let mut forward = simple(11, "2005", 2);
        forward.tree_identifier = "10-11".into();
        root.forwarding_extension = Some(Box::new(forward));

        let result = generator.calculate(&mut root).unwrap();
        let RoutingResult::Simple { target } = result else {
            panic!("expected a simple result");
        };
        assert_eq!(target.target, "lateroute/2005");
    }

    #[test]
    fn sub_forks_are_cached_under_their_deferred_names() {
        let yates = yates();
        let mut generator = RouteGenerator::new(2, &yates);

        // group 2000 containing multiring 2001 (with member 2005)
        let mut group = simple(20, "2000", 2);
        group.kind = ExtensionType::Group;
        group.yate_id = None;
        group.tree_identifier = "20".into();

        let mut multiring = simple(10, "2001", 1);
        multiring.kind = ExtensionType::Multiring;
        multiring.tree_identifier = "20-fr1-10".into();
        multiring.fork_ranks = vec![rank(2, 10, RankMode::Default, None, vec![simple(11, "2005", 2)])];

        group.fork_ranks = vec![rank(1, 20, RankMode::Default, None, vec![multiring])];

        let RoutingResult::Fork { fork_targets, .. } = generator.calculate(&mut group).unwrap()
        else {
            panic!("expected a fork");
        };
        let sub_fork_name = fork_targets[0].target.clone();
        let run_id = generator.run_id().to_string();
        assert_eq!(sub_fork_name, format!("lateroute/stage1-{run_id}-20-10"));

        let (cache_plan, _) = generator.into_parts();
        let cached = cache_plan.get(&sub_fork_name).expect("sub-fork is cached");
        let RoutingResult::Fork { fork_targets, .. } = cached else {
            panic!("cached sub-plan is a fork");
        };
        assert_eq!(fork_targets[0].target, "sip/sip:2001@dect");
        assert_eq!(fork_targets[1].target, "lateroute/2005");
    }

    #[test]
    fn no_two_consecutive_separators_and_no_trailing_bare_pipe() {
        let yates = yates();
        let mut generator = RouteGenerator::new(2, &yates);

        // group with one populated rank and one rank whose member is inactive,
        // leaving an empty default rank to clean up
        let mut group = simple(20, "2000", 2);
        group.kind = ExtensionType::Group;
        group.yate_id = None;
        let mut empty_rank = rank(2, 20, RankMode::Default, None, vec![simple(12, "2004", 1)]);
        empty_rank.members[0].active = false;
        group.fork_ranks = vec![
            rank(1, 20, RankMode::Default, None, vec![simple(11, "2005", 2)]),
            empty_rank,
        ];

        let RoutingResult::Fork { fork_targets, .. } = generator.calculate(&mut group).unwrap()
        else {
            panic!("expected a fork");
        };
        assert!(!fork_targets.last().unwrap().is_separator());
        for pair in fork_targets.windows(2) {
            assert!(!(pair[0].is_separator() && pair[1].is_separator()));
        }
    }
}
