//! Routing results and their encoding onto the message bus.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use yate_link::Message;

mod generate;
mod tree;

pub use generate::RouteGenerator;
pub use tree::{
    DiscoveryReport, RoutingContext, RoutingOutcome, RoutingTree, MAX_ROUTING_TREE_DEPTH,
};

/// What to dial: a target in the switch's leg-URI syntax plus the parameters
/// the switch attaches to that leg. Targets starting with `|` are fork
/// separators, not dialable legs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallTarget {
    pub target: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

impl CallTarget {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_parameters(
        target: impl Into<String>,
        parameters: BTreeMap<String, String>,
    ) -> Self {
        Self {
            target: target.into(),
            parameters,
        }
    }

    pub fn is_separator(&self) -> bool {
        self.target.starts_with('|')
    }
}

/// Outcome of routing one node: a single leg, a fork of legs wrapped in a
/// deferred-route envelope, or nothing at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoutingResult {
    Simple {
        target: CallTarget,
    },
    Fork {
        target: CallTarget,
        fork_targets: Vec<CallTarget>,
    },
    NoRoute,
}

impl RoutingResult {
    pub fn simple(target: CallTarget) -> Self {
        RoutingResult::Simple { target }
    }

    /// An empty fork routes nowhere.
    pub fn fork(target: CallTarget, fork_targets: Vec<CallTarget>) -> Self {
        if fork_targets.is_empty() {
            RoutingResult::NoRoute
        } else {
            RoutingResult::Fork {
                target,
                fork_targets,
            }
        }
    }

    pub fn is_simple(&self) -> bool {
        matches!(self, RoutingResult::Simple { .. })
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self, RoutingResult::NoRoute)
    }

    /// The envelope target: the leg itself for a simple result, the
    /// deferred-route wrapper for a fork.
    pub fn target(&self) -> Option<&CallTarget> {
        match self {
            RoutingResult::Simple { target } | RoutingResult::Fork { target, .. } => Some(target),
            RoutingResult::NoRoute => None,
        }
    }

    pub fn target_mut(&mut self) -> Option<&mut CallTarget> {
        match self {
            RoutingResult::Simple { target } | RoutingResult::Fork { target, .. } => Some(target),
            RoutingResult::NoRoute => None,
        }
    }
}

/// Writes a routing result into a call.route reply: envelope parameters are
/// merged into the message, fork legs become `callto.<i>` with per-leg
/// overrides for parameters that differ from the envelope.
pub fn encode_routing_result(message: &mut Message, result: &RoutingResult) {
    match result {
        RoutingResult::Simple { target } => {
            message
                .params
                .extend(target.parameters.iter().map(|(k, v)| (k.clone(), v.clone())));
            message.return_value = target.target.clone();
        }
        RoutingResult::Fork {
            target,
            fork_targets,
        } => {
            message
                .params
                .extend(target.parameters.iter().map(|(k, v)| (k.clone(), v.clone())));
            message.return_value = "fork".to_string();
            for (i, leg) in fork_targets.iter().enumerate() {
                let index = i + 1;
                message
                    .params
                    .insert(format!("callto.{index}"), leg.target.clone());
                for (key, value) in &leg.parameters {
                    if target.parameters.get(key) != Some(value) {
                        message
                            .params
                            .insert(format!("callto.{index}.{key}"), value.clone());
                    }
                }
            }
        }
        RoutingResult::NoRoute => {
            message.return_value.clear();
        }
    }
}
