//! Tag Router (§4.D): a parse layer (stream filter + tag parser) and a
//! side-effect layer that turns parsed deliveries into inbox enqueues,
//! broadcasts, file writes, and scheduler hints.

use conclave_llm::ChatMessage;

use crate::guard::{GuardDecision, GuardRail};
use crate::noise::NoiseFilter;
use crate::tag::{TagConfig, TagKind, parse_tags};

/// One addressed delivery produced by the parse layer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub kind: TagKind,
    pub target: Option<String>,
    pub content: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RouteResult {
    pub deliveries: Vec<Delivery>,
    pub yield_for_user: bool,
    pub yield_for_group: bool,
    pub saw_tags: bool,
}

/// Parse layer: run the stream filter then the tag parser over `text`,
/// addressed against the live `agent_ids` allowlist.
pub fn route_with_tags(text: &str, agent_ids: &[String]) -> RouteResult {
    let mut filter = NoiseFilter::new();
    let mut cleaned = filter.feed(text);
    cleaned.push_str(&filter.flush());

    let config = TagConfig::with_agent_tokens(agent_ids.iter().cloned());
    let parsed = parse_tags(&cleaned, &config);

    let saw_tags = parsed
        .iter()
        .any(|p| !matches!(p.kind, TagKind::Group) || !p.tag.is_empty());
    let yield_for_user = parsed.iter().any(|p| p.kind == TagKind::User);
    let yield_for_group = parsed.iter().any(|p| p.kind == TagKind::Group);

    let deliveries = if parsed.is_empty() {
        vec![Delivery {
            kind: TagKind::Group,
            target: None,
            content: String::new(),
            name: None,
        }]
    } else {
        parsed
            .into_iter()
            .map(|p| Delivery {
                target: (p.kind == TagKind::Agent).then(|| p.tag.clone()),
                name: (p.kind == TagKind::File).then(|| p.tag.clone()),
                content: p.content,
                kind: p.kind,
            })
            .collect()
    };

    RouteResult {
        deliveries,
        yield_for_user,
        yield_for_group,
        saw_tags,
    }
}

/// A side effect produced by routing a sender's deliveries. Collected
/// rather than applied directly, so callers (scheduler, tests) can inspect
/// or replay them deterministically.
#[derive(Debug, Clone)]
pub enum Effect {
    Enqueue { target: String, message: ChatMessage },
    WriteFile { from: String, path: String, content: String },
    SetRespondingHint(Option<String>),
    SetLastUserDmTarget(String),
    ApplyGuardDecision { agent: String, decision: GuardDecision },
}

/// Side-effect layer outcome.
pub struct RoutedEffects {
    pub effects: Vec<Effect>,
    pub yield_for_user: bool,
}

/// Apply the side-effect layer for one sender's parsed deliveries.
///
/// `agents` is the live allowlist (case-sensitive canonical ids); `sender`
/// must be one of them. `guard` is the sender's own guard instance,
/// consulted for `group` deliveries.
pub fn apply_side_effects(
    deliveries: &[Delivery],
    sender: &str,
    agents: &[String],
    guard: &mut GuardRail,
) -> RoutedEffects {
    let mut effects = Vec::new();
    let mut yield_for_user = false;

    for delivery in deliveries {
        match delivery.kind {
            TagKind::Agent => {
                let target = delivery.target.as_deref().unwrap_or_default();
                match agents.iter().find(|id| id.eq_ignore_ascii_case(target)) {
                    Some(resolved) => {
                        effects.push(Effect::Enqueue {
                            target: resolved.clone(),
                            message: ChatMessage::user_from(Some(sender), delivery.content.clone()),
                        });
                        effects.push(Effect::SetRespondingHint(Some(resolved.clone())));
                    }
                    None => broadcast(&mut effects, sender, agents, &delivery.content),
                }
            }
            TagKind::Group => {
                let decision = guard.guard_check("group", &delivery.content);
                if decision.suppress_broadcast {
                    effects.push(Effect::ApplyGuardDecision {
                        agent: sender.to_string(),
                        decision,
                    });
                } else {
                    broadcast(&mut effects, sender, agents, &delivery.content);
                }
            }
            TagKind::User => {
                yield_for_user = true;
                effects.push(Effect::SetLastUserDmTarget(sender.to_string()));
            }
            TagKind::File => {
                effects.push(Effect::WriteFile {
                    from: sender.to_string(),
                    path: delivery.name.clone().unwrap_or_default(),
                    content: delivery.content.clone(),
                });
            }
        }
    }

    RoutedEffects {
        effects,
        yield_for_user,
    }
}

fn broadcast(effects: &mut Vec<Effect>, sender: &str, agents: &[String], content: &str) {
    for agent in agents {
        if agent == sender {
            continue;
        }
        effects.push(Effect::Enqueue {
            target: agent.clone(),
            message: ChatMessage::user_from(Some(sender), content.to_string()),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GuardConfig;

    fn agents() -> Vec<String> {
        vec!["alice".into(), "bob".into(), "carol".into()]
    }

    #[test]
    fn invariant_6_yield_for_user_iff_user_tag() {
        let r = route_with_tags("@@user please confirm", &agents());
        assert!(r.yield_for_user);
        let r = route_with_tags("@@bob hi", &agents());
        assert!(!r.yield_for_user);
    }

    #[test]
    fn s1_dm_enqueues_only_target() {
        let route = route_with_tags("@@bob hi", &agents());
        let mut guard = GuardRail::new(GuardConfig::from_max_tool_hops(12));
        let outcome = apply_side_effects(&route.deliveries, "alice", &agents(), &mut guard);
        let enqueued: Vec<_> = outcome
            .effects
            .iter()
            .filter_map(|e| match e {
                Effect::Enqueue { target, message } => Some((target.clone(), message.content.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(enqueued, vec![("bob".to_string(), "hi".to_string())]);
    }

    #[test]
    fn s2_group_broadcasts_to_all_but_sender() {
        let route = route_with_tags("@@group. hi all", &agents());
        let mut guard = GuardRail::new(GuardConfig::from_max_tool_hops(12));
        let outcome = apply_side_effects(&route.deliveries, "alice", &agents(), &mut guard);
        let targets: Vec<_> = outcome
            .effects
            .iter()
            .filter_map(|e| match e {
                Effect::Enqueue { target, .. } => Some(target.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(targets, vec!["bob".to_string(), "carol".to_string()]);
    }

    #[test]
    fn s3_user_noop_yields_and_enqueues_nothing() {
        let route = route_with_tags("@@user please confirm", &["alice".to_string()]);
        let mut guard = GuardRail::new(GuardConfig::from_max_tool_hops(12));
        let outcome = apply_side_effects(&route.deliveries, "alice", &["alice".to_string()], &mut guard);
        assert!(outcome.yield_for_user);
        assert!(!outcome.effects.iter().any(|e| matches!(e, Effect::Enqueue { .. })));
    }

    #[test]
    fn unresolved_agent_tag_falls_back_to_broadcast() {
        let route = route_with_tags("@@dave hi", &agents());
        let mut guard = GuardRail::new(GuardConfig::from_max_tool_hops(12));
        let outcome = apply_side_effects(&route.deliveries, "alice", &agents(), &mut guard);
        let targets: Vec<_> = outcome
            .effects
            .iter()
            .filter_map(|e| match e {
                Effect::Enqueue { target, .. } => Some(target.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(targets, vec!["bob".to_string(), "carol".to_string()]);
    }
}
