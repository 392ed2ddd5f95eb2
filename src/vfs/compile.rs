//! Turns the declarative rule list into what the host enforces (wire rules)
//! and what the client runs itself (compiled hooks).
//!
//! All phase/action/callback validation happens here, before the sandbox is
//! created, so a bad rule never reaches the host.

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use super::rules::{
    VfsAction, VfsActionHook, VfsAfterHook, VfsHook, VfsHookRule, VfsInterceptionConfig,
    VfsMutateHook, VfsOp, VfsPhase,
};
use crate::error::{Error, Result};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// A rule enforced entirely by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireVfsRule {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<VfsPhase>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ops: Vec<VfsOp>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    pub action: VfsAction,
}

/// Interception settings shipped in the `create` parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireVfsInterception {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub emit_events: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<WireVfsRule>,
}

/// The single callback of a compiled rule.
#[derive(Clone)]
pub(crate) enum CompiledHook {
    After(Arc<dyn VfsAfterHook>),
    AfterDangerous(Arc<dyn VfsAfterHook>),
    Mutate(Arc<dyn VfsMutateHook>),
    Action(Arc<dyn VfsActionHook>),
}

pub(crate) struct CompiledRule {
    pub name: String,
    pub ops: HashSet<VfsOp>,
    pub pattern: Option<Pattern>,
    pub timeout: Option<Duration>,
    pub hook: CompiledHook,
}

impl CompiledRule {
    pub fn matches(&self, op: VfsOp, path: &str) -> bool {
        if !self.ops.is_empty() && !self.ops.contains(&op) {
            return false;
        }
        match &self.pattern {
            Some(pattern) => pattern.matches_with(path, MATCH_OPTIONS),
            None => true,
        }
    }
}

/// Local hooks in registration order.
#[derive(Default)]
pub(crate) struct CompiledHooks {
    rules: Vec<Arc<CompiledRule>>,
}

impl CompiledHooks {
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn matching(&self, op: VfsOp, path: &str) -> impl Iterator<Item = &Arc<CompiledRule>> {
        self.rules.iter().filter(move |r| r.matches(op, path))
    }

    fn has_after_hooks(&self) -> bool {
        self.rules.iter().any(|r| {
            matches!(
                r.hook,
                CompiledHook::After(_) | CompiledHook::AfterDangerous(_)
            )
        })
    }
}

pub(crate) struct CompiledInterception {
    /// `None` means no interception is configured host-side.
    pub wire: Option<WireVfsInterception>,
    pub hooks: CompiledHooks,
}

/// Validate and split an interception config.
pub(crate) fn compile(config: Option<&VfsInterceptionConfig>) -> Result<CompiledInterception> {
    let Some(config) = config else {
        return Ok(CompiledInterception {
            wire: None,
            hooks: CompiledHooks::default(),
        });
    };

    let mut wire = WireVfsInterception {
        emit_events: config.emit_events,
        rules: Vec::new(),
    };
    let mut hooks = CompiledHooks::default();

    for (index, rule) in config.rules.iter().enumerate() {
        let label = rule_label(rule, index);
        match rule.hooks.as_slice() {
            [] => wire.rules.push(compile_wire_rule(rule, &label)?),
            [hook] => hooks
                .rules
                .push(Arc::new(compile_local_rule(rule, hook, &label)?)),
            many => {
                let kinds: Vec<&str> = many.iter().map(VfsHook::kind).collect();
                return Err(Error::VfsConfig(format!(
                    "{} sets more than one callback ({}); a rule may carry at most one",
                    label,
                    kinds.join(", ")
                )));
            }
        }
    }

    if hooks.has_after_hooks() {
        wire.emit_events = true;
    }

    let wire = if wire.rules.is_empty() && !wire.emit_events {
        None
    } else {
        Some(wire)
    };

    Ok(CompiledInterception { wire, hooks })
}

fn rule_label(rule: &VfsHookRule, index: usize) -> String {
    if rule.name.is_empty() {
        format!("rule #{}", index)
    } else {
        format!("rule {:?}", rule.name)
    }
}

fn compile_wire_rule(rule: &VfsHookRule, label: &str) -> Result<WireVfsRule> {
    let action = match rule.action {
        Some(action @ (VfsAction::Allow | VfsAction::Block)) => action,
        Some(VfsAction::MutateWrite) => {
            return Err(Error::VfsConfig(format!(
                "{} uses action mutate_write without a mutate hook",
                label
            )));
        }
        None => {
            return Err(Error::VfsConfig(format!(
                "{} has neither an action nor a callback",
                label
            )));
        }
    };

    Ok(WireVfsRule {
        name: rule.name.clone(),
        phase: rule.phase,
        ops: rule.ops.clone(),
        path: rule.path.clone(),
        action,
    })
}

fn compile_local_rule(rule: &VfsHookRule, hook: &VfsHook, label: &str) -> Result<CompiledRule> {
    let kind = hook.kind();

    match rule.action {
        None | Some(VfsAction::Allow) => {}
        Some(other) => {
            return Err(Error::VfsConfig(format!(
                "{} with {} cannot use action {}",
                label, kind, other
            )));
        }
    }

    let (phase_ok, required) = match hook {
        VfsHook::After(_) | VfsHook::AfterDangerous(_) => {
            (rule.phase == Some(VfsPhase::After), "after")
        }
        VfsHook::Mutate(_) => (rule.phase == Some(VfsPhase::Before), "before"),
        VfsHook::Action(_) => (rule.phase != Some(VfsPhase::After), "before"),
    };
    if !phase_ok {
        return Err(Error::VfsConfig(format!(
            "{} with {} requires phase {}",
            label, kind, required
        )));
    }

    let pattern = if rule.path.is_empty() {
        None
    } else {
        Some(Pattern::new(&rule.path).map_err(|e| {
            Error::VfsConfig(format!("{} has invalid path pattern {:?}: {}", label, rule.path, e))
        })?)
    };

    let hook = match hook {
        VfsHook::After(h) => CompiledHook::After(Arc::clone(h)),
        VfsHook::AfterDangerous(h) => CompiledHook::AfterDangerous(Arc::clone(h)),
        VfsHook::Mutate(h) => CompiledHook::Mutate(Arc::clone(h)),
        VfsHook::Action(h) => CompiledHook::Action(Arc::clone(h)),
    };

    Ok(CompiledRule {
        name: if rule.name.is_empty() {
            label.to_string()
        } else {
            rule.name.clone()
        },
        ops: rule.ops.iter().copied().collect(),
        pattern,
        timeout: rule.timeout,
        hook,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::vfs::rules::{VfsActionRequest, VfsHookEvent, VfsMutateRequest};

    async fn noop_after(_c: Client, _e: VfsHookEvent) -> anyhow::Result<()> {
        Ok(())
    }

    async fn keep(_r: VfsMutateRequest) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn allow(_r: VfsActionRequest) -> VfsAction {
        VfsAction::Allow
    }

    fn expect_config_error(config: VfsInterceptionConfig) -> String {
        match compile(Some(&config)) {
            Err(Error::VfsConfig(msg)) => msg,
            Err(other) => panic!("expected VfsConfig error, got {:?}", other),
            Ok(_) => panic!("expected VfsConfig error, got Ok"),
        }
    }

    #[test]
    fn no_config_means_no_interception() {
        let compiled = compile(None).unwrap();
        assert!(compiled.wire.is_none());
        assert!(compiled.hooks.is_empty());

        let compiled = compile(Some(&VfsInterceptionConfig::new())).unwrap();
        assert!(compiled.wire.is_none());
    }

    #[test]
    fn rule_with_mutate_and_action_hooks_is_rejected() {
        let config = VfsInterceptionConfig::new().rule(
            VfsHookRule::new("confused")
                .phase(VfsPhase::Before)
                .mutate_hook(keep)
                .action_hook(allow),
        );
        let msg = expect_config_error(config);
        assert!(msg.contains("confused"), "{}", msg);
        assert!(msg.contains("mutate_hook"), "{}", msg);
        assert!(msg.contains("action_hook"), "{}", msg);
    }

    #[test]
    fn wire_rules_are_forwarded_verbatim() {
        let config = VfsInterceptionConfig::new().rule(
            VfsHookRule::new("no-etc")
                .phase(VfsPhase::Before)
                .ops([VfsOp::Write, VfsOp::Remove])
                .path("/etc/*")
                .action(VfsAction::Block),
        );
        let compiled = compile(Some(&config)).unwrap();
        assert!(compiled.hooks.is_empty());

        let wire = compiled.wire.unwrap();
        assert!(!wire.emit_events);
        assert_eq!(
            wire.rules,
            vec![WireVfsRule {
                name: "no-etc".into(),
                phase: Some(VfsPhase::Before),
                ops: vec![VfsOp::Write, VfsOp::Remove],
                path: "/etc/*".into(),
                action: VfsAction::Block,
            }]
        );

        let json = serde_json::to_value(&wire).unwrap();
        assert!(json.get("emit_events").is_none());
        assert_eq!(json["rules"][0]["action"], "block");
    }

    #[test]
    fn mutate_write_without_hook_is_rejected() {
        let config = VfsInterceptionConfig::new().rule(
            VfsHookRule::new("rewrite")
                .phase(VfsPhase::Before)
                .action(VfsAction::MutateWrite),
        );
        assert!(expect_config_error(config).contains("mutate_write"));
    }

    #[test]
    fn rule_without_action_or_callback_is_rejected() {
        let config = VfsInterceptionConfig::new().rule(VfsHookRule::new("empty").path("/tmp/*"));
        assert!(expect_config_error(config).contains("neither"));
    }

    #[test]
    fn after_hooks_require_after_phase() {
        let config = VfsInterceptionConfig::new().rule(
            VfsHookRule::new("audit")
                .phase(VfsPhase::Before)
                .hook(noop_after),
        );
        assert!(expect_config_error(config).contains("requires phase after"));

        let config = VfsInterceptionConfig::new()
            .rule(VfsHookRule::new("audit").dangerous_hook(noop_after));
        assert!(expect_config_error(config).contains("requires phase after"));
    }

    #[test]
    fn mutate_hook_requires_before_phase() {
        let config = VfsInterceptionConfig::new().rule(VfsHookRule::new("m").mutate_hook(keep));
        assert!(expect_config_error(config).contains("requires phase before"));
    }

    #[test]
    fn action_hook_accepts_before_or_empty_phase() {
        for phase in [None, Some(VfsPhase::Before)] {
            let mut rule = VfsHookRule::new("gate").action_hook(allow);
            rule.phase = phase;
            let compiled = compile(Some(&VfsInterceptionConfig::new().rule(rule))).unwrap();
            assert_eq!(compiled.hooks.len(), 1);
            assert!(compiled.wire.is_none());
        }

        let config = VfsInterceptionConfig::new().rule(
            VfsHookRule::new("gate")
                .phase(VfsPhase::After)
                .action_hook(allow),
        );
        assert!(expect_config_error(config).contains("requires phase before"));
    }

    #[test]
    fn callbacks_reject_non_allow_actions() {
        let config = VfsInterceptionConfig::new().rule(
            VfsHookRule::new("audit")
                .phase(VfsPhase::After)
                .action(VfsAction::Block)
                .hook(noop_after),
        );
        assert!(expect_config_error(config).contains("cannot use action block"));

        let config = VfsInterceptionConfig::new().rule(
            VfsHookRule::new("audit")
                .phase(VfsPhase::After)
                .action(VfsAction::Allow)
                .hook(noop_after),
        );
        assert!(compile(Some(&config)).is_ok());
    }

    #[test]
    fn local_after_hook_requests_event_emission() {
        let config = VfsInterceptionConfig::new()
            .rule(
                VfsHookRule::new("audit")
                    .phase(VfsPhase::After)
                    .ops([VfsOp::Write])
                    .hook(noop_after),
            )
            .rule(VfsHookRule::new("ro").path("/ro/*").action(VfsAction::Block));
        let compiled = compile(Some(&config)).unwrap();
        let wire = compiled.wire.unwrap();
        assert!(wire.emit_events);
        assert_eq!(wire.rules.len(), 1);
        assert_eq!(compiled.hooks.len(), 1);
    }

    #[test]
    fn invalid_glob_is_rejected() {
        let config = VfsInterceptionConfig::new().rule(
            VfsHookRule::new("bad")
                .phase(VfsPhase::After)
                .path("/workspace/[")
                .hook(noop_after),
        );
        assert!(expect_config_error(config).contains("invalid path pattern"));
    }

    #[test]
    fn glob_star_does_not_cross_separators() {
        let config = VfsInterceptionConfig::new().rule(
            VfsHookRule::new("ws")
                .phase(VfsPhase::After)
                .ops([VfsOp::Write])
                .path("/workspace/*")
                .hook(noop_after),
        );
        let compiled = compile(Some(&config)).unwrap();
        let rule = &compiled.hooks.rules[0];

        assert!(rule.matches(VfsOp::Write, "/workspace/a.txt"));
        assert!(!rule.matches(VfsOp::Write, "/workspace/sub/a.txt"));
        assert!(!rule.matches(VfsOp::Read, "/workspace/a.txt"));
    }

    #[test]
    fn empty_ops_and_path_match_everything() {
        let config = VfsInterceptionConfig::new()
            .rule(VfsHookRule::new("all").phase(VfsPhase::After).hook(noop_after));
        let compiled = compile(Some(&config)).unwrap();
        let rule = &compiled.hooks.rules[0];
        for op in VfsOp::ALL {
            assert!(rule.matches(op, "/any/where/at/all"));
        }
    }
}
