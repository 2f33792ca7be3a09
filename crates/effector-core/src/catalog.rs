//! The impact matrix: actions, effect types, and the mappings between them.
//!
//! Definitions are configuration, not history. Once an action or effect type
//! exists its identifying fields never change; retiring one only flips
//! `is_active`. Resolution is a pure function over a snapshot of the three
//! tables so every backend produces the same fan-out order.

use serde::{Deserialize, Serialize};

// ─── Definitions ─────────────────────────────────────────────────────────────

/// A named business occurrence that may trigger downstream effects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionDefinition {
  /// Unique key, e.g. `"employee.updated"`.
  pub action_name: String,
  pub module:      String,
  pub entity_type: String,
  #[serde(default = "default_active")]
  pub is_active:   bool,
  #[serde(default)]
  pub description: Option<String>,
}

/// A kind of side effect the host application knows how to execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectTypeDefinition {
  /// Unique key, e.g. `"notify_manager"`.
  pub effect_type: String,
  /// Free-form grouping such as `"notification"` or `"integration"`.
  pub category:    String,
  #[serde(default = "default_active")]
  pub is_active:   bool,
  #[serde(default)]
  pub description: Option<String>,
}

/// One cell of the impact matrix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpactMapping {
  pub action_name: String,
  pub effect_type: String,
  /// Lower runs first.
  pub priority:    i32,
  #[serde(default = "default_active")]
  pub is_active:   bool,
}

fn default_active() -> bool { true }

// ─── Resolution ──────────────────────────────────────────────────────────────

/// An effect selected for an action, in execution order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedEffect {
  pub effect_type: String,
  pub category:    String,
  pub priority:    i32,
}

/// Select the effects an occurrence of `action_name` fans out to.
///
/// A mapping is selected only when the mapping, its action and its effect
/// type are all active. The result is ordered by ascending priority; equal
/// priorities fall back to the effect type's lexical order so repeated
/// resolutions are reproducible.
pub fn resolve_effects(
  action_name: &str,
  actions: &[ActionDefinition],
  effect_types: &[EffectTypeDefinition],
  mappings: &[ImpactMapping],
) -> Vec<ResolvedEffect> {
  let action_active = actions
    .iter()
    .any(|a| a.action_name == action_name && a.is_active);
  if !action_active {
    return Vec::new();
  }

  let mut resolved: Vec<ResolvedEffect> = mappings
    .iter()
    .filter(|m| m.action_name == action_name && m.is_active)
    .filter_map(|m| {
      effect_types
        .iter()
        .find(|e| e.effect_type == m.effect_type && e.is_active)
        .map(|e| ResolvedEffect {
          effect_type: e.effect_type.clone(),
          category:    e.category.clone(),
          priority:    m.priority,
        })
    })
    .collect();

  sort_resolved(&mut resolved);
  resolved
}

/// Canonical fan-out order: `(priority, effect_type)` ascending.
pub fn sort_resolved(effects: &mut [ResolvedEffect]) {
  effects.sort_by(|a, b| {
    a.priority
      .cmp(&b.priority)
      .then_with(|| a.effect_type.cmp(&b.effect_type))
  });
}

#[cfg(test)]
mod tests {
  use super::*;

  fn action(name: &str, active: bool) -> ActionDefinition {
    ActionDefinition {
      action_name: name.into(),
      module:      "hr".into(),
      entity_type: "employee".into(),
      is_active:   active,
      description: None,
    }
  }

  fn effect(name: &str, active: bool) -> EffectTypeDefinition {
    EffectTypeDefinition {
      effect_type: name.into(),
      category:    "notification".into(),
      is_active:   active,
      description: None,
    }
  }

  fn mapping(action: &str, effect: &str, priority: i32) -> ImpactMapping {
    ImpactMapping {
      action_name: action.into(),
      effect_type: effect.into(),
      priority,
      is_active: true,
    }
  }

  fn names(resolved: &[ResolvedEffect]) -> Vec<&str> {
    resolved.iter().map(|r| r.effect_type.as_str()).collect()
  }

  #[test]
  fn orders_by_priority() {
    let actions = [action("employee.updated", true)];
    let effects = [effect("a", true), effect("b", true), effect("c", true)];
    let mappings = [
      mapping("employee.updated", "c", 3),
      mapping("employee.updated", "a", 1),
      mapping("employee.updated", "b", 2),
    ];

    let resolved = resolve_effects("employee.updated", &actions, &effects, &mappings);
    assert_eq!(names(&resolved), ["a", "b", "c"]);
    assert_eq!(
      resolved.iter().map(|r| r.priority).collect::<Vec<_>>(),
      [1, 2, 3]
    );
  }

  #[test]
  fn equal_priority_breaks_ties_lexically() {
    let actions = [action("trip.approved", true)];
    let effects = [effect("zeta", true), effect("alpha", true)];
    let mappings = [
      mapping("trip.approved", "zeta", 1),
      mapping("trip.approved", "alpha", 1),
    ];

    let resolved = resolve_effects("trip.approved", &actions, &effects, &mappings);
    assert_eq!(names(&resolved), ["alpha", "zeta"]);
  }

  #[test]
  fn inactive_action_resolves_nothing() {
    let actions = [action("employee.updated", false)];
    let effects = [effect("a", true)];
    let mappings = [mapping("employee.updated", "a", 1)];

    assert!(resolve_effects("employee.updated", &actions, &effects, &mappings).is_empty());
  }

  #[test]
  fn inactive_effect_type_is_skipped_even_if_mapping_active() {
    let actions = [action("employee.updated", true)];
    let effects = [effect("a", false), effect("b", true)];
    let mappings = [
      mapping("employee.updated", "a", 1),
      mapping("employee.updated", "b", 2),
    ];

    let resolved = resolve_effects("employee.updated", &actions, &effects, &mappings);
    assert_eq!(names(&resolved), ["b"]);
  }

  #[test]
  fn inactive_mapping_is_skipped() {
    let actions = [action("employee.updated", true)];
    let effects = [effect("a", true)];
    let mut m = mapping("employee.updated", "a", 1);
    m.is_active = false;

    assert!(resolve_effects("employee.updated", &actions, &effects, &[m]).is_empty());
  }

  #[test]
  fn unknown_action_resolves_nothing() {
    assert!(resolve_effects("nope", &[], &[], &[]).is_empty());
  }
}
