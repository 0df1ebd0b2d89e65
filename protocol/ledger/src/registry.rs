use crate::types::ActionType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionTypeEntry {
    pub action_type: ActionType,
    pub weight: f64,
    #[serde(default)]
    pub predicate_id: Option<String>,
    #[serde(default)]
    pub description: String,
}

impl ActionTypeEntry {
    pub fn new(
        action_type: &str,
        weight: f64,
        predicate_id: Option<&str>,
        description: &str,
    ) -> Self {
        Self {
            action_type: ActionType::new(action_type),
            weight,
            predicate_id: predicate_id.map(str::to_string),
            description: description.to_string(),
        }
    }
}

/// `{action_type: {weight, predicate_id}}`, loaded from configuration and read
/// by both the proof engine (predicates) and the reputation engine (weights).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<ActionTypeEntry>", into = "Vec<ActionTypeEntry>")]
pub struct ActionTypeRegistry {
    entries: HashMap<ActionType, ActionTypeEntry>,
}

impl ActionTypeRegistry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn register(&mut self, entry: ActionTypeEntry) {
        self.entries.insert(entry.action_type.clone(), entry);
    }

    pub fn get(&self, action_type: &ActionType) -> Option<&ActionTypeEntry> {
        self.entries.get(action_type)
    }

    pub fn weight(&self, action_type: &ActionType) -> Option<f64> {
        self.entries.get(action_type).map(|e| e.weight)
    }

    pub fn predicate_id(&self, action_type: &ActionType) -> Option<&str> {
        self.entries
            .get(action_type)
            .and_then(|e| e.predicate_id.as_deref())
    }

    pub fn contains(&self, action_type: &ActionType) -> bool {
        self.entries.contains_key(action_type)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries sorted by action type code.
    pub fn list(&self) -> Vec<ActionTypeEntry> {
        let mut entries: Vec<ActionTypeEntry> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.action_type.cmp(&b.action_type));
        entries
    }

    /// Built-in catalog for robot fleets. Deployments usually override it from
    /// the node config.
    pub fn default_catalog() -> Self {
        let entries = vec![
            ActionTypeEntry::new("DELIV_DONE", 5.0, Some("non_empty"), "delivery completed"),
            ActionTypeEntry::new("DELIV_FAIL", -5.0, None, "delivery failed"),
            ActionTypeEntry::new("DELIV_START", 0.0, None, "delivery started"),
            ActionTypeEntry::new("PKG_LOAD", 1.0, None, "package loaded"),
            ActionTypeEntry::new("RECIP_VERIFY", 2.0, Some("non_empty"), "recipient verified"),
            ActionTypeEntry::new("TASK_DONE", 5.0, Some("non_empty"), "task completed"),
            ActionTypeEntry::new("TASK_FAIL", -5.0, None, "task failed"),
            ActionTypeEntry::new("NAV_COMPLETE", 2.0, None, "navigation completed"),
            ActionTypeEntry::new("WAYPOINT", 1.0, None, "waypoint reached"),
            ActionTypeEntry::new("OBSTACLE_AVOID", 1.0, None, "obstacle avoided"),
            ActionTypeEntry::new("COLLISION", -20.0, None, "collision detected"),
            ActionTypeEntry::new("GEO_ENTER", 0.0, Some("json_object"), "geofence entered"),
            ActionTypeEntry::new("GEO_EXIT", 0.0, Some("json_object"), "geofence exited"),
            ActionTypeEntry::new("GEO_VIOL", -10.0, Some("json_object"), "geofence violation"),
            ActionTypeEntry::new("AIRSPACE_VIOL", -15.0, None, "airspace violation"),
            ActionTypeEntry::new("TAMPER", -50.0, None, "tamper detected"),
            ActionTypeEntry::new("QC_PASS", 3.0, None, "quality check passed"),
            ActionTypeEntry::new("QC_FAIL", -3.0, None, "quality check failed"),
            ActionTypeEntry::new("HARVEST_DONE", 4.0, None, "harvest completed"),
            ActionTypeEntry::new("PATROL_DONE", 4.0, None, "patrol completed"),
            ActionTypeEntry::new("ZK_VERIFY", 1.0, None, "proof verified"),
            ActionTypeEntry::new("AUTH_FAIL", -2.0, None, "authentication failed"),
            ActionTypeEntry::new("CHARGE_DONE", 0.0, None, "charging completed"),
            ActionTypeEntry::new("HEARTBEAT", 0.0, None, "heartbeat"),
        ];
        Self::from(entries)
    }
}

impl From<Vec<ActionTypeEntry>> for ActionTypeRegistry {
    fn from(entries: Vec<ActionTypeEntry>) -> Self {
        let mut registry = Self::new();
        for entry in entries {
            registry.register(entry);
        }
        registry
    }
}

impl From<ActionTypeRegistry> for Vec<ActionTypeEntry> {
    fn from(registry: ActionTypeRegistry) -> Self {
        registry.list()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_loads_from_json_list() {
        let raw = r#"[
            {"action_type": "DELIV_DONE", "weight": 5.0, "predicate_id": "non_empty"},
            {"action_type": "GEO_VIOL", "weight": -10.0}
        ]"#;
        let registry: ActionTypeRegistry = serde_json::from_str(raw).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.weight(&ActionType::new("DELIV_DONE")), Some(5.0));
        assert_eq!(registry.predicate_id(&ActionType::new("DELIV_DONE")), Some("non_empty"));
        assert_eq!(registry.predicate_id(&ActionType::new("GEO_VIOL")), None);
        assert!(!registry.contains(&ActionType::new("TAMPER")));
    }

    #[test]
    fn default_catalog_weights_deliveries() {
        let registry = ActionTypeRegistry::default_catalog();
        assert_eq!(registry.weight(&"DELIV_DONE".into()), Some(5.0));
        assert!(registry.weight(&"TAMPER".into()).unwrap() < 0.0);
    }
}
