use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Partial description of an entity (actor, asset or animation): its id plus
/// whatever properties changed. Patches merge recursively, so the cached copy
/// of an entity is always the fold of every patch issued since creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub id: Uuid,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

pub type ActorPatch = Patch;
pub type AssetPatch = Patch;
pub type AnimationPatch = Patch;

impl Patch {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn merge(&mut self, other: &Patch) {
        merge_fields(&mut self.fields, &other.fields);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// `None` when the patch leaves the parent untouched, `Some(None)` when it
    /// detaches the actor (explicit null or the nil id).
    pub fn parent_change(&self) -> Option<Option<Uuid>> {
        self.fields.get("parentId").map(optional_uuid)
    }

    pub fn exclusive_to_user(&self) -> Option<Uuid> {
        self.fields.get("exclusiveToUser").and_then(optional_uuid)
    }

    pub fn has_rigid_body(&self) -> bool {
        matches!(self.fields.get("rigidBody"), Some(Value::Object(_)))
    }

    pub fn duration(&self) -> Option<f64> {
        self.fields.get("duration").and_then(Value::as_f64)
    }
}

/// Recursive merge: objects merge key by key, everything else (arrays,
/// scalars, explicit null) replaces the target.
pub fn merge_values(target: &mut Value, source: &Value) {
    match (target.as_object_mut(), source.as_object()) {
        (Some(target_obj), Some(source_obj)) => merge_fields(target_obj, source_obj),
        _ => *target = source.clone(),
    }
}

pub fn merge_fields(target: &mut Map<String, Value>, source: &Map<String, Value>) {
    for (key, source_value) in source {
        match target.get_mut(key) {
            Some(target_value) => merge_values(target_value, source_value),
            None => {
                target.insert(key.clone(), source_value.clone());
            }
        }
    }
}

fn optional_uuid(value: &Value) -> Option<Uuid> {
    value
        .as_str()
        .and_then(|raw| Uuid::parse_str(raw).ok())
        .filter(|id| !id.is_nil())
}
