use converge_core::{EntityDefinition, Slot, Value};
use serde::Serialize;
use std::collections::BTreeMap;
use std::rc::Rc;

/// One finalized instance, flattened for downstream consumers. Attributes
/// carry either their value or `null` with the attribute name listed in
/// `unknowns`, so a deployment layer can mark dependent resources.
#[derive(Clone, Debug, Serialize)]
pub struct ResourceRecord {
    pub id: u32,
    pub entity: String,
    pub attributes: BTreeMap<String, serde_json::Value>,
    pub unknowns: Vec<String>,
}

/// The final model: entity fully qualified name to its finalized instances,
/// in creation order.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ModelExport {
    pub entities: BTreeMap<String, Vec<ResourceRecord>>,
}

impl ModelExport {
    pub fn instances_of(&self, entity: &str) -> &[ResourceRecord] {
        self.entities.get(entity).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Walk the frozen instance stores and emit the deployment representation.
/// Instances are listed under the entity they were constructed as; relation
/// values are instance ids.
pub fn export_model(entities: &[Rc<EntityDefinition>]) -> ModelExport {
    let mut export = ModelExport::default();
    for def in entities {
        let records: Vec<ResourceRecord> = def
            .instances()
            .into_iter()
            .filter(|instance| Rc::ptr_eq(instance.definition(), def))
            .map(|instance| {
                let mut attributes = BTreeMap::new();
                let mut unknowns = Vec::new();
                for name in def.member_order() {
                    let json = match instance.slot(&name) {
                        Some(Slot::Single(variable)) => match variable.value() {
                            Some(Value::Unknown) => {
                                unknowns.push(name.clone());
                                serde_json::Value::Null
                            }
                            Some(value) => value_to_json(&value),
                            None => serde_json::Value::Null,
                        },
                        Some(Slot::Multi(list)) => {
                            let values = list.values();
                            if list.multiplicity().is_scalar() {
                                values
                                    .first()
                                    .map(value_to_json)
                                    .unwrap_or(serde_json::Value::Null)
                            } else {
                                serde_json::Value::Array(
                                    values.iter().map(value_to_json).collect(),
                                )
                            }
                        }
                        None => serde_json::Value::Null,
                    };
                    attributes.insert(name, json);
                }
                ResourceRecord {
                    id: instance.id(),
                    entity: def.name().to_string(),
                    attributes,
                    unknowns,
                }
            })
            .collect();
        export.entities.insert(def.name().to_string(), records);
    }
    export
}

fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null | Value::Unknown => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::Number((*i).into()),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::List(items) => {
            serde_json::Value::Array(items.iter().map(value_to_json).collect())
        }
        Value::Instance(instance) => serde_json::json!({ "instance": instance.id() }),
        Value::Regex(r) => serde_json::Value::String(r.pattern().to_string()),
    }
}
