use crate::schema::{AttrValue, Item};

/// The small expression algebra every conditional mutator is guarded by
/// (spec.md §4.2): `eq`, `not`, `exists`, `or`, `and`, `in_`, `begins_with`.
///
/// A predicate is evaluated against the item as it currently exists in the
/// store (an absent item evaluates every `exists`/`eq` to false). Backends
/// must evaluate it atomically with the mutation it guards.
#[derive(Debug, Clone)]
pub enum Predicate {
    Eq(String, AttrValue),
    Exists(String),
    BeginsWith(String, String),
    In(String, Vec<AttrValue>),
    Not(Box<Predicate>),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    /// Always holds; used for unconditional puts expressed through the
    /// conditional API so callers have one code path.
    Always,
}

impl Predicate {
    pub fn eq(attr: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        Predicate::Eq(attr.into(), value.into())
    }

    pub fn exists(attr: impl Into<String>) -> Self {
        Predicate::Exists(attr.into())
    }

    pub fn not_exists(attr: impl Into<String>) -> Self {
        Predicate::Not(Box::new(Predicate::Exists(attr.into())))
    }

    pub fn begins_with(attr: impl Into<String>, prefix: impl Into<String>) -> Self {
        Predicate::BeginsWith(attr.into(), prefix.into())
    }

    pub fn in_(attr: impl Into<String>, values: Vec<AttrValue>) -> Self {
        Predicate::In(attr.into(), values)
    }

    pub fn not(self) -> Self {
        Predicate::Not(Box::new(self))
    }

    pub fn and(preds: impl IntoIterator<Item = Predicate>) -> Self {
        Predicate::And(preds.into_iter().collect())
    }

    pub fn or(preds: impl IntoIterator<Item = Predicate>) -> Self {
        Predicate::Or(preds.into_iter().collect())
    }

    /// Evaluate against a possibly-absent item (`None` = no such row yet).
    pub fn evaluate(&self, item: Option<&Item>) -> bool {
        match self {
            Predicate::Always => true,
            Predicate::Eq(attr, value) => {
                item.and_then(|i| i.get(attr)).is_some_and(|v| v == value)
            }
            Predicate::Exists(attr) => item.is_some_and(|i| i.contains_key(attr)),
            Predicate::BeginsWith(attr, prefix) => item
                .and_then(|i| i.get(attr))
                .and_then(AttrValue::as_str)
                .is_some_and(|s| s.starts_with(prefix.as_str())),
            Predicate::In(attr, values) => item
                .and_then(|i| i.get(attr))
                .is_some_and(|v| values.contains(v)),
            Predicate::Not(inner) => !inner.evaluate(item),
            Predicate::And(preds) => preds.iter().all(|p| p.evaluate(item)),
            Predicate::Or(preds) => preds.iter().any(|p| p.evaluate(item)),
        }
    }

    /// Renders this predicate as the small `{"op": ...}` JSON tree the Redis
    /// backend's Lua guard-evaluator walks (see `redis_store.rs`). `AttrValue`
    /// leaves go through `serde_json::to_value`, the same externally-tagged
    /// shape (`{"s": ...}`, `{"n": ...}`, ...) already used to encode stored
    /// item attributes, so the script's `cjson.encode` equality check on a
    /// leaf compares like with like.
    pub fn to_script_value(&self) -> serde_json::Value {
        use serde_json::json;
        match self {
            Predicate::Always => json!({"op": "always"}),
            Predicate::Eq(attr, value) => json!({"op": "eq", "attr": attr, "value": value}),
            Predicate::Exists(attr) => json!({"op": "exists", "attr": attr}),
            Predicate::BeginsWith(attr, prefix) => {
                json!({"op": "begins_with", "attr": attr, "prefix": prefix})
            }
            Predicate::In(attr, values) => json!({"op": "in", "attr": attr, "values": values}),
            Predicate::Not(inner) => json!({"op": "not", "pred": inner.to_script_value()}),
            Predicate::And(preds) => {
                json!({"op": "and", "preds": preds.iter().map(Predicate::to_script_value).collect::<Vec<_>>()})
            }
            Predicate::Or(preds) => {
                json!({"op": "or", "preds": preds.iter().map(Predicate::to_script_value).collect::<Vec<_>>()})
            }
        }
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::S(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::S(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        AttrValue::N(value)
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        AttrValue::Bool(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item_with(pairs: &[(&str, AttrValue)]) -> Item {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn eq_requires_matching_attribute() {
        let item = item_with(&[("mid", AttrValue::S("m1".into()))]);
        assert!(Predicate::eq("mid", "m1").evaluate(Some(&item)));
        assert!(!Predicate::eq("mid", "m2").evaluate(Some(&item)));
        assert!(!Predicate::eq("mid", "m1").evaluate(None));
    }

    #[test]
    fn exists_and_not_exists() {
        let item = item_with(&[("mid", AttrValue::S("m1".into()))]);
        assert!(Predicate::exists("mid").evaluate(Some(&item)));
        assert!(Predicate::not_exists("other").evaluate(Some(&item)));
        assert!(Predicate::not_exists("mid").evaluate(None));
    }

    #[test]
    fn or_and_and_compose() {
        let item = item_with(&[("mid", AttrValue::S("t1".into()))]);
        let guard = Predicate::or([
            Predicate::eq("mid", "t1"),
            Predicate::not_exists("mid"),
        ]);
        assert!(guard.evaluate(Some(&item)));

        let guard2 = Predicate::and([Predicate::exists("mid"), Predicate::eq("mid", "t1")]);
        assert!(guard2.evaluate(Some(&item)));
    }

    #[test]
    fn to_script_value_tags_every_variant_with_an_op() {
        let always = Predicate::Always.to_script_value();
        assert_eq!(always["op"], "always");

        let guard = Predicate::and([Predicate::eq("mid", "m1"), Predicate::not_exists("cancel")]);
        let value = guard.to_script_value();
        assert_eq!(value["op"], "and");
        let preds = value["preds"].as_array().unwrap();
        assert_eq!(preds[0]["op"], "eq");
        assert_eq!(preds[0]["value"], serde_json::json!({"s": "m1"}));
        assert_eq!(preds[1]["op"], "not");
        assert_eq!(preds[1]["pred"]["op"], "exists");
    }

    #[test]
    fn begins_with_and_in() {
        let item = item_with(&[("eid", AttrValue::S("order-42@00000000000000000007".into()))]);
        assert!(Predicate::begins_with("eid", "order-42@").evaluate(Some(&item)));
        assert!(!Predicate::begins_with("eid", "order-7@").evaluate(Some(&item)));

        let item2 = item_with(&[("stat", AttrValue::S("Q".into()))]);
        assert!(Predicate::in_("stat", vec!["Q".into(), "L".into()]).evaluate(Some(&item2)));
        assert!(!Predicate::in_("stat", vec!["S".into(), "F".into()]).evaluate(Some(&item2)));
    }
}
